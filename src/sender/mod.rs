//! Delivery to collectors and commit tracking

pub mod collectors;
pub mod commit;
pub mod coordinator;
pub mod http;
pub mod reset;

pub use collectors::{CollectorClient, CollectorList, HttpCollectorClient};
pub use commit::{CommitListEntry, DelayedCommit};
pub use coordinator::CommitCoordinator;
pub use http::{HttpSender, SenderSettings};
pub use reset::ResetMonitor;
