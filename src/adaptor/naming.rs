//! Adaptor id synthesis
//!
//! Ids that the user doesn't supply are derived from the adaptor's content,
//! so that re-issuing the same add command names the same adaptor:
//! - class name
//! - data type
//! - stream name (as returned by the adaptor's argument parser)

use sha2::{Digest, Sha256};

/// Every adaptor id carries this prefix
pub const ADAPTOR_ID_PREFIX: &str = "adaptor_";

/// Derive a deterministic adaptor id from its identifying content
pub fn synthesize_adaptor_id(class_name: &str, data_type: &str, stream_name: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [class_name, data_type, stream_name] {
        // length-prefixed so ("ab", "c") and ("a", "bc") differ
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();

    let mut id = String::with_capacity(ADAPTOR_ID_PREFIX.len() + digest.len() * 2);
    id.push_str(ADAPTOR_ID_PREFIX);
    for byte in digest.iter() {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}

/// Add the `adaptor_` prefix to a user-supplied id if it is missing
pub fn sanitize_adaptor_id(id: &str) -> String {
    if id.starts_with(ADAPTOR_ID_PREFIX) {
        id.to_string()
    } else {
        format!("{}{}", ADAPTOR_ID_PREFIX, id)
    }
}
