// src/adaptor/mod.rs
//! Adaptor capability layer
//!
//! The agent treats every data source (file tailer, exec, syslog, ...) as an
//! opaque adaptor behind one trait. Concrete sources register a constructor
//! with the [`AdaptorFactory`] under a class name.

mod types;

pub mod const_rate;
pub mod naming;

pub use types::*;

use crate::error::AdaptorError;
use std::collections::HashMap;
use std::sync::Arc;

/// Adaptor capability trait
pub trait Adaptor: Send + Sync {
    /// Parse the add-command parameters without starting.
    ///
    /// Returns the stream name, the part of the parameters that determines
    /// uniqueness. It feeds id synthesis.
    fn parse_args(&mut self, data_type: &str, params: &str) -> Result<String, AdaptorError>;

    /// Begin producing chunks at `ctx.offset`
    fn start(&mut self, ctx: StartContext) -> Result<(), AdaptorError>;

    /// Human-readable state; includes the data type but not class name or offset
    fn current_status(&self) -> String;

    /// Parameters that, passed back through `parse_args`, reproduce this
    /// adaptor exactly. `None` means the parameters given at add time do.
    fn restart_params(&self) -> Option<String> {
        None
    }

    /// Stop the adaptor; returns the stream offset reached
    fn shutdown(&mut self, policy: ShutdownPolicy) -> Result<u64, AdaptorError>;
}

type Constructor = Arc<dyn Fn() -> Box<dyn Adaptor> + Send + Sync>;

/// Maps class-name strings to adaptor constructors
#[derive(Clone, Default)]
pub struct AdaptorFactory {
    constructors: HashMap<String, Constructor>,
}

impl AdaptorFactory {
    /// Empty factory with no known classes
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory preloaded with the adaptors shipped in this crate
    pub fn with_builtin() -> Self {
        let mut factory = Self::new();
        // Fresh factory, so the name can't collide
        let _ = factory.register(const_rate::CLASS_NAME, || {
            Box::new(const_rate::ConstRateAdaptor::new())
        });
        factory
    }

    /// Register a constructor under `class_name`
    pub fn register<F>(&mut self, class_name: &str, constructor: F) -> Result<(), AdaptorError>
    where
        F: Fn() -> Box<dyn Adaptor> + Send + Sync + 'static,
    {
        if self.constructors.contains_key(class_name) {
            return Err(AdaptorError::DuplicateClass(class_name.to_string()));
        }
        self.constructors
            .insert(class_name.to_string(), Arc::new(constructor));
        Ok(())
    }

    /// Instantiate an unconfigured adaptor.
    ///
    /// Tries the name as given, then the short name after the last `.`, so
    /// fully qualified names written by older agents still resolve.
    pub fn create(&self, class_name: &str) -> Result<Box<dyn Adaptor>, AdaptorError> {
        if let Some(ctor) = self.constructors.get(class_name) {
            return Ok(ctor());
        }
        if let Some((_, short)) = class_name.rsplit_once('.') {
            if let Some(ctor) = self.constructors.get(short) {
                return Ok(ctor());
            }
        }
        Err(AdaptorError::UnknownClass(class_name.to_string()))
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    /// Registered class names, sorted
    pub fn class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}
