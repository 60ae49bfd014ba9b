//! Shared handle bundle threaded through every resource constructor.
//!
//! A [`Context`] carries the native runtime, the authorization policy and the
//! core configuration. Cloning is cheap (two `Arc`s plus a small config).

use std::sync::Arc;

use crate::config::CoreConfig;
use crate::policy::{AccessPolicy, AllowAll};
use crate::runtime::NativeRuntime;

#[derive(Clone)]
pub struct Context {
    runtime: Arc<dyn NativeRuntime>,
    policy: Arc<dyn AccessPolicy>,
    config: CoreConfig,
}

impl Context {
    /// Context over the given runtime with the permissive default policy and
    /// default configuration.
    pub fn new(runtime: Arc<dyn NativeRuntime>) -> Self {
        Self {
            runtime,
            policy: Arc::new(AllowAll),
            config: CoreConfig::default(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn NativeRuntime> {
        &self.runtime
    }

    pub fn policy(&self) -> &dyn AccessPolicy {
        self.policy.as_ref()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
