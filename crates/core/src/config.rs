//! Store configuration.

use std::time::Duration;

use crate::error::{Result, StoreError};

/// Configuration recognized by the store.
///
/// Plain data with fluent setters; validated once when the store is built.
///
/// ```
/// use topograph_core::StoreConfig;
///
/// let config = StoreConfig::default()
///     .root_key("/cluster-a")
///     .transaction_attempts(5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backend path root.
    pub root_key: String,
    /// Total commit attempts for `try_transaction`; retries = attempts − 1.
    pub transaction_attempts: u32,
    /// Topology lock acquisition timeout.
    pub lock_timeout: Duration,
    /// Namespace identifier for the state subsystem; host-derived by default.
    pub namespace: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            root_key: "/topograph".to_string(),
            transaction_attempts: 3,
            lock_timeout: Duration::from_secs(10),
            namespace: default_namespace(),
        }
    }
}

impl StoreConfig {
    pub fn root_key(mut self, root: impl Into<String>) -> Self {
        self.root_key = root.into();
        self
    }

    pub fn transaction_attempts(mut self, attempts: u32) -> Self {
        self.transaction_attempts = attempts;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Check the configuration before the store is built.
    pub fn validate(&self) -> Result<()> {
        if self.transaction_attempts == 0 {
            return Err(StoreError::internal(
                "transaction_attempts must be at least 1",
            ));
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(StoreError::internal(
                "namespace must be a non-empty single path segment",
            ));
        }
        Ok(())
    }
}

fn default_namespace() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty() && !h.contains('/'))
        .unwrap_or_else(|| "localhost".to_string())
}
