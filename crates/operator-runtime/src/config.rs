//! Operator configuration from environment variables

use crate::error::OperatorError;
use crate::watcher::DEFAULT_RECONNECT_DELAY;
use std::path::PathBuf;
use std::time::Duration;

/// Default timeout of the write client.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Namespace to watch; `None` watches all namespaces
    pub namespace: Option<String>,
    /// Kubeconfig for watches and writes; `None` infers it (`~/.kube/config`, then in-cluster)
    pub kubeconfig: Option<PathBuf>,
    /// Delay before reopening a watch that ended cleanly
    pub reconnect_delay: Duration,
    /// Timeout for status, finalizer and CRD requests
    pub write_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            kubeconfig: None,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

impl OperatorConfig {
    /// Reads `WATCH_NAMESPACE`, `KUBECONFIG`, `WATCH_RECONNECT_DELAY_MS` and
    /// `WRITE_TIMEOUT_SECS` from the process environment.
    pub fn from_env() -> Result<Self, OperatorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, OperatorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut config = Self {
            namespace: non_empty("WATCH_NAMESPACE").map(|v| v.trim().to_string()),
            // KUBECONFIG may list several files; the first one is used.
            kubeconfig: non_empty("KUBECONFIG")
                .and_then(|v| v.split(':').find(|p| !p.is_empty()).map(PathBuf::from)),
            ..Self::default()
        };

        if let Some(raw) = non_empty("WATCH_RECONNECT_DELAY_MS") {
            config.reconnect_delay =
                Duration::from_millis(parse_number("WATCH_RECONNECT_DELAY_MS", &raw)?);
        }
        if let Some(raw) = non_empty("WRITE_TIMEOUT_SECS") {
            let secs = parse_number("WRITE_TIMEOUT_SECS", &raw)?;
            if secs == 0 {
                return Err(OperatorError::InvalidConfig(
                    "WRITE_TIMEOUT_SECS must be greater than 0".to_string(),
                ));
            }
            config.write_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64, OperatorError> {
    raw.trim().parse().map_err(|e| {
        OperatorError::InvalidConfig(format!("{key} must be a non-negative integer, got {raw:?}: {e}"))
    })
}
