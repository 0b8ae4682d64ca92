//! Engine configuration
use super::error::{EngineError, Result};
use super::lock::LockPolicy;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DB_PATH_VAR: &str = "FUEL_DB_PATH";
pub const LOCK_WAIT_VAR: &str = "FUEL_LOCK_WAIT_MS";
pub const AUDIT_VAR: &str = "FUEL_AUDIT_BEFORE_CASCADE";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub lock_policy: LockPolicy,
    /// Report chain breaks that predate a cascade in its outcome.
    pub audit_before_cascade: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("fuel-reconciliation.db"),
            lock_policy: LockPolicy::FailFast,
            audit_before_cascade: true,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by the environment (and a `.env` file, if any).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(DB_PATH_VAR) {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(LOCK_WAIT_VAR) {
            let millis: u64 = raw.trim().parse().map_err(|_| {
                EngineError::Config(format!(
                    "{LOCK_WAIT_VAR}={raw:?} is not a number of milliseconds"
                ))
            })?;
            config.lock_policy = match millis {
                0 => LockPolicy::FailFast,
                ms => LockPolicy::Wait {
                    timeout: Duration::from_millis(ms),
                },
            };
        }
        if let Some(raw) = lookup(AUDIT_VAR) {
            config.audit_before_cascade = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(EngineError::Config(format!(
                        "{AUDIT_VAR}={raw:?} is not a boolean"
                    )));
                }
            };
        }
        Ok(config)
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (DB_PATH_VAR, "/tmp/fuel.db"),
            (LOCK_WAIT_VAR, "250"),
            (AUDIT_VAR, "off"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/fuel.db"));
        assert_eq!(
            config.lock_policy,
            LockPolicy::Wait {
                timeout: Duration::from_millis(250)
            }
        );
        assert!(!config.audit_before_cascade);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[(LOCK_WAIT_VAR, "soon")])),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[(AUDIT_VAR, "maybe")])),
            Err(EngineError::Config(_))
        ));
    }
}
