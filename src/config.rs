use crate::error::{PaymentError, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Default validity window for a freshly issued reference.
pub const DEFAULT_REFERENCE_VALIDITY_HOURS: i64 = 72;
/// Default period between expiration sweeps.
pub const DEFAULT_SWEEP_INTERVAL_HOURS: u64 = 24;
/// Default bound on any single store, ledger or audit call.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
/// Default age after which an unfinished webhook claim may be taken over.
pub const DEFAULT_WEBHOOK_CLAIM_LEASE_SECS: i64 = 300;
pub const DEFAULT_REFERENCE_PREFIX: &str = "SPEI";

const MAX_REFERENCE_VALIDITY_HOURS: i64 = 24 * 366;
const MAX_SWEEP_INTERVAL_HOURS: u64 = 24 * 366;
const MAX_STORE_TIMEOUT_MS: u64 = 10 * 60 * 1_000;
const MAX_WEBHOOK_CLAIM_LEASE_SECS: i64 = 24 * 3600;

/// Runtime settings, loaded from an optional TOML file.
///
/// ```toml
/// reference_prefix = "COL"
/// reference_validity_hours = 48
/// webhook_secret = "whsec_..."
/// webhook_api_keys = ["bank-key-1"]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub reference_prefix: String,
    pub reference_validity_hours: i64,
    pub sweep_interval_hours: u64,
    pub store_timeout_ms: u64,
    pub webhook_claim_lease_secs: i64,
    /// Settle pending references confirmed after their validity window.
    pub accept_late_payments: bool,
    pub webhook_secret: Option<String>,
    pub webhook_api_keys: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reference_prefix: DEFAULT_REFERENCE_PREFIX.to_string(),
            reference_validity_hours: DEFAULT_REFERENCE_VALIDITY_HOURS,
            sweep_interval_hours: DEFAULT_SWEEP_INTERVAL_HOURS,
            store_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            webhook_claim_lease_secs: DEFAULT_WEBHOOK_CLAIM_LEASE_SECS,
            accept_late_payments: false,
            webhook_secret: None,
            webhook_api_keys: Vec::new(),
        }
    }
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| PaymentError::ConfigError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reference_prefix.is_empty()
            || !self.reference_prefix.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(PaymentError::ConfigError(
                "reference_prefix must be non-empty and alphanumeric".to_string(),
            ));
        }
        if !(1..=MAX_REFERENCE_VALIDITY_HOURS).contains(&self.reference_validity_hours) {
            return Err(PaymentError::ConfigError(format!(
                "reference_validity_hours must be between 1 and {}",
                MAX_REFERENCE_VALIDITY_HOURS
            )));
        }
        if !(1..=MAX_SWEEP_INTERVAL_HOURS).contains(&self.sweep_interval_hours) {
            return Err(PaymentError::ConfigError(format!(
                "sweep_interval_hours must be between 1 and {}",
                MAX_SWEEP_INTERVAL_HOURS
            )));
        }
        if !(1..=MAX_STORE_TIMEOUT_MS).contains(&self.store_timeout_ms) {
            return Err(PaymentError::ConfigError(format!(
                "store_timeout_ms must be between 1 and {}",
                MAX_STORE_TIMEOUT_MS
            )));
        }
        if !(1..=MAX_WEBHOOK_CLAIM_LEASE_SECS).contains(&self.webhook_claim_lease_secs) {
            return Err(PaymentError::ConfigError(format!(
                "webhook_claim_lease_secs must be between 1 and {}",
                MAX_WEBHOOK_CLAIM_LEASE_SECS
            )));
        }
        Ok(())
    }

    /// Saturates instead of panicking on values `validate` would reject.
    pub fn reference_validity(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.reference_validity_hours).unwrap_or(chrono::Duration::MAX)
    }

    /// Clamped to the longest interval `validate` accepts.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours.min(MAX_SWEEP_INTERVAL_HOURS) * 3600)
    }

    pub fn webhook_claim_lease(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.webhook_claim_lease_secs)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.reference_validity(), chrono::Duration::hours(72));
        assert_eq!(settings.sweep_interval(), Duration::from_secs(86_400));
        assert!(!settings.accept_late_payments);
        assert_eq!(settings.webhook_claim_lease(), chrono::Duration::minutes(5));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            "reference_validity_hours = 1\nwebhook_api_keys = [\"k1\"]\n",
        )
        .unwrap();
        assert_eq!(settings.reference_validity_hours, 1);
        assert_eq!(settings.webhook_api_keys, vec!["k1".to_string()]);
        assert_eq!(settings.reference_prefix, "SPEI");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Settings::from_toml("reference_validity_hours = 0").is_err());
        assert!(Settings::from_toml("reference_prefix = \"SP-EI\"").is_err());
        assert!(Settings::from_toml("unknown_key = 1").is_err());
        assert!(Settings::from_toml("webhook_claim_lease_secs = 0").is_err());
    }

    #[test]
    fn test_rejects_out_of_range_windows() {
        for text in [
            "reference_validity_hours = 10000000000",
            "sweep_interval_hours = 100000",
            "store_timeout_ms = 86400000",
            "webhook_claim_lease_secs = 9223372036854775807",
        ] {
            assert!(
                matches!(Settings::from_toml(text), Err(PaymentError::ConfigError(_))),
                "{text} should be rejected"
            );
        }
        assert!(Settings::from_toml("reference_validity_hours = 8784").is_ok());
    }

    #[test]
    fn test_unvalidated_windows_saturate() {
        let settings = Settings {
            reference_validity_hours: i64::MAX,
            sweep_interval_hours: u64::MAX,
            ..Settings::default()
        };
        assert_eq!(settings.reference_validity(), chrono::Duration::MAX);
        assert_eq!(
            settings.sweep_interval(),
            Duration::from_secs(MAX_SWEEP_INTERVAL_HOURS * 3600)
        );
    }
}
