//! Ambient configuration: store paths, webhook secret, and ledger/rate
//! limiter tuning, loaded from defaults, an optional file, and
//! environment overrides under the `SDC_` prefix.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdcConfig {
    /// Directory all JSON stores and ledgers are written under (
    /// "persisted store layout").
    pub data_dir: String,
    /// HMAC signing secret for inbound webhooks. Absent secrets degrade
    /// the validator to "unsigned validation" mode, logged explicitly
    /// ( "Environment variables").
    pub webhook_signing_secret: Option<String>,
    pub default_jurisdiction: String,
    pub anchor_timeout_secs: u64,
}

impl Default for SdcConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            webhook_signing_secret: None,
            default_jurisdiction: "US".to_string(),
            anchor_timeout_secs: crate::ledger_adapter::DEFAULT_ANCHOR_TIMEOUT_SECS,
        }
    }
}

impl SdcConfig {
    /// Layered load: compiled-in defaults, an optional `sdc.toml` in the
    /// current directory, then `SDC_*` environment variables, each layer
    /// overriding the last.
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let settings = config::Config::builder()
            .set_default("data_dir", defaults.data_dir.clone())?
            .set_default("default_jurisdiction", defaults.default_jurisdiction.clone())?
            .set_default("anchor_timeout_secs", defaults.anchor_timeout_secs as i64)?
            .add_source(config::File::with_name("sdc").required(false))
            .add_source(config::Environment::with_prefix("SDC"))
            .build()?;

        let data_dir = settings.get_string("data_dir").unwrap_or(defaults.data_dir);
        let default_jurisdiction = settings.get_string("default_jurisdiction").unwrap_or(defaults.default_jurisdiction);
        let anchor_timeout_secs = settings
            .get_int("anchor_timeout_secs")
            .map(|v| v as u64)
            .unwrap_or(defaults.anchor_timeout_secs);
        let webhook_signing_secret = settings.get_string("webhook_signing_secret").ok();

        Ok(Self {
            data_dir,
            webhook_signing_secret,
            default_jurisdiction,
            anchor_timeout_secs,
        })
    }

    pub fn store_path(&self, file_name: &str) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join(file_name)
    }

    pub fn perimeter_ledger_path(&self) -> std::path::PathBuf {
        self.store_path("perimeter-ledger.json")
    }

    pub fn access_ledger_path(&self) -> std::path::PathBuf {
        self.store_path("sdc-access-ledger.json")
    }

    pub fn conversation_ledger_path(&self) -> std::path::PathBuf {
        self.store_path("sca-conversation-ledger.json")
    }

    pub fn intake_path(&self) -> std::path::PathBuf {
        self.store_path("sdc-intake.json")
    }

    pub fn tokens_path(&self) -> std::path::PathBuf {
        self.store_path("sdc-tokens.json")
    }

    pub fn export_log_path(&self) -> std::path::PathBuf {
        self.store_path("sdc-export-log.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_derive_sane_store_paths() {
        let cfg = SdcConfig::default();
        assert_eq!(cfg.perimeter_ledger_path(), std::path::Path::new("./data/perimeter-ledger.json"));
        assert_eq!(cfg.tokens_path(), std::path::Path::new("./data/sdc-tokens.json"));
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("SDC_DATA_DIR", "/tmp/sdc-test-data");
        let cfg = SdcConfig::load().unwrap();
        assert_eq!(cfg.data_dir, "/tmp/sdc-test-data");
        std::env::remove_var("SDC_DATA_DIR");
    }
}
