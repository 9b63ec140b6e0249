//! Agora operator configuration file handling.
//!
//! Operator settings only - paths, timeouts, cadence, logging. Secrets
//! never live in the TOML file: the nullifier secret and the receipt
//! signing key come from the environment (`NULLIFIER_SECRET`,
//! `RECEIPT_PRIVATE_KEY`). Poll definitions and audience rules belong to
//! the admin plane, not this file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use agora::anchor::AnchorConfig;
use agora::store::nonce::NonceTtls;
use agora::submission::SubmissionConfig;

/// Default log level
const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable carrying the keyed-hasher secret.
pub const NULLIFIER_SECRET_ENV: &str = "NULLIFIER_SECRET";

/// Environment variable carrying the base64 PKCS#8 Ed25519 signing key.
pub const RECEIPT_PRIVATE_KEY_ENV: &str = "RECEIPT_PRIVATE_KEY";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgoraConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub nonce: NonceConfig,
    #[serde(default)]
    pub votes: VotesConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub anchor: AnchorSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL for agora.db.
    pub url: String,
    pub statement_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:agora.db".to_string(),
            statement_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Active keyed hasher: "hmac" or "poseidon".
    pub hasher: String,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            hasher: "hmac".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceConfig {
    pub vote_ttl_secs: u64,
    pub challenge_ttl_secs: u64,
    pub enroll_liveness_ttl_secs: u64,
    pub admin_mfa_ttl_secs: u64,
    /// Hard timeout on every nonce-store round trip.
    pub store_timeout_secs: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            vote_ttl_secs: 60,
            challenge_ttl_secs: 60,
            enroll_liveness_ttl_secs: 300,
            admin_mfa_ttl_secs: 120,
            store_timeout_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VotesConfig {
    /// Vote timestamp bucket window, in seconds.
    pub bucket_seconds: u64,
    pub require_attestation: bool,
}

impl Default for VotesConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: 60,
            require_attestation: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Default k-anonymity floor for polls that do not set their own.
    pub k_default: u32,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self { k_default: 30 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSection {
    pub interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub max_attempts: u32,
}

impl Default for AnchorSection {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            backoff_base_secs: 30,
            backoff_cap_secs: 1800,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or EnvFilter string.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl AgoraConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: AgoraConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        Ok(config)
    }

    /// The keyed-hasher secret from the environment, if set.
    pub fn nullifier_secret(&self) -> Option<String> {
        std::env::var(NULLIFIER_SECRET_ENV).ok().filter(|s| !s.is_empty())
    }

    /// The receipt signing key (base64 PKCS#8) from the environment.
    pub fn receipt_private_key(&self) -> Option<String> {
        std::env::var(RECEIPT_PRIVATE_KEY_ENV)
            .ok()
            .filter(|s| !s.is_empty())
    }

    pub fn nonce_ttls(&self) -> NonceTtls {
        NonceTtls {
            challenge: Duration::from_secs(self.nonce.challenge_ttl_secs),
            vote: Duration::from_secs(self.nonce.vote_ttl_secs),
            enroll_liveness: Duration::from_secs(self.nonce.enroll_liveness_ttl_secs),
            admin_mfa: Duration::from_secs(self.nonce.admin_mfa_ttl_secs),
        }
    }

    pub fn submission_config(&self) -> SubmissionConfig {
        SubmissionConfig {
            bucket_seconds: self.votes.bucket_seconds,
            require_attestation: self.votes.require_attestation,
            db_timeout: Duration::from_secs(self.database.statement_timeout_secs),
        }
    }

    pub fn anchor_config(&self) -> AnchorConfig {
        AnchorConfig {
            interval: Duration::from_secs(self.anchor.interval_secs),
            backoff_base: Duration::from_secs(self.anchor.backoff_base_secs),
            backoff_cap: Duration::from_secs(self.anchor.backoff_cap_secs),
            max_attempts: self.anchor.max_attempts,
        }
    }

    /// Generate a commented default configuration.
    pub fn generate_default_toml() -> String {
        r#"# Agora configuration (operator settings)
#
# Secrets are NOT configured here. Provide them via environment:
#   NULLIFIER_SECRET     - keyed-hasher secret (required)
#   RECEIPT_PRIVATE_KEY  - base64 PKCS#8 Ed25519 signing key
#
# Poll definitions and audience rules are owned by the admin plane.

[database]
url = "sqlite:agora.db"
statement_timeout_secs = 5

[crypto]
# Keyed hasher: "hmac" or "poseidon". Changing this after launch changes
# every nullifier; never flip it on a live deployment.
hasher = "hmac"

[nonce]
vote_ttl_secs = 60
challenge_ttl_secs = 60
enroll_liveness_ttl_secs = 300
admin_mfa_ttl_secs = 120
store_timeout_secs = 2

[votes]
bucket_seconds = 60
require_attestation = false

[aggregation]
k_default = 30

[anchor]
interval_secs = 600
backoff_base_secs = 30
backoff_cap_secs = 1800
max_attempts = 5

[logging]
# Log level: trace, debug, info, warn, error
level = "info"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_spec() {
        let config = AgoraConfig::default();
        assert_eq!(config.crypto.hasher, "hmac");
        assert_eq!(config.votes.bucket_seconds, 60);
        assert_eq!(config.aggregation.k_default, 30);
        assert_eq!(config.anchor.interval_secs, 600);
        assert_eq!(config.nonce.vote_ttl_secs, 60);
        assert_eq!(config.nonce.enroll_liveness_ttl_secs, 300);
    }

    #[test]
    fn test_generated_default_parses() {
        let toml = AgoraConfig::generate_default_toml();
        let config: AgoraConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config.database.url, "sqlite:agora.db");
        // Secrets never appear in the file.
        assert!(!toml.contains("secret ="));
        assert!(!toml.contains("private_key ="));
    }

    #[test]
    fn test_load_partial_config_applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agora.toml");
        fs::write(&path, "[votes]\nbucket_seconds = 120\nrequire_attestation = true\n").unwrap();

        let config = AgoraConfig::load(&path).unwrap();
        assert_eq!(config.votes.bucket_seconds, 120);
        assert!(config.votes.require_attestation);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_duration_conversions() {
        let config = AgoraConfig::default();
        assert_eq!(config.nonce_ttls().vote, Duration::from_secs(60));
        assert_eq!(
            config.anchor_config().backoff_cap,
            Duration::from_secs(1800)
        );
        assert_eq!(
            config.submission_config().db_timeout,
            Duration::from_secs(5)
        );
    }
}
