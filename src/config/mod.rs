//! Configuration for the SAML Service Provider.
//!
//! The SP is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [sp]
//! entity_id = "https://sp.example.com/saml/metadata"
//! acs_url = "https://sp.example.com/saml/acs"
//! sls_url = "https://sp.example.com/saml/sls"
//! certificate = { path = "/etc/saml/sp.crt" }
//! private_key = { pem = "${SP_PRIVATE_KEY}" }
//!
//! [idp]
//! entity_id = "https://idp.example.com"
//! sso_url = "https://idp.example.com/sso"
//! certificates = [{ path = "/etc/saml/idp.crt" }]
//!
//! [security]
//! want_assertions_signed = true
//! ```

mod metadata;
mod observability;
mod provider;
mod security;

use std::{path::Path, sync::LazyLock};

pub use metadata::*;
pub use observability::*;
pub use provider::*;
use regex::Regex;
pub use security::*;
use serde::{Deserialize, Serialize};

/// Root configuration.
///
/// `[sp]` and `[idp]` are required; the other sections have defaults.
/// Semantic checks that need the key material (key/certificate pairing,
/// required signing keys) happen in [`crate::settings::Settings::from_config`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpConfig {
    /// This Service Provider.
    pub sp: ServiceProviderConfig,

    /// The trusted Identity Provider.
    pub idp: IdentityProviderConfig,

    /// Signing, encryption and validation policy.
    #[serde(default)]
    pub security: SecurityConfig,

    /// Optional metadata content (organization, contacts, validity).
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Logging configuration for the binary.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SpConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: SpConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that need no key material.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.sp.entity_id.trim().is_empty() {
            return Err(ConfigError::Validation("sp.entity_id must not be empty".into()));
        }
        if self.idp.entity_id.trim().is_empty() {
            return Err(ConfigError::Validation("idp.entity_id must not be empty".into()));
        }
        if self.security.request_id_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "security.request_id_ttl_secs must be greater than zero".into(),
            ));
        }
        if self.idp.certificates.is_empty() && self.idp.certificate_fingerprint.is_none() {
            return Err(ConfigError::Validation(
                "idp.certificates or idp.certificate_fingerprint is required".into(),
            ));
        }
        for contact in &self.metadata.contacts {
            if contact.given_name.is_none() && contact.email_address.is_none() {
                return Err(ConfigError::Validation(format!(
                    "{} contact needs a given_name or email_address",
                    contact.contact_type.as_str()
                )));
            }
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("valid env var pattern"));

/// Expand `${VAR_NAME}` references. References after a `#` on the same line
/// are left alone.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in ENV_VAR_PATTERN.captures_iter(line) {
            let Some(whole) = cap.get(0) else { continue };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);

            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
