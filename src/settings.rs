//! Validated, immutable Service Provider settings.
//!
//! [`Settings`] is built once from an [`SpConfig`]. Certificates and keys are
//! loaded and parsed during construction; every invalid combination of
//! options fails here with [`SamlError::Configuration`] instead of at the
//! first request that needs it.

use std::sync::LazyLock;

use chrono::{Duration, Utc};
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use regex::Regex;

use crate::{
    bindings::Binding,
    config::{MetadataConfig, PemSource, SecurityConfig, SpConfig},
    constants::name_id_format,
    crypto::{
        SignatureAlgorithm, SigningCredentials, TrustAnchors, load_private_key,
        normalize_fingerprint, parse_certificate,
    },
    error::{SamlError, SamlResult},
};

static DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?P(\d+Y)?(\d+M)?(\d+D)?(T(\d+H)?(\d+M)?(\d+(\.\d+)?S)?)?$")
        .expect("valid duration pattern")
});

/// Whether `value` is a syntactically valid `xs:duration`.
pub fn is_valid_duration(value: &str) -> bool {
    DURATION_PATTERN.is_match(value) && !value.ends_with('P') && !value.ends_with('T')
}

#[derive(Debug)]
pub struct Settings {
    sp_entity_id: String,
    acs_url: String,
    sls_url: Option<String>,
    name_id_format: String,
    sp_certificate: Option<X509>,
    sp_new_certificate: Option<X509>,
    sp_private_key: Option<PKey<Private>>,
    signing: Option<SigningCredentials>,

    idp_entity_id: String,
    idp_sso_url: Option<String>,
    idp_sso_binding: Binding,
    idp_slo_url: Option<String>,
    idp_slo_response_url: Option<String>,
    idp_slo_binding: Binding,
    trust: TrustAnchors,

    security: SecurityConfig,
    metadata: MetadataConfig,
}

impl Settings {
    /// Validate `config` and load its key material.
    pub fn from_config(config: &SpConfig) -> SamlResult<Self> {
        let sp = &config.sp;
        let idp = &config.idp;
        let security = &config.security;

        let sp_entity_id = required("sp.entity_id", &sp.entity_id)?;
        let idp_entity_id = required("idp.entity_id", &idp.entity_id)?;

        let acs_url = checked_url("sp.acs_url", &sp.acs_url)?;
        let sls_url = optional_url("sp.sls_url", sp.sls_url.as_deref())?;
        let idp_sso_url = optional_url("idp.sso_url", idp.sso_url.as_deref())?;
        let idp_slo_url = optional_url("idp.slo_url", idp.slo_url.as_deref())?;
        let idp_slo_response_url =
            optional_url("idp.slo_response_url", idp.slo_response_url.as_deref())?;

        let sp_certificate = sp
            .certificate
            .as_ref()
            .map(|source| load_certificate("sp.certificate", source))
            .transpose()?;
        let sp_new_certificate = sp
            .new_certificate
            .as_ref()
            .map(|source| load_certificate("sp.new_certificate", source))
            .transpose()?;
        let sp_private_key = sp
            .private_key
            .as_ref()
            .map(|source| {
                let pem = read_pem("sp.private_key", source)?;
                load_private_key(&pem)
                    .map_err(|e| SamlError::Configuration(format!("sp.private_key: {}", e)))
            })
            .transpose()?;

        if let (Some(cert), Some(key)) = (&sp_certificate, &sp_private_key) {
            let public = cert.public_key().map_err(|e| {
                SamlError::Configuration(format!("sp.certificate has no usable public key: {}", e))
            })?;
            if !public.public_eq(key) {
                return Err(SamlError::Configuration(
                    "sp.private_key does not match sp.certificate".into(),
                ));
            }
        }

        let idp_certificates = idp
            .certificates
            .iter()
            .enumerate()
            .map(|(i, source)| load_certificate(&format!("idp.certificates[{}]", i), source))
            .collect::<SamlResult<Vec<_>>>()?;
        let fingerprint = match idp.certificate_fingerprint.as_deref() {
            Some(value) => {
                let normalized = normalize_fingerprint(value);
                if normalized.is_empty() {
                    return Err(SamlError::Configuration(
                        "idp.certificate_fingerprint is not a hex fingerprint".into(),
                    ));
                }
                Some(normalized)
            }
            None => None,
        };
        let trust = TrustAnchors {
            certificates: idp_certificates,
            fingerprint,
            fingerprint_algorithm: idp.fingerprint_algorithm,
        };
        if trust.is_empty() {
            return Err(SamlError::Configuration(
                "an IdP certificate or certificate fingerprint is required".into(),
            ));
        }

        let signing = match (&sp_private_key, &sp_certificate) {
            (Some(key), Some(certificate)) => {
                let signature_algorithm = match security.signature_algorithm {
                    Some(algorithm) if !algorithm.matches_key(key) => {
                        return Err(SamlError::Configuration(format!(
                            "security.signature_algorithm {} does not match the SP key type",
                            algorithm.uri()
                        )));
                    }
                    Some(algorithm) => algorithm,
                    None => SignatureAlgorithm::default_for_key(key),
                };
                Some(SigningCredentials {
                    key: key.clone(),
                    certificate: certificate.clone(),
                    signature_algorithm,
                    digest_algorithm: security.digest_algorithm,
                })
            }
            _ => None,
        };

        for (enabled, flag) in [
            (security.authn_requests_signed, "authn_requests_signed"),
            (security.logout_requests_signed, "logout_requests_signed"),
            (security.logout_responses_signed, "logout_responses_signed"),
            (security.sign_metadata, "sign_metadata"),
        ] {
            if enabled && signing.is_none() {
                return Err(SamlError::Configuration(format!(
                    "security.{} requires sp.private_key and sp.certificate",
                    flag
                )));
            }
        }
        if (security.want_assertions_encrypted || security.want_name_id_encrypted)
            && sp_private_key.is_none()
        {
            return Err(SamlError::Configuration(
                "encrypted assertions or NameIDs require sp.private_key".into(),
            ));
        }
        if security.name_id_encrypted && !trust.has_certificates() {
            return Err(SamlError::Configuration(
                "security.name_id_encrypted requires an IdP certificate".into(),
            ));
        }
        if security.request_id_ttl_secs == 0 {
            return Err(SamlError::Configuration(
                "security.request_id_ttl_secs must be greater than zero".into(),
            ));
        }
        if let Some(signing) = &signing
            && signing.signature_algorithm.is_deprecated()
        {
            tracing::warn!(
                algorithm = signing.signature_algorithm.uri(),
                "Outbound messages will be signed with a deprecated algorithm"
            );
        }

        let metadata = &config.metadata;
        if let Some(valid_until) = metadata.valid_until
            && valid_until <= Utc::now()
        {
            return Err(SamlError::Configuration(format!(
                "metadata.valid_until {} is in the past",
                valid_until
            )));
        }
        if let Some(duration) = metadata.cache_duration.as_deref()
            && !is_valid_duration(duration)
        {
            return Err(SamlError::Configuration(format!(
                "metadata.cache_duration '{}' is not an xs:duration",
                duration
            )));
        }
        if let Some(organization) = &metadata.organization {
            checked_url("metadata.organization.url", &organization.url)?;
        }

        let name_id_format = sp
            .name_id_format
            .clone()
            .unwrap_or_else(|| name_id_format::EMAIL_ADDRESS.to_string());

        tracing::debug!(
            sp_entity_id = %sp_entity_id,
            idp_entity_id = %idp_entity_id,
            idp_certificates = trust.certificates.len(),
            fingerprint_trust = trust.fingerprint.is_some(),
            signing = signing.is_some(),
            "Loaded SAML settings"
        );

        Ok(Self {
            sp_entity_id,
            acs_url,
            sls_url,
            name_id_format,
            sp_certificate,
            sp_new_certificate,
            sp_private_key,
            signing,
            idp_entity_id,
            idp_sso_url,
            idp_sso_binding: idp.sso_binding,
            idp_slo_url,
            idp_slo_response_url,
            idp_slo_binding: idp.slo_binding,
            trust,
            security: security.clone(),
            metadata: metadata.clone(),
        })
    }

    pub fn sp_entity_id(&self) -> &str {
        &self.sp_entity_id
    }

    pub fn acs_url(&self) -> &str {
        &self.acs_url
    }

    pub fn sls_url(&self) -> Option<&str> {
        self.sls_url.as_deref()
    }

    pub fn name_id_format(&self) -> &str {
        &self.name_id_format
    }

    pub fn sp_certificate(&self) -> Option<&X509> {
        self.sp_certificate.as_ref()
    }

    pub fn sp_new_certificate(&self) -> Option<&X509> {
        self.sp_new_certificate.as_ref()
    }

    pub fn sp_private_key(&self) -> Option<&PKey<Private>> {
        self.sp_private_key.as_ref()
    }

    /// Key, certificate and algorithms for outbound signatures, when both an
    /// SP key and certificate are configured.
    pub fn signing_credentials(&self) -> Option<&SigningCredentials> {
        self.signing.as_ref()
    }

    pub fn idp_entity_id(&self) -> &str {
        &self.idp_entity_id
    }

    pub fn idp_sso_url(&self) -> Option<&str> {
        self.idp_sso_url.as_deref()
    }

    pub fn idp_sso_binding(&self) -> Binding {
        self.idp_sso_binding
    }

    pub fn idp_slo_url(&self) -> Option<&str> {
        self.idp_slo_url.as_deref()
    }

    /// Where LogoutResponses go: the dedicated response URL, else the SLO URL.
    pub fn idp_slo_response_url(&self) -> Option<&str> {
        self.idp_slo_response_url.as_deref().or(self.idp_slo_url.as_deref())
    }

    pub fn idp_slo_binding(&self) -> Binding {
        self.idp_slo_binding
    }

    pub fn idp_certificates(&self) -> &[X509] {
        &self.trust.certificates
    }

    pub fn trust(&self) -> &TrustAnchors {
        &self.trust
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    pub fn metadata(&self) -> &MetadataConfig {
        &self.metadata
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::seconds(i64::try_from(self.security.clock_skew_secs).unwrap_or(i64::MAX))
    }

    pub fn request_id_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.security.request_id_ttl_secs).unwrap_or(i64::MAX))
    }
}

fn required(name: &str, value: &str) -> SamlResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SamlError::Configuration(format!("{} must not be empty", name)));
    }
    Ok(value.to_string())
}

fn checked_url(name: &str, value: &str) -> SamlResult<String> {
    let value = required(name, value)?;
    url::Url::parse(&value)
        .map_err(|e| SamlError::Configuration(format!("{} is not a valid URL: {}", name, e)))?;
    Ok(value)
}

fn optional_url(name: &str, value: Option<&str>) -> SamlResult<Option<String>> {
    value.map(|v| checked_url(name, v)).transpose()
}

fn read_pem(name: &str, source: &PemSource) -> SamlResult<String> {
    source.load().map_err(|e| {
        SamlError::Configuration(format!("{}: failed to read {}: {}", name, source.describe(), e))
    })
}

fn load_certificate(name: &str, source: &PemSource) -> SamlResult<X509> {
    let pem = read_pem(name, source)?;
    parse_certificate(&pem).map_err(|e| SamlError::Configuration(format!("{}: {}", name, e)))
}
