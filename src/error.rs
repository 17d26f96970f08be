use std::fmt;

use crate::{
    bindings::BindingError,
    crypto::{CryptoError, dsig::SignatureError, xmlenc::EncryptionError},
    store::StoreError,
    xml::XmlError,
};

/// Result type for operations that abort on the first error.
pub type SamlResult<T> = Result<T, SamlError>;

/// Result type for message processing, which collects every validation
/// failure before giving up.
pub type ValidationResult<T> = Result<T, ValidationFailure>;

/// Why an otherwise well-formed, correctly signed message was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationReason {
    /// Validity window ended (`NotOnOrAfter`, `SessionNotOnOrAfter`)
    Expired,

    /// Validity window has not started yet (`NotBefore`)
    NotYetValid,

    /// SP entity ID missing from the audience restrictions
    AudienceMismatch,

    /// `Destination` or `Recipient` is not this SP's endpoint
    DestinationMismatch,

    /// `InResponseTo` does not match an outstanding request
    UnsolicitedResponse,

    /// Issuer is not the configured IdP
    IssuerMismatch,

    /// No usable bearer subject confirmation
    SubjectConfirmation,

    /// Encryption required by the SP's security settings is missing
    EncryptionRequired,

    /// The same attribute name appears twice
    DuplicateAttribute,

    /// Top-level status is not `Success`
    StatusNotSuccess,
}

impl ValidationReason {
    pub fn code(self) -> &'static str {
        match self {
            ValidationReason::Expired => "expired",
            ValidationReason::NotYetValid => "not_yet_valid",
            ValidationReason::AudienceMismatch => "audience_mismatch",
            ValidationReason::DestinationMismatch => "destination_mismatch",
            ValidationReason::UnsolicitedResponse => "unsolicited_response",
            ValidationReason::IssuerMismatch => "issuer_mismatch",
            ValidationReason::SubjectConfirmation => "subject_confirmation",
            ValidationReason::EncryptionRequired => "encryption_required",
            ValidationReason::DuplicateAttribute => "duplicate_attribute",
            ValidationReason::StatusNotSuccess => "status_not_success",
        }
    }
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SamlError {
    /// Settings are invalid or incomplete. Raised at construction, or when an
    /// operation needs an endpoint that was never configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The binding or XML could not be decoded or lacks required structure.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("signature verification failed: {0}")]
    SignatureVerification(String),

    #[error("validation failed ({reason}): {detail}")]
    Validation {
        reason: ValidationReason,
        detail: String,
    },

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("metadata failed schema validation: {}", .0.join("; "))]
    MetadataSchema(Vec<String>),

    #[error("request ID store error: {0}")]
    Store(#[from] StoreError),

    #[error("session teardown failed: {0}")]
    SessionTeardown(String),
}

impl SamlError {
    pub fn validation(reason: ValidationReason, detail: impl Into<String>) -> Self {
        SamlError::Validation {
            reason,
            detail: detail.into(),
        }
    }

    pub fn reason(&self) -> Option<ValidationReason> {
        match self {
            SamlError::Validation { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<BindingError> for SamlError {
    fn from(e: BindingError) -> Self {
        SamlError::MalformedMessage(e.to_string())
    }
}

impl From<XmlError> for SamlError {
    fn from(e: XmlError) -> Self {
        SamlError::MalformedMessage(e.to_string())
    }
}

impl From<SignatureError> for SamlError {
    fn from(e: SignatureError) -> Self {
        SamlError::SignatureVerification(e.to_string())
    }
}

impl From<EncryptionError> for SamlError {
    fn from(e: EncryptionError) -> Self {
        SamlError::Decryption(e.to_string())
    }
}

impl From<CryptoError> for SamlError {
    fn from(e: CryptoError) -> Self {
        SamlError::Configuration(e.to_string())
    }
}

/// Every error found while processing one inbound message, in the order
/// they were detected.
#[derive(Debug)]
pub struct ValidationFailure {
    errors: Vec<SamlError>,
}

impl ValidationFailure {
    /// Build a failure from collected errors. Returns `None` when there are none.
    pub fn from_errors(errors: Vec<SamlError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self { errors })
        }
    }

    pub fn errors(&self) -> &[SamlError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<SamlError> {
        self.errors
    }

    /// The error to show a user: the last one recorded.
    pub fn last_error(&self) -> &SamlError {
        // `from_errors`/`From` never build an empty failure
        &self.errors[self.errors.len() - 1]
    }

    pub fn last_error_reason(&self) -> String {
        self.last_error().to_string()
    }

    pub fn reasons(&self) -> Vec<ValidationReason> {
        self.errors.iter().filter_map(SamlError::reason).collect()
    }

    pub fn has_reason(&self, reason: ValidationReason) -> bool {
        self.errors.iter().any(|e| e.reason() == Some(reason))
    }

    pub fn is_signature_error(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, SamlError::SignatureVerification(_)))
    }
}

impl From<SamlError> for ValidationFailure {
    fn from(error: SamlError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationFailure {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_requires_errors() {
        assert!(ValidationFailure::from_errors(vec![]).is_none());
    }

    #[test]
    fn test_last_error_and_reasons() {
        let failure = ValidationFailure::from_errors(vec![
            SamlError::validation(ValidationReason::AudienceMismatch, "audience"),
            SamlError::validation(ValidationReason::Expired, "too late"),
        ])
        .unwrap();
        assert_eq!(
            failure.reasons(),
            vec![ValidationReason::AudienceMismatch, ValidationReason::Expired]
        );
        assert!(failure.has_reason(ValidationReason::Expired));
        assert!(!failure.is_signature_error());
        assert_eq!(failure.last_error_reason(), "validation failed (expired): too late");
        assert_eq!(
            failure.to_string(),
            "validation failed (audience_mismatch): audience; validation failed (expired): too late"
        );
    }

    #[test]
    fn test_conversions_classify_errors() {
        let err: SamlError = SignatureError::DigestMismatch.into();
        assert!(matches!(err, SamlError::SignatureVerification(_)));
        let err: SamlError = XmlError::NoRoot.into();
        assert!(matches!(err, SamlError::MalformedMessage(_)));
        assert_eq!(SamlError::MetadataSchema(vec!["a".into(), "b".into()]).to_string(),
            "metadata failed schema validation: a; b");
    }
}
