//! Key material, algorithm identifiers and raw sign/verify primitives.
//!
//! XML signatures live in [`dsig`], XML encryption in [`xmlenc`]. Both sit on
//! top of the helpers here, which wrap `openssl`.

pub mod dsig;
pub mod xmlenc;

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    bn::BigNum,
    ecdsa::EcdsaSig,
    error::ErrorStack,
    hash::{MessageDigest, hash},
    pkey::{HasPublic, Id, PKey, PKeyRef, Private, Public},
    sign::{Signer, Verifier},
    x509::X509,
};
use serde::{Deserialize, Serialize};

use crate::constants::algorithm;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("malformed signature value")]
    MalformedSignature,

    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),
}

/// Digest algorithms usable in `ds:DigestMethod`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            algorithm::SHA1 => Some(Self::Sha1),
            algorithm::SHA256 => Some(Self::Sha256),
            algorithm::SHA384 => Some(Self::Sha384),
            algorithm::SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::Sha1 => algorithm::SHA1,
            Self::Sha256 => algorithm::SHA256,
            Self::Sha384 => algorithm::SHA384,
            Self::Sha512 => algorithm::SHA512,
        }
    }

    pub fn message_digest(self) -> MessageDigest {
        match self {
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn is_deprecated(self) -> bool {
        self == Self::Sha1
    }

    pub fn digest(self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(hash(self.message_digest(), data)?.to_vec())
    }
}

/// Signature algorithms usable in `ds:SignatureMethod` and `SigAlg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    RsaSha1,
    RsaSha256,
    RsaSha384,
    RsaSha512,
    EcdsaSha256,
    EcdsaSha384,
    EcdsaSha512,
}

impl SignatureAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            algorithm::RSA_SHA1 => Some(Self::RsaSha1),
            algorithm::RSA_SHA256 => Some(Self::RsaSha256),
            algorithm::RSA_SHA384 => Some(Self::RsaSha384),
            algorithm::RSA_SHA512 => Some(Self::RsaSha512),
            algorithm::ECDSA_SHA256 => Some(Self::EcdsaSha256),
            algorithm::ECDSA_SHA384 => Some(Self::EcdsaSha384),
            algorithm::ECDSA_SHA512 => Some(Self::EcdsaSha512),
            _ => None,
        }
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::RsaSha1 => algorithm::RSA_SHA1,
            Self::RsaSha256 => algorithm::RSA_SHA256,
            Self::RsaSha384 => algorithm::RSA_SHA384,
            Self::RsaSha512 => algorithm::RSA_SHA512,
            Self::EcdsaSha256 => algorithm::ECDSA_SHA256,
            Self::EcdsaSha384 => algorithm::ECDSA_SHA384,
            Self::EcdsaSha512 => algorithm::ECDSA_SHA512,
        }
    }

    pub fn digest(self) -> DigestAlgorithm {
        match self {
            Self::RsaSha1 => DigestAlgorithm::Sha1,
            Self::RsaSha256 | Self::EcdsaSha256 => DigestAlgorithm::Sha256,
            Self::RsaSha384 | Self::EcdsaSha384 => DigestAlgorithm::Sha384,
            Self::RsaSha512 | Self::EcdsaSha512 => DigestAlgorithm::Sha512,
        }
    }

    pub fn is_ecdsa(self) -> bool {
        matches!(self, Self::EcdsaSha256 | Self::EcdsaSha384 | Self::EcdsaSha512)
    }

    pub fn is_deprecated(self) -> bool {
        self == Self::RsaSha1
    }

    /// Default algorithm for a key: ECDSA-SHA256 for EC keys, RSA-SHA256 otherwise.
    pub fn default_for_key<T: HasPublic>(key: &PKeyRef<T>) -> Self {
        if key.id() == Id::EC {
            Self::EcdsaSha256
        } else {
            Self::RsaSha256
        }
    }

    /// Whether this algorithm can be used with the given key.
    pub fn matches_key<T: HasPublic>(self, key: &PKeyRef<T>) -> bool {
        match key.id() {
            Id::EC => self.is_ecdsa(),
            Id::RSA => !self.is_ecdsa(),
            _ => false,
        }
    }
}

/// The SP's signing key, its certificate and the algorithms to sign with.
#[derive(Clone)]
pub struct SigningCredentials {
    pub key: PKey<Private>,
    pub certificate: X509,
    pub signature_algorithm: SignatureAlgorithm,
    pub digest_algorithm: DigestAlgorithm,
}

impl std::fmt::Debug for SigningCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningCredentials")
            .field("key", &"<redacted>")
            .field("signature_algorithm", &self.signature_algorithm)
            .field("digest_algorithm", &self.digest_algorithm)
            .finish()
    }
}

/// Certificates and/or a fingerprint the SP trusts for IdP signatures.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    pub certificates: Vec<X509>,
    /// Lowercase hex, no separators.
    pub fingerprint: Option<String>,
    pub fingerprint_algorithm: DigestAlgorithm,
}

impl TrustAnchors {
    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty() && self.fingerprint.is_none()
    }

    /// Whether signatures without an embedded certificate (HTTP-Redirect
    /// query signatures) can be checked.
    pub fn has_certificates(&self) -> bool {
        !self.certificates.is_empty()
    }

    /// Public keys to try for a signature, given the certificate the signature
    /// carried, if any. An embedded certificate is only used when it matches the
    /// configured fingerprint; configured certificates are always candidates.
    pub fn candidate_keys(&self, embedded: Option<&X509>) -> Vec<PKey<Public>> {
        let mut keys: Vec<PKey<Public>> = self
            .certificates
            .iter()
            .filter_map(|cert| cert.public_key().ok())
            .collect();

        if let (Some(expected), Some(cert)) = (&self.fingerprint, embedded) {
            match fingerprint(cert, self.fingerprint_algorithm) {
                Ok(actual) if actual == *expected => {
                    if let Ok(key) = cert.public_key() {
                        keys.push(key);
                    }
                }
                Ok(_) => {
                    tracing::debug!("Embedded certificate does not match the configured fingerprint");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Failed to fingerprint embedded certificate");
                }
            }
        }
        keys
    }
}

/// Load a PEM private key (PKCS#8 or PKCS#1).
pub fn load_private_key(pem: &str) -> Result<PKey<Private>, CryptoError> {
    PKey::private_key_from_pem(pem.trim().as_bytes())
        .map_err(|e| CryptoError::InvalidKey(format!("expected PEM format: {}", e)))
}

/// Parse a certificate given either as PEM or as bare base64 DER, the way
/// certificates appear in metadata and `ds:X509Certificate`.
pub fn parse_certificate(text: &str) -> Result<X509, CryptoError> {
    let trimmed = text.trim();
    if trimmed.starts_with("-----BEGIN") {
        return X509::from_pem(trimmed.as_bytes())
            .map_err(|e| CryptoError::InvalidCertificate(e.to_string()));
    }
    let body: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| CryptoError::InvalidCertificate(format!("invalid base64: {}", e)))?;
    X509::from_der(&der).map_err(|e| CryptoError::InvalidCertificate(e.to_string()))
}

/// Base64 DER body of a certificate, without PEM armor or line breaks.
pub fn certificate_body(cert: &X509) -> Result<String, CryptoError> {
    Ok(STANDARD.encode(cert.to_der()?))
}

/// Certificate fingerprint as lowercase hex without separators.
pub fn fingerprint(cert: &X509, algorithm: DigestAlgorithm) -> Result<String, CryptoError> {
    Ok(hex::encode(cert.digest(algorithm.message_digest())?))
}

/// Normalize a configured fingerprint (`AB:CD:..` or `abcd..`) for comparison.
pub fn normalize_fingerprint(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Sign `data`. ECDSA signatures are returned in the raw `r || s` form that
/// XML-DSig and the redirect binding use.
pub fn sign_bytes(
    key: &PKey<Private>,
    algorithm: SignatureAlgorithm,
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut signer = Signer::new(algorithm.digest().message_digest(), key)?;
    signer.update(data)?;
    let signature = signer.sign_to_vec()?;

    if !algorithm.is_ecdsa() {
        return Ok(signature);
    }

    let ec_key = key.ec_key()?;
    let field_len = (ec_key.group().degree() as usize).div_ceil(8);
    let parsed = EcdsaSig::from_der(&signature)?;
    let mut raw = left_pad(&parsed.r().to_vec(), field_len);
    raw.extend(left_pad(&parsed.s().to_vec(), field_len));
    Ok(raw)
}

/// Verify a signature produced by [`sign_bytes`] or a peer using the same
/// conventions. Returns `Ok(false)` on mismatch.
pub fn verify_bytes<T: HasPublic>(
    key: &PKeyRef<T>,
    algorithm: SignatureAlgorithm,
    data: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    if !algorithm.matches_key(key) {
        return Ok(false);
    }

    let der;
    let signature = if algorithm.is_ecdsa() {
        if signature.is_empty() || signature.len() % 2 != 0 {
            return Err(CryptoError::MalformedSignature);
        }
        let (r, s) = signature.split_at(signature.len() / 2);
        let sig = EcdsaSig::from_private_components(BigNum::from_slice(r)?, BigNum::from_slice(s)?)?;
        der = sig.to_der()?;
        der.as_slice()
    } else {
        signature
    };

    let mut verifier = Verifier::new(algorithm.digest().message_digest(), key)?;
    verifier.update(data)?;
    // openssl reports some malformed signatures as errors rather than `false`
    Ok(verifier.verify(signature).unwrap_or(false))
}

fn left_pad(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len.saturating_sub(bytes.len())];
    out.extend_from_slice(bytes);
    out
}
