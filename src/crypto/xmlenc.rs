//! XML Encryption for `EncryptedAssertion` and `EncryptedID`.
//!
//! Supported content ciphers are AES-CBC and AES-GCM; the content key is
//! transported with RSA-OAEP (RSA PKCS#1 v1.5 only when deprecated algorithms
//! are allowed).

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::{
    encrypt::{Decrypter, Encrypter},
    hash::MessageDigest,
    pkey::{PKey, Private},
    rand::rand_bytes,
    rsa::Padding,
    symm::{Cipher, Crypter, Mode, decrypt_aead, encrypt},
    x509::X509,
};

use super::CryptoError;
use crate::{
    constants::{NS_ASSERTION, NS_DSIG, NS_XMLENC, NS_XMLENC11, algorithm},
    xml::{Document, Element, XmlError},
};

const GCM_IV_LEN: usize = 12;
const GCM_TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("malformed encrypted element: {0}")]
    Malformed(String),

    #[error("unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("deprecated encryption algorithm rejected: {0}")]
    DeprecatedAlgorithm(String),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("decrypted content is not a single XML element: {0}")]
    InvalidPlaintext(#[from] XmlError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<openssl::error::ErrorStack> for EncryptionError {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::Crypto(CryptoError::OpenSsl(e))
    }
}

#[derive(Clone, Copy)]
enum ContentCipher {
    Cbc(Cipher),
    Gcm(Cipher),
}

impl ContentCipher {
    fn from_uri(uri: &str) -> Option<Self> {
        match uri {
            algorithm::AES128_CBC => Some(Self::Cbc(Cipher::aes_128_cbc())),
            algorithm::AES192_CBC => Some(Self::Cbc(Cipher::aes_192_cbc())),
            algorithm::AES256_CBC => Some(Self::Cbc(Cipher::aes_256_cbc())),
            algorithm::AES128_GCM => Some(Self::Gcm(Cipher::aes_128_gcm())),
            algorithm::AES256_GCM => Some(Self::Gcm(Cipher::aes_256_gcm())),
            _ => None,
        }
    }

    fn key_len(self) -> usize {
        match self {
            Self::Cbc(cipher) | Self::Gcm(cipher) => cipher.key_len(),
        }
    }

    fn decrypt(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        match self {
            Self::Cbc(cipher) => {
                let iv_len = cipher.iv_len().unwrap_or(16);
                if data.len() <= iv_len || (data.len() - iv_len) % cipher.block_size() != 0 {
                    return Err(EncryptionError::DecryptionFailed);
                }
                let (iv, ciphertext) = data.split_at(iv_len);
                let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(iv))?;
                // XML Encryption padding only defines the final byte.
                crypter.pad(false);
                let mut out = vec![0u8; ciphertext.len() + cipher.block_size()];
                let mut len = crypter
                    .update(ciphertext, &mut out)
                    .map_err(|_| EncryptionError::DecryptionFailed)?;
                len += crypter
                    .finalize(&mut out[len..])
                    .map_err(|_| EncryptionError::DecryptionFailed)?;
                out.truncate(len);

                let pad = usize::from(*out.last().ok_or(EncryptionError::DecryptionFailed)?);
                if pad == 0 || pad > cipher.block_size() || pad > out.len() {
                    return Err(EncryptionError::DecryptionFailed);
                }
                out.truncate(out.len() - pad);
                Ok(out)
            }
            Self::Gcm(cipher) => {
                if data.len() < GCM_IV_LEN + GCM_TAG_LEN {
                    return Err(EncryptionError::DecryptionFailed);
                }
                let (iv, rest) = data.split_at(GCM_IV_LEN);
                let (ciphertext, tag) = rest.split_at(rest.len() - GCM_TAG_LEN);
                decrypt_aead(cipher, key, Some(iv), &[], ciphertext, tag)
                    .map_err(|_| EncryptionError::DecryptionFailed)
            }
        }
    }
}

/// Decrypt the `xenc:EncryptedData` inside `wrapper` (an `EncryptedAssertion`
/// or `EncryptedID`) and return the plaintext element. Prefixes in the
/// plaintext may rely on declarations in scope at `wrapper`.
pub fn decrypt_element(
    wrapper: &Element,
    key: &PKey<Private>,
    reject_deprecated: bool,
) -> Result<Element, EncryptionError> {
    let encrypted_data = wrapper
        .child(NS_XMLENC, "EncryptedData")
        .ok_or_else(|| EncryptionError::Malformed("missing xenc:EncryptedData".into()))?;

    let method_uri = encryption_method(encrypted_data)?;
    let cipher = ContentCipher::from_uri(method_uri)
        .ok_or_else(|| EncryptionError::UnsupportedAlgorithm(method_uri.to_string()))?;

    let encrypted_key = encrypted_data
        .child(NS_DSIG, "KeyInfo")
        .and_then(|info| info.child(NS_XMLENC, "EncryptedKey"))
        .or_else(|| wrapper.child(NS_XMLENC, "EncryptedKey"))
        .ok_or_else(|| EncryptionError::Malformed("missing xenc:EncryptedKey".into()))?;

    let content_key = unwrap_key(encrypted_key, key, reject_deprecated)?;
    if content_key.len() != cipher.key_len() {
        return Err(EncryptionError::DecryptionFailed);
    }

    let plaintext = cipher.decrypt(&content_key, &cipher_value(encrypted_data)?)?;
    let plaintext = String::from_utf8(plaintext).map_err(|_| EncryptionError::DecryptionFailed)?;

    Ok(Document::parse_in_scope(&plaintext, wrapper.scope())?.into_root())
}

fn unwrap_key(
    encrypted_key: &Element,
    key: &PKey<Private>,
    reject_deprecated: bool,
) -> Result<Vec<u8>, EncryptionError> {
    let method = encrypted_key
        .child(NS_XMLENC, "EncryptionMethod")
        .ok_or_else(|| EncryptionError::Malformed("EncryptedKey has no EncryptionMethod".into()))?;
    let uri = method
        .attr("Algorithm")
        .ok_or_else(|| EncryptionError::Malformed("EncryptionMethod has no Algorithm".into()))?;

    let mut decrypter = Decrypter::new(key)?;
    match uri {
        algorithm::RSA_OAEP_MGF1P | algorithm::RSA_OAEP => {
            let oaep_digest = match method.child(NS_DSIG, "DigestMethod").and_then(|d| d.attr("Algorithm")) {
                None | Some(algorithm::SHA1) => MessageDigest::sha1(),
                Some(algorithm::SHA256) => MessageDigest::sha256(),
                Some(algorithm::SHA512) => MessageDigest::sha512(),
                Some(other) => return Err(EncryptionError::UnsupportedAlgorithm(other.to_string())),
            };
            let mgf_digest = if uri == algorithm::RSA_OAEP {
                match method.child(NS_XMLENC11, "MGF").and_then(|m| m.attr("Algorithm")) {
                    None => MessageDigest::sha1(),
                    Some(mgf) if mgf.ends_with("mgf1sha1") => MessageDigest::sha1(),
                    Some(mgf) if mgf.ends_with("mgf1sha256") => MessageDigest::sha256(),
                    Some(mgf) if mgf.ends_with("mgf1sha512") => MessageDigest::sha512(),
                    Some(other) => {
                        return Err(EncryptionError::UnsupportedAlgorithm(other.to_string()));
                    }
                }
            } else {
                MessageDigest::sha1()
            };
            decrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
            decrypter.set_rsa_oaep_md(oaep_digest)?;
            decrypter.set_rsa_mgf1_md(mgf_digest)?;
        }
        algorithm::RSA_1_5 if reject_deprecated => {
            return Err(EncryptionError::DeprecatedAlgorithm(uri.to_string()));
        }
        algorithm::RSA_1_5 => decrypter.set_rsa_padding(Padding::PKCS1)?,
        other => return Err(EncryptionError::UnsupportedAlgorithm(other.to_string())),
    }

    let wrapped = cipher_value(encrypted_key)?;
    let mut out = vec![0u8; decrypter.decrypt_len(&wrapped)?];
    let len = decrypter
        .decrypt(&wrapped, &mut out)
        .map_err(|_| EncryptionError::DecryptionFailed)?;
    out.truncate(len);
    Ok(out)
}

fn encryption_method(encrypted: &Element) -> Result<&str, EncryptionError> {
    encrypted
        .child(NS_XMLENC, "EncryptionMethod")
        .and_then(|m| m.attr("Algorithm"))
        .ok_or_else(|| EncryptionError::Malformed("missing EncryptionMethod Algorithm".into()))
}

fn cipher_value(encrypted: &Element) -> Result<Vec<u8>, EncryptionError> {
    let text = encrypted
        .child(NS_XMLENC, "CipherData")
        .and_then(|data| data.child(NS_XMLENC, "CipherValue"))
        .ok_or_else(|| EncryptionError::Malformed("missing CipherData/CipherValue".into()))?
        .text();
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| EncryptionError::Malformed(format!("invalid base64 in CipherValue: {}", e)))
}

/// Encrypt a self-contained XML element for the holder of `certificate`,
/// wrapping it in `saml:{wrapper}` (`EncryptedID` or `EncryptedAssertion`).
///
/// Uses AES-128-CBC with an RSA-OAEP-MGF1P transported key.
pub fn encrypt_element(
    plaintext: &str,
    certificate: &X509,
    wrapper: &str,
) -> Result<String, EncryptionError> {
    let cipher = Cipher::aes_128_cbc();
    let mut content_key = vec![0u8; cipher.key_len()];
    rand_bytes(&mut content_key)?;
    let mut iv = vec![0u8; cipher.iv_len().unwrap_or(16)];
    rand_bytes(&mut iv)?;

    // PKCS#7 padding is a valid instance of XML Encryption padding.
    let mut encrypted = iv.clone();
    encrypted.extend(encrypt(cipher, &content_key, Some(&iv), plaintext.as_bytes())?);

    let public_key = certificate.public_key()?;
    let mut encrypter = Encrypter::new(&public_key)?;
    encrypter.set_rsa_padding(Padding::PKCS1_OAEP)?;
    encrypter.set_rsa_oaep_md(MessageDigest::sha1())?;
    encrypter.set_rsa_mgf1_md(MessageDigest::sha1())?;
    let mut wrapped = vec![0u8; encrypter.encrypt_len(&content_key)?];
    let len = encrypter.encrypt(&content_key, &mut wrapped)?;
    wrapped.truncate(len);

    Ok(format!(
        concat!(
            "<saml:{wrapper} xmlns:saml=\"{saml}\">",
            "<xenc:EncryptedData xmlns:xenc=\"{xenc}\" Type=\"{element_type}\">",
            "<xenc:EncryptionMethod Algorithm=\"{content_alg}\"/>",
            "<ds:KeyInfo xmlns:ds=\"{ds}\">",
            "<xenc:EncryptedKey>",
            "<xenc:EncryptionMethod Algorithm=\"{key_alg}\"><ds:DigestMethod Algorithm=\"{sha1}\"/></xenc:EncryptionMethod>",
            "<xenc:CipherData><xenc:CipherValue>{wrapped}</xenc:CipherValue></xenc:CipherData>",
            "</xenc:EncryptedKey>",
            "</ds:KeyInfo>",
            "<xenc:CipherData><xenc:CipherValue>{data}</xenc:CipherValue></xenc:CipherData>",
            "</xenc:EncryptedData>",
            "</saml:{wrapper}>"
        ),
        wrapper = wrapper,
        saml = NS_ASSERTION,
        xenc = NS_XMLENC,
        element_type = algorithm::XMLENC_ELEMENT,
        content_alg = algorithm::AES128_CBC,
        ds = NS_DSIG,
        key_alg = algorithm::RSA_OAEP_MGF1P,
        sha1 = algorithm::SHA1,
        wrapped = STANDARD.encode(&wrapped),
        data = STANDARD.encode(&encrypted),
    ))
}
