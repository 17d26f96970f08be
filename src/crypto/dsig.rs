//! Enveloped XML-DSig signatures.
//!
//! Verification is deliberately narrow. A signature must carry exactly one
//! `Reference` pointing at the element it is enveloped in, with at most the
//! enveloped-signature transform and one canonicalization transform. Anything
//! else is rejected rather than interpreted.

use base64::{Engine, engine::general_purpose::STANDARD};
use openssl::x509::X509;
use subtle::ConstantTimeEq;

use super::{
    CryptoError, DigestAlgorithm, SignatureAlgorithm, SigningCredentials, TrustAnchors,
    certificate_body, parse_certificate, sign_bytes, verify_bytes,
};
use crate::{
    constants::{NS_ASSERTION, NS_DSIG, NS_EXC_C14N, algorithm},
    xml::{CanonicalizationMethod, Document, Element, XmlError, canonicalize},
};

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("element is not signed")]
    Missing,

    #[error("element carries more than one signature")]
    Multiple,

    #[error("malformed signature: {0}")]
    Malformed(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("deprecated algorithm rejected: {0}")]
    DeprecatedAlgorithm(String),

    #[error("signature reference does not point at the signed element")]
    ReferenceMismatch,

    #[error("ID '{0}' is not unique in the document")]
    DuplicateId(String),

    #[error("digest mismatch")]
    DigestMismatch,

    #[error("signature value does not verify")]
    InvalidSignature,

    #[error("no trusted certificate available for this signature")]
    UntrustedCertificate,

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Summary of a signature that verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    pub reference_id: String,
    pub signature_algorithm: SignatureAlgorithm,
    pub digest_algorithm: DigestAlgorithm,
}

/// Whether `element` has a direct `ds:Signature` child.
pub fn is_signed(element: &Element) -> bool {
    element.child(NS_DSIG, "Signature").is_some()
}

/// Verify the enveloped signature on `signed`, where `document_root` is the
/// root of the document that contains it (used for ID uniqueness).
pub fn verify_element(
    document_root: &Element,
    signed: &Element,
    trust: &TrustAnchors,
    reject_deprecated: bool,
) -> Result<VerifiedSignature, SignatureError> {
    let id = signed
        .id_attribute()
        .ok_or_else(|| SignatureError::Malformed("signed element has no ID attribute".into()))?;

    let mut signatures = signed.children_named(NS_DSIG, "Signature");
    let signature = signatures.next().ok_or(SignatureError::Missing)?;
    if signatures.next().is_some() {
        return Err(SignatureError::Multiple);
    }

    let signed_info = exactly_one(signature, "SignedInfo")?;

    let c14n_uri = required_algorithm(exactly_one(signed_info, "CanonicalizationMethod")?)?;
    let signed_info_c14n = CanonicalizationMethod::from_uri(c14n_uri)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm(c14n_uri.to_string()))?;
    let signed_info_prefixes =
        inclusive_prefixes(exactly_one(signed_info, "CanonicalizationMethod")?);

    let signature_uri = required_algorithm(exactly_one(signed_info, "SignatureMethod")?)?;
    let signature_algorithm = SignatureAlgorithm::from_uri(signature_uri)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm(signature_uri.to_string()))?;

    let reference = exactly_one(signed_info, "Reference")?;
    if reference.attr("URI") != Some(format!("#{}", id).as_str()) {
        return Err(SignatureError::ReferenceMismatch);
    }

    let mut enveloped = false;
    let mut reference_c14n: Option<(CanonicalizationMethod, Vec<String>)> = None;
    if let Some(transforms) = reference.child(NS_DSIG, "Transforms") {
        for transform in transforms.children_named(NS_DSIG, "Transform") {
            let uri = required_algorithm(transform)?;
            if uri == algorithm::ENVELOPED_SIGNATURE && !enveloped {
                enveloped = true;
            } else if let Some(method) = CanonicalizationMethod::from_uri(uri)
                && reference_c14n.is_none()
            {
                reference_c14n = Some((method, inclusive_prefixes(transform)));
            } else {
                return Err(SignatureError::UnsupportedAlgorithm(uri.to_string()));
            }
        }
    }
    let (reference_method, reference_prefixes) =
        reference_c14n.unwrap_or((CanonicalizationMethod::Inclusive, Vec::new()));

    let digest_uri = required_algorithm(exactly_one(reference, "DigestMethod")?)?;
    let digest_algorithm = DigestAlgorithm::from_uri(digest_uri)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm(digest_uri.to_string()))?;

    if reject_deprecated {
        if signature_algorithm.is_deprecated() {
            return Err(SignatureError::DeprecatedAlgorithm(signature_uri.to_string()));
        }
        if digest_algorithm.is_deprecated() {
            return Err(SignatureError::DeprecatedAlgorithm(digest_uri.to_string()));
        }
    }

    let matches = document_root.find_by_id(id);
    if matches.len() != 1 || !std::ptr::eq(matches[0], signed) {
        return Err(SignatureError::DuplicateId(id.to_string()));
    }

    let expected_digest = decode_base64(&exactly_one(reference, "DigestValue")?.text())?;
    let canonical = canonicalize(
        signed,
        reference_method,
        &reference_prefixes,
        enveloped.then_some(signature),
    );
    let actual_digest = digest_algorithm.digest(canonical.as_bytes())?;
    if !bool::from(actual_digest.as_slice().ct_eq(expected_digest.as_slice())) {
        return Err(SignatureError::DigestMismatch);
    }

    let signature_value = decode_base64(&exactly_one(signature, "SignatureValue")?.text())?;
    let canonical_signed_info =
        canonicalize(signed_info, signed_info_c14n, &signed_info_prefixes, None);

    let embedded = embedded_certificate(signature);
    let keys = trust.candidate_keys(embedded.as_ref());
    if keys.is_empty() {
        return Err(SignatureError::UntrustedCertificate);
    }
    for key in &keys {
        if verify_bytes(key, signature_algorithm, canonical_signed_info.as_bytes(), &signature_value)? {
            return Ok(VerifiedSignature {
                reference_id: id.to_string(),
                signature_algorithm,
                digest_algorithm,
            });
        }
    }

    Err(SignatureError::InvalidSignature)
}

/// Verify the signature on the root element of `xml` against a single
/// certificate. Any failure, including an absent signature, yields `false`.
pub fn verify(xml: &str, certificate: &X509) -> bool {
    let document = match Document::parse(xml) {
        Ok(document) => document,
        Err(e) => {
            tracing::debug!(error = %e, "Signature verification input is not well-formed");
            return false;
        }
    };
    let trust = TrustAnchors {
        certificates: vec![certificate.clone()],
        ..Default::default()
    };
    match verify_element(document.root(), document.root(), &trust, true) {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Signature verification failed");
            false
        }
    }
}

/// Add an enveloped signature to the element of `xml` whose ID is `id`.
///
/// The signature uses exclusive c14n and is placed right after the element's
/// `saml:Issuer` child (or first, when there is none), as the SAML schemas
/// require.
pub fn sign_element(
    xml: &str,
    id: &str,
    credentials: &SigningCredentials,
) -> Result<String, SignatureError> {
    let mut document = Document::parse(xml)?;
    let path = document
        .root()
        .path_to_id(id)
        .ok_or_else(|| SignatureError::Malformed(format!("no element with ID '{}'", id)))?;
    let target = document
        .root_mut()
        .element_at_path_mut(&path)
        .ok_or_else(|| SignatureError::Malformed(format!("no element with ID '{}'", id)))?;

    let canonical = canonicalize(target, CanonicalizationMethod::Exclusive, &[], None);
    let digest = credentials.digest_algorithm.digest(canonical.as_bytes())?;

    let signed_info_body = format!(
        concat!(
            "<ds:CanonicalizationMethod Algorithm=\"{c14n}\"/>",
            "<ds:SignatureMethod Algorithm=\"{sig}\"/>",
            "<ds:Reference URI=\"#{id}\">",
            "<ds:Transforms>",
            "<ds:Transform Algorithm=\"{enveloped}\"/>",
            "<ds:Transform Algorithm=\"{c14n}\"/>",
            "</ds:Transforms>",
            "<ds:DigestMethod Algorithm=\"{digest_alg}\"/>",
            "<ds:DigestValue>{digest}</ds:DigestValue>",
            "</ds:Reference>"
        ),
        c14n = NS_EXC_C14N,
        sig = credentials.signature_algorithm.uri(),
        id = id,
        enveloped = algorithm::ENVELOPED_SIGNATURE,
        digest_alg = credentials.digest_algorithm.uri(),
        digest = STANDARD.encode(&digest),
    );

    let signed_info = Document::parse(&format!(
        "<ds:SignedInfo xmlns:ds=\"{}\">{}</ds:SignedInfo>",
        NS_DSIG, signed_info_body
    ))?;
    let canonical_signed_info = canonicalize(
        signed_info.root(),
        CanonicalizationMethod::Exclusive,
        &[],
        None,
    );
    let signature_value = sign_bytes(
        &credentials.key,
        credentials.signature_algorithm,
        canonical_signed_info.as_bytes(),
    )?;

    let signature_xml = format!(
        concat!(
            "<ds:Signature xmlns:ds=\"{ns}\">",
            "<ds:SignedInfo>{signed_info}</ds:SignedInfo>",
            "<ds:SignatureValue>{value}</ds:SignatureValue>",
            "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
            "</ds:Signature>"
        ),
        ns = NS_DSIG,
        signed_info = signed_info_body,
        value = STANDARD.encode(&signature_value),
        cert = certificate_body(&credentials.certificate)?,
    );
    let signature = Document::parse_in_scope(&signature_xml, target.scope())?.into_root();
    target.insert_after_child((NS_ASSERTION, "Issuer"), signature);

    Ok(document.to_string())
}

fn exactly_one<'a>(parent: &'a Element, local_name: &'a str) -> Result<&'a Element, SignatureError> {
    let mut found = parent.children_named(NS_DSIG, local_name);
    match (found.next(), found.next()) {
        (Some(element), None) => Ok(element),
        (None, _) => Err(SignatureError::Malformed(format!("missing ds:{}", local_name))),
        (Some(_), Some(_)) => Err(SignatureError::Malformed(format!(
            "expected exactly one ds:{}",
            local_name
        ))),
    }
}

fn required_algorithm(element: &Element) -> Result<&str, SignatureError> {
    element.attr("Algorithm").ok_or_else(|| {
        SignatureError::Malformed(format!("{} has no Algorithm", element.qualified_name()))
    })
}

fn inclusive_prefixes(method: &Element) -> Vec<String> {
    method
        .child(NS_EXC_C14N, "InclusiveNamespaces")
        .and_then(|el| el.attr("PrefixList"))
        .map(|list| list.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

fn decode_base64(text: &str) -> Result<Vec<u8>, SignatureError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| SignatureError::Malformed(format!("invalid base64: {}", e)))
}

fn embedded_certificate(signature: &Element) -> Option<X509> {
    let text = signature
        .child(NS_DSIG, "KeyInfo")?
        .child(NS_DSIG, "X509Data")?
        .child(NS_DSIG, "X509Certificate")?
        .text();
    match parse_certificate(&text) {
        Ok(cert) => Some(cert),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring unparsable embedded certificate");
            None
        }
    }
}
