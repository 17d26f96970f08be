//! SP metadata publication and the structural checks run before serving it.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use openssl::x509::X509;

use crate::{
    bindings::Binding,
    constants::{NS_DSIG, NS_METADATA, NS_PROTOCOL},
    crypto::{DigestAlgorithm, certificate_body, dsig::sign_element},
    error::{SamlError, SamlResult},
    message::format_instant,
    settings::{Settings, is_valid_duration},
    xml::{Document, Element, escape_value},
};

pub const CONTENT_TYPE: &str = "application/samlmetadata+xml";

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

const CONTACT_TYPES: &[&str] = &["technical", "support", "administrative", "billing", "other"];

/// Render the SP's `EntityDescriptor`.
///
/// The output depends only on `settings`: the descriptor ID is derived from
/// the entity ID, and no timestamps are added beyond the configured ones.
pub fn generate(settings: &Settings) -> SamlResult<String> {
    let security = settings.security();
    let metadata = settings.metadata();
    let id = descriptor_id(settings.sp_entity_id())?;

    let mut xml = format!(
        "<md:EntityDescriptor xmlns:md=\"{}\" xmlns:ds=\"{}\" ID=\"{}\" entityID=\"{}\"",
        NS_METADATA,
        NS_DSIG,
        id,
        escape_value(settings.sp_entity_id())
    );
    if let Some(valid_until) = metadata.valid_until {
        xml.push_str(&format!(" validUntil=\"{}\"", format_instant(valid_until)));
    }
    if let Some(cache_duration) = &metadata.cache_duration {
        xml.push_str(&format!(" cacheDuration=\"{}\"", escape_value(cache_duration)));
    }
    xml.push('>');

    xml.push_str(&format!(
        "<md:SPSSODescriptor AuthnRequestsSigned=\"{}\" WantAssertionsSigned=\"{}\" protocolSupportEnumeration=\"{}\">",
        security.authn_requests_signed, security.want_assertions_signed, NS_PROTOCOL
    ));

    if let Some(certificate) = settings.sp_certificate() {
        xml.push_str(&key_descriptor("signing", certificate)?);
        if let Some(new_certificate) = settings.sp_new_certificate() {
            xml.push_str(&key_descriptor("signing", new_certificate)?);
        }
        if security.want_assertions_encrypted || security.want_name_id_encrypted {
            xml.push_str(&key_descriptor("encryption", certificate)?);
            if let Some(new_certificate) = settings.sp_new_certificate() {
                xml.push_str(&key_descriptor("encryption", new_certificate)?);
            }
        }
    }

    if let Some(sls_url) = settings.sls_url() {
        xml.push_str(&format!(
            "<md:SingleLogoutService Binding=\"{}\" Location=\"{}\"/>",
            Binding::HttpRedirect.uri(),
            escape_value(sls_url)
        ));
    }

    xml.push_str(&format!(
        "<md:NameIDFormat>{}</md:NameIDFormat>",
        escape_value(settings.name_id_format())
    ));
    xml.push_str(&format!(
        "<md:AssertionConsumerService Binding=\"{}\" Location=\"{}\" index=\"1\"/>",
        Binding::HttpPost.uri(),
        escape_value(settings.acs_url())
    ));
    xml.push_str("</md:SPSSODescriptor>");

    if let Some(organization) = &metadata.organization {
        let lang = escape_value(&organization.lang);
        xml.push_str(&format!(
            concat!(
                "<md:Organization>",
                "<md:OrganizationName xml:lang=\"{lang}\">{name}</md:OrganizationName>",
                "<md:OrganizationDisplayName xml:lang=\"{lang}\">{display}</md:OrganizationDisplayName>",
                "<md:OrganizationURL xml:lang=\"{lang}\">{url}</md:OrganizationURL>",
                "</md:Organization>"
            ),
            lang = lang,
            name = escape_value(&organization.name),
            display = escape_value(&organization.display_name),
            url = escape_value(&organization.url),
        ));
    }

    for contact in &metadata.contacts {
        xml.push_str(&format!(
            "<md:ContactPerson contactType=\"{}\">",
            contact.contact_type.as_str()
        ));
        if let Some(company) = &contact.company {
            xml.push_str(&format!("<md:Company>{}</md:Company>", escape_value(company)));
        }
        if let Some(given_name) = &contact.given_name {
            xml.push_str(&format!("<md:GivenName>{}</md:GivenName>", escape_value(given_name)));
        }
        if let Some(email) = &contact.email_address {
            xml.push_str(&format!(
                "<md:EmailAddress>{}</md:EmailAddress>",
                escape_value(email)
            ));
        }
        xml.push_str("</md:ContactPerson>");
    }

    xml.push_str("</md:EntityDescriptor>");

    if security.sign_metadata {
        let credentials = settings.signing_credentials().ok_or_else(|| {
            SamlError::Configuration("sign_metadata requires sp.private_key and sp.certificate".into())
        })?;
        xml = sign_element(&xml, &id, credentials)
            .map_err(|e| SamlError::Configuration(format!("failed to sign metadata: {}", e)))?;
    }

    Ok(format!("{}{}", XML_DECLARATION, xml))
}

/// [`generate`], refusing to publish metadata that fails [`validate`].
pub fn generate_checked(settings: &Settings) -> SamlResult<String> {
    let xml = generate(settings)?;
    let errors = validate(&xml);
    if !errors.is_empty() {
        tracing::warn!(errors = ?errors, "Generated metadata failed validation");
        return Err(SamlError::MetadataSchema(errors));
    }
    Ok(xml)
}

/// Structural checks over an SP metadata document. Empty means valid.
pub fn validate(xml: &str) -> Vec<String> {
    validate_at(xml, Utc::now())
}

fn validate_at(xml: &str, now: DateTime<Utc>) -> Vec<String> {
    let mut errors = Vec::new();

    let document = match Document::parse(xml) {
        Ok(document) => document,
        Err(e) => return vec![format!("invalid XML: {}", e)],
    };
    let root = document.root();

    if !root.is(NS_METADATA, "EntityDescriptor") {
        errors.push(format!(
            "root element must be md:EntityDescriptor, found {}",
            root.qualified_name()
        ));
        return errors;
    }

    if root.attr("entityID").is_none_or(|id| id.trim().is_empty()) {
        errors.push("EntityDescriptor has no entityID".to_string());
    }

    if let Some(valid_until) = root.attr("validUntil") {
        match DateTime::parse_from_rfc3339(valid_until) {
            Ok(instant) if instant.with_timezone(&Utc) <= now => {
                errors.push(format!("validUntil {} has expired", valid_until));
            }
            Ok(_) => {}
            Err(_) => errors.push(format!("validUntil '{}' is not an xs:dateTime", valid_until)),
        }
    }

    if let Some(cache_duration) = root.attr("cacheDuration")
        && !is_valid_duration(cache_duration)
    {
        errors.push(format!("cacheDuration '{}' is not an xs:duration", cache_duration));
    }

    check_order(root, ENTITY_ORDER, &mut errors);

    let descriptors: Vec<&Element> = root.children_named(NS_METADATA, "SPSSODescriptor").collect();
    match descriptors.as_slice() {
        [descriptor] => check_descriptor(descriptor, &mut errors),
        [] => errors.push("missing md:SPSSODescriptor".to_string()),
        _ => errors.push(format!(
            "expected exactly one md:SPSSODescriptor, found {}",
            descriptors.len()
        )),
    }

    for contact in root.children_named(NS_METADATA, "ContactPerson") {
        match contact.attr("contactType") {
            Some(kind) if CONTACT_TYPES.contains(&kind) => {}
            Some(kind) => errors.push(format!("invalid contactType '{}'", kind)),
            None => errors.push("ContactPerson has no contactType".to_string()),
        }
    }

    errors
}

const ENTITY_ORDER: &[&str] = &[
    "Signature",
    "Extensions",
    "SPSSODescriptor",
    "Organization",
    "ContactPerson",
    "AdditionalMetadataLocation",
];

const DESCRIPTOR_ORDER: &[&str] = &[
    "Signature",
    "Extensions",
    "KeyDescriptor",
    "ArtifactResolutionService",
    "SingleLogoutService",
    "ManageNameIDService",
    "NameIDFormat",
    "AssertionConsumerService",
    "AttributeConsumingService",
];

fn check_order(parent: &Element, order: &[&str], errors: &mut Vec<String>) {
    let mut last = 0;
    for child in parent.children() {
        let Some(rank) = order.iter().position(|name| *name == child.local_name()) else {
            errors.push(format!(
                "unexpected element {} in {}",
                child.qualified_name(),
                parent.local_name()
            ));
            continue;
        };
        if rank < last {
            errors.push(format!(
                "{} is out of order in {}",
                child.local_name(),
                parent.local_name()
            ));
        }
        last = last.max(rank);
    }
}

fn check_descriptor(descriptor: &Element, errors: &mut Vec<String>) {
    let supports_saml2 = descriptor
        .attr("protocolSupportEnumeration")
        .is_some_and(|protocols| protocols.split_whitespace().any(|p| p == NS_PROTOCOL));
    if !supports_saml2 {
        errors.push("SPSSODescriptor protocolSupportEnumeration must list SAML 2.0".to_string());
    }

    check_order(descriptor, DESCRIPTOR_ORDER, errors);

    for key_descriptor in descriptor.children_named(NS_METADATA, "KeyDescriptor") {
        if let Some(usage) = key_descriptor.attr("use")
            && usage != "signing"
            && usage != "encryption"
        {
            errors.push(format!("KeyDescriptor has invalid use '{}'", usage));
        }
        if key_descriptor.child(NS_DSIG, "KeyInfo").is_none() {
            errors.push("KeyDescriptor has no ds:KeyInfo".to_string());
        }
    }

    for name in ["SingleLogoutService", "AssertionConsumerService"] {
        for endpoint in descriptor.children_named(NS_METADATA, name) {
            if endpoint.attr("Binding").is_none_or(str::is_empty) {
                errors.push(format!("{} has no Binding", name));
            }
            if endpoint.attr("Location").is_none_or(str::is_empty) {
                errors.push(format!("{} has no Location", name));
            }
        }
    }

    let mut indexes = HashSet::new();
    let mut acs_count = 0;
    for acs in descriptor.children_named(NS_METADATA, "AssertionConsumerService") {
        acs_count += 1;
        match acs.attr("index").map(str::parse::<u16>) {
            Some(Ok(index)) => {
                if !indexes.insert(index) {
                    errors.push(format!("duplicate AssertionConsumerService index {}", index));
                }
            }
            Some(Err(_)) => errors.push("AssertionConsumerService index is not a number".to_string()),
            None => errors.push("AssertionConsumerService has no index".to_string()),
        }
    }
    if acs_count == 0 {
        errors.push("SPSSODescriptor has no AssertionConsumerService".to_string());
    }
}

fn key_descriptor(usage: &str, certificate: &X509) -> SamlResult<String> {
    Ok(format!(
        concat!(
            "<md:KeyDescriptor use=\"{}\">",
            "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
            "</md:KeyDescriptor>"
        ),
        usage,
        certificate_body(certificate)?
    ))
}

fn descriptor_id(entity_id: &str) -> SamlResult<String> {
    let digest = DigestAlgorithm::Sha256.digest(entity_id.as_bytes())?;
    Ok(format!("_{}", &hex::encode(digest)[..32]))
}
