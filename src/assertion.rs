//! Assertion parsing and validation.
//!
//! Parsing is a hard gate: an assertion missing its Issuer, Subject,
//! Conditions or AuthnStatement is malformed and nothing else is checked.
//! Past that point every rule runs and all failures are reported together.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};

use crate::{
    constants::{CM_BEARER, NS_ASSERTION},
    crypto::xmlenc::decrypt_element,
    error::{SamlError, SamlResult, ValidationReason},
    message::{instant_attr, issuer},
    settings::Settings,
    xml::Element,
};

/// A subject identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameId {
    pub value: String,
    pub format: Option<String>,
    pub name_qualifier: Option<String>,
    pub sp_name_qualifier: Option<String>,
}

impl NameId {
    pub(crate) fn from_element(element: &Element) -> Self {
        Self {
            value: element.trimmed_text(),
            format: element.attr("Format").map(str::to_string),
            name_qualifier: element.attr("NameQualifier").map(str::to_string),
            sp_name_qualifier: element.attr("SPNameQualifier").map(str::to_string),
        }
    }

    /// Read `saml:NameID` or decrypt `saml:EncryptedID` under `parent`.
    /// Returns the identifier and whether it arrived encrypted.
    pub(crate) fn from_parent(
        parent: &Element,
        key: Option<&PKey<Private>>,
        reject_deprecated: bool,
    ) -> SamlResult<(Self, bool)> {
        if let Some(name_id) = parent.child(NS_ASSERTION, "NameID") {
            return Ok((Self::from_element(name_id), false));
        }
        let encrypted = parent
            .child(NS_ASSERTION, "EncryptedID")
            .ok_or_else(|| SamlError::MalformedMessage("missing NameID".into()))?;
        let key = key.ok_or_else(|| {
            SamlError::Decryption("EncryptedID received but no SP private key is configured".into())
        })?;
        let decrypted = decrypt_element(encrypted, key, reject_deprecated)?;
        if !decrypted.is(NS_ASSERTION, "NameID") {
            return Err(SamlError::MalformedMessage(format!(
                "EncryptedID contains {} instead of NameID",
                decrypted.local_name()
            )));
        }
        Ok((Self::from_element(&decrypted), true))
    }
}

/// `saml:Conditions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    /// One entry per `AudienceRestriction`, each listing its audiences.
    pub audience_restrictions: Vec<Vec<String>>,
}

/// Bearer `SubjectConfirmationData`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BearerConfirmation {
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub recipient: Option<String>,
    pub in_response_to: Option<String>,
}

/// A named attribute with its values in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlAttribute {
    pub name: String,
    pub friendly_name: Option<String>,
    pub name_format: Option<String>,
    pub values: Vec<String>,
}

/// A validated assertion.
#[derive(Debug, Clone)]
pub struct Assertion {
    id: String,
    issuer: String,
    issue_instant: Option<DateTime<Utc>>,
    name_id: NameId,
    name_id_encrypted: bool,
    bearer: Option<BearerConfirmation>,
    conditions: Conditions,
    authn_instant: Option<DateTime<Utc>>,
    session_index: Option<String>,
    session_not_on_or_after: Option<DateTime<Utc>>,
    authn_context_class_ref: Option<String>,
    attributes: Vec<SamlAttribute>,
}

impl Assertion {
    /// Parse `element` (a plaintext `saml:Assertion`). An `EncryptedID` is
    /// decrypted with `key`.
    pub(crate) fn from_element(
        element: &Element,
        key: Option<&PKey<Private>>,
        reject_deprecated: bool,
    ) -> SamlResult<Self> {
        if !element.is(NS_ASSERTION, "Assertion") {
            return Err(SamlError::MalformedMessage(format!(
                "expected saml:Assertion, found {}",
                element.local_name()
            )));
        }
        let id = element
            .attr("ID")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| SamlError::MalformedMessage("Assertion has no ID".into()))?
            .to_string();
        let issuer = issuer(element)
            .filter(|issuer| !issuer.is_empty())
            .ok_or_else(|| SamlError::MalformedMessage("Assertion has no Issuer".into()))?;

        let subject = element
            .child(NS_ASSERTION, "Subject")
            .ok_or_else(|| SamlError::MalformedMessage("Assertion has no Subject".into()))?;
        let (name_id, name_id_encrypted) = NameId::from_parent(subject, key, reject_deprecated)?;

        let mut bearer = None;
        for confirmation in subject.children_named(NS_ASSERTION, "SubjectConfirmation") {
            if confirmation.attr("Method") != Some(CM_BEARER) {
                continue;
            }
            let data = confirmation.child(NS_ASSERTION, "SubjectConfirmationData");
            bearer = Some(match data {
                Some(data) => BearerConfirmation {
                    not_before: instant_attr(data, "NotBefore")?,
                    not_on_or_after: instant_attr(data, "NotOnOrAfter")?,
                    recipient: data.attr("Recipient").map(str::to_string),
                    in_response_to: data.attr("InResponseTo").map(str::to_string),
                },
                None => BearerConfirmation::default(),
            });
            break;
        }

        let conditions_el = element
            .child(NS_ASSERTION, "Conditions")
            .ok_or_else(|| SamlError::MalformedMessage("Assertion has no Conditions".into()))?;
        let conditions = Conditions {
            not_before: instant_attr(conditions_el, "NotBefore")?,
            not_on_or_after: instant_attr(conditions_el, "NotOnOrAfter")?,
            audience_restrictions: conditions_el
                .children_named(NS_ASSERTION, "AudienceRestriction")
                .map(|restriction| {
                    restriction
                        .children_named(NS_ASSERTION, "Audience")
                        .map(Element::trimmed_text)
                        .collect()
                })
                .collect(),
        };

        let authn = element
            .child(NS_ASSERTION, "AuthnStatement")
            .ok_or_else(|| SamlError::MalformedMessage("Assertion has no AuthnStatement".into()))?;

        let mut attributes = Vec::new();
        for statement in element.children_named(NS_ASSERTION, "AttributeStatement") {
            for attribute in statement.children_named(NS_ASSERTION, "Attribute") {
                let name = attribute
                    .attr("Name")
                    .ok_or_else(|| SamlError::MalformedMessage("Attribute has no Name".into()))?;
                attributes.push(SamlAttribute {
                    name: name.to_string(),
                    friendly_name: attribute.attr("FriendlyName").map(str::to_string),
                    name_format: attribute.attr("NameFormat").map(str::to_string),
                    values: attribute
                        .children_named(NS_ASSERTION, "AttributeValue")
                        .map(Element::text)
                        .collect(),
                });
            }
        }

        Ok(Self {
            id,
            issuer,
            issue_instant: instant_attr(element, "IssueInstant")?,
            name_id,
            name_id_encrypted,
            bearer,
            conditions,
            authn_instant: instant_attr(authn, "AuthnInstant")?,
            session_index: authn.attr("SessionIndex").map(str::to_string),
            session_not_on_or_after: instant_attr(authn, "SessionNotOnOrAfter")?,
            authn_context_class_ref: authn
                .child(NS_ASSERTION, "AuthnContext")
                .and_then(|ctx| ctx.child(NS_ASSERTION, "AuthnContextClassRef"))
                .map(Element::trimmed_text),
            attributes,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn issue_instant(&self) -> Option<DateTime<Utc>> {
        self.issue_instant
    }

    pub fn name_id(&self) -> &NameId {
        &self.name_id
    }

    pub fn name_id_format(&self) -> Option<&str> {
        self.name_id.format.as_deref()
    }

    pub fn session_index(&self) -> Option<&str> {
        self.session_index.as_deref()
    }

    pub fn authn_instant(&self) -> Option<DateTime<Utc>> {
        self.authn_instant
    }

    pub fn session_not_on_or_after(&self) -> Option<DateTime<Utc>> {
        self.session_not_on_or_after
    }

    pub fn authn_context_class_ref(&self) -> Option<&str> {
        self.authn_context_class_ref.as_deref()
    }

    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    pub fn attributes(&self) -> &[SamlAttribute] {
        &self.attributes
    }

    /// Values of the attribute whose Name, or failing that FriendlyName, is `name`.
    pub fn attribute(&self, name: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|a| a.friendly_name.as_deref() == Some(name))
            })
            .map(|a| a.values.as_slice())
    }

    /// First value of [`Assertion::attribute`].
    pub fn first_attribute_value(&self, name: &str) -> Option<&str> {
        self.attribute(name)?.first().map(String::as_str)
    }

    pub(crate) fn bearer(&self) -> Option<&BearerConfirmation> {
        self.bearer.as_ref()
    }
}

/// What the request-ID store said about the response's `InResponseTo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InResponseTo {
    /// The response names no request.
    Absent,
    /// An outstanding request issued by this SP.
    Known(String),
    /// A request ID the store does not know (never issued, expired or
    /// already answered).
    Unknown(String),
}

/// Everything outside the assertion that validation depends on.
#[derive(Debug)]
pub struct ValidationContext<'a> {
    pub settings: &'a Settings,
    pub now: DateTime<Utc>,
    /// `Destination` of the enclosing Response.
    pub destination: Option<&'a str>,
    /// `Issuer` of the enclosing Response, if it has one.
    pub response_issuer: Option<&'a str>,
    pub in_response_to: InResponseTo,
    /// Whether the assertion arrived as an `EncryptedAssertion`.
    pub assertion_encrypted: bool,
}

/// Run every validation rule against `assertion`, returning all failures in
/// the order the rules ran.
pub fn validate(assertion: &Assertion, ctx: &ValidationContext<'_>) -> Vec<SamlError> {
    let settings = ctx.settings;
    let security = settings.security();
    let mut errors = Vec::new();

    if let Some(error) = check_window(assertion, ctx.now, settings.clock_skew()) {
        errors.push(error);
    }

    let audience_ok = !assertion.conditions.audience_restrictions.is_empty()
        && assertion
            .conditions
            .audience_restrictions
            .iter()
            .all(|audiences| audiences.iter().any(|a| a == settings.sp_entity_id()));
    if !audience_ok {
        errors.push(SamlError::validation(
            ValidationReason::AudienceMismatch,
            format!("audience does not include {}", settings.sp_entity_id()),
        ));
    }

    if security.check_destination {
        if let Some(destination) = ctx.destination
            && destination != settings.acs_url()
        {
            errors.push(SamlError::validation(
                ValidationReason::DestinationMismatch,
                format!("Destination {} is not {}", destination, settings.acs_url()),
            ));
        }
        if let Some(bearer) = &assertion.bearer
            && bearer.recipient.as_deref() != Some(settings.acs_url())
        {
            errors.push(SamlError::validation(
                ValidationReason::DestinationMismatch,
                format!(
                    "Recipient {} is not {}",
                    bearer.recipient.as_deref().unwrap_or("(missing)"),
                    settings.acs_url()
                ),
            ));
        }
    }

    if let InResponseTo::Unknown(id) = &ctx.in_response_to
        && !security.allow_unsolicited_responses
    {
        errors.push(SamlError::validation(
            ValidationReason::UnsolicitedResponse,
            format!("InResponseTo {} does not match an outstanding request", id),
        ));
    }
    if let (Some(bearer_irt), InResponseTo::Known(id) | InResponseTo::Unknown(id)) =
        (assertion.bearer.as_ref().and_then(|b| b.in_response_to.as_deref()), &ctx.in_response_to)
        && bearer_irt != id
    {
        errors.push(SamlError::validation(
            ValidationReason::UnsolicitedResponse,
            format!("SubjectConfirmationData InResponseTo {} differs from {}", bearer_irt, id),
        ));
    }

    if assertion.issuer != settings.idp_entity_id() {
        errors.push(SamlError::validation(
            ValidationReason::IssuerMismatch,
            format!("assertion issuer {} is not {}", assertion.issuer, settings.idp_entity_id()),
        ));
    }
    if let Some(response_issuer) = ctx.response_issuer
        && response_issuer != settings.idp_entity_id()
    {
        errors.push(SamlError::validation(
            ValidationReason::IssuerMismatch,
            format!("response issuer {} is not {}", response_issuer, settings.idp_entity_id()),
        ));
    }

    if assertion.bearer.is_none() {
        errors.push(SamlError::validation(
            ValidationReason::SubjectConfirmation,
            "no bearer SubjectConfirmation",
        ));
    }

    if security.want_assertions_encrypted && !ctx.assertion_encrypted {
        errors.push(SamlError::validation(
            ValidationReason::EncryptionRequired,
            "assertion is not encrypted",
        ));
    }
    if security.want_name_id_encrypted && !assertion.name_id_encrypted {
        errors.push(SamlError::validation(
            ValidationReason::EncryptionRequired,
            "NameID is not encrypted",
        ));
    }

    let mut seen = HashSet::new();
    for attribute in &assertion.attributes {
        if !seen.insert(attribute.name.as_str()) {
            errors.push(SamlError::validation(
                ValidationReason::DuplicateAttribute,
                format!("attribute {} appears more than once", attribute.name),
            ));
        }
    }

    errors
}

/// `NotBefore <= now < NotOnOrAfter` over the conditions, the bearer
/// confirmation and the session lifetime. Returns at most one error.
fn check_window(
    assertion: &Assertion,
    now: DateTime<Utc>,
    skew: chrono::Duration,
) -> Option<SamlError> {
    let bearer = assertion.bearer.as_ref();
    let ends = [
        ("Conditions NotOnOrAfter", assertion.conditions.not_on_or_after),
        ("SubjectConfirmationData NotOnOrAfter", bearer.and_then(|b| b.not_on_or_after)),
        ("SessionNotOnOrAfter", assertion.session_not_on_or_after),
    ];
    for (name, end) in ends {
        if let Some(end) = end
            && now - skew >= end
        {
            return Some(SamlError::validation(
                ValidationReason::Expired,
                format!("{} {} has passed", name, end),
            ));
        }
    }

    let starts = [
        ("Conditions NotBefore", assertion.conditions.not_before),
        ("SubjectConfirmationData NotBefore", bearer.and_then(|b| b.not_before)),
    ];
    for (name, start) in starts {
        if let Some(start) = start
            && now + skew < start
        {
            return Some(SamlError::validation(
                ValidationReason::NotYetValid,
                format!("{} {} is in the future", name, start),
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rstest::rstest;

    use super::*;
    use crate::{
        tests::fixtures::{self, AssertionFixture},
        xml::Document,
    };

    fn parse(fixture: &AssertionFixture) -> Assertion {
        let xml = fixture.to_xml();
        let doc = Document::parse(&xml).unwrap();
        let key = &fixtures::sp_credentials().key;
        Assertion::from_element(doc.root(), Some(key), true).unwrap()
    }

    fn context(settings: &Settings) -> ValidationContext<'_> {
        ValidationContext {
            settings,
            now: Utc::now(),
            destination: Some(fixtures::ACS_URL),
            response_issuer: Some(fixtures::IDP_ENTITY_ID),
            in_response_to: InResponseTo::Absent,
            assertion_encrypted: false,
        }
    }

    fn reasons(errors: &[SamlError]) -> Vec<ValidationReason> {
        errors.iter().filter_map(SamlError::reason).collect()
    }

    #[test]
    fn test_valid_assertion_passes() {
        let settings = fixtures::settings();
        let assertion = parse(&AssertionFixture::new());
        assert!(validate(&assertion, &context(&settings)).is_empty());

        assert_eq!(assertion.name_id().value, fixtures::USER);
        assert_eq!(assertion.session_index(), Some(fixtures::SESSION_INDEX));
        assert_eq!(assertion.first_attribute_value("mail"), Some("alice@example.com"));
        // FriendlyName lookup
        assert_eq!(assertion.attribute("email").map(<[String]>::len), Some(1));
        assert_eq!(
            assertion.attribute("groups").unwrap(),
            &["admins".to_string(), "users".to_string()]
        );
        assert!(assertion.authn_context_class_ref().is_some());
    }

    #[rstest]
    #[case::conditions_expired(-10, 0, ValidationReason::Expired)]
    #[case::not_yet_valid(0, 10, ValidationReason::NotYetValid)]
    fn test_window(#[case] end_offset_mins: i64, #[case] start_offset_mins: i64, #[case] expected: ValidationReason) {
        let settings = fixtures::settings();
        let now = Utc::now();
        let mut fixture = AssertionFixture::new();
        if end_offset_mins != 0 {
            fixture.not_on_or_after = now + Duration::minutes(end_offset_mins);
            fixture.not_before = now - Duration::minutes(30);
        }
        if start_offset_mins != 0 {
            fixture.not_before = now + Duration::minutes(start_offset_mins);
        }
        let errors = validate(&parse(&fixture), &context(&settings));
        assert_eq!(reasons(&errors), vec![expected]);
    }

    #[test]
    fn test_not_on_or_after_is_exclusive() {
        let settings = fixtures::settings();
        let fixture = AssertionFixture::new();
        let assertion = parse(&fixture);
        let mut ctx = context(&settings);
        ctx.now = assertion.conditions().not_on_or_after.unwrap();
        assert_eq!(reasons(&validate(&assertion, &ctx)), vec![ValidationReason::Expired]);

        ctx.now -= Duration::seconds(1);
        assert!(validate(&assertion, &ctx).is_empty());
    }

    #[test]
    fn test_clock_skew_extends_window() {
        let settings = fixtures::settings_with(|config| config.security.clock_skew_secs = 120);
        let mut fixture = AssertionFixture::new();
        fixture.not_before = Utc::now() + Duration::seconds(60);
        assert!(validate(&parse(&fixture), &context(&settings)).is_empty());
    }

    #[test]
    fn test_session_not_on_or_after_expires() {
        let settings = fixtures::settings();
        let mut fixture = AssertionFixture::new();
        fixture.session_not_on_or_after = Some(Utc::now() - Duration::minutes(1));
        let errors = validate(&parse(&fixture), &context(&settings));
        assert_eq!(reasons(&errors), vec![ValidationReason::Expired]);
    }

    #[test]
    fn test_failures_are_collected() {
        let settings = fixtures::settings();
        let mut fixture = AssertionFixture::new();
        fixture.audience = "https://other-sp.example.com".into();
        fixture.issuer = "https://evil-idp.example.com".into();
        fixture.recipient = "https://other-sp.example.com/acs".into();
        fixture.not_on_or_after = Utc::now() - Duration::minutes(1);
        let errors = validate(&parse(&fixture), &context(&settings));
        assert_eq!(
            reasons(&errors),
            vec![
                ValidationReason::Expired,
                ValidationReason::AudienceMismatch,
                ValidationReason::DestinationMismatch,
                ValidationReason::IssuerMismatch,
            ]
        );
    }

    #[test]
    fn test_destination_checks_can_be_disabled() {
        let settings = fixtures::settings_with(|config| config.security.check_destination = false);
        let mut fixture = AssertionFixture::new();
        fixture.recipient = "https://elsewhere.example.com/acs".into();
        let mut ctx = context(&settings);
        ctx.destination = Some("https://elsewhere.example.com/acs");
        assert!(validate(&parse(&fixture), &ctx).is_empty());
    }

    #[test]
    fn test_unknown_in_response_to() {
        let settings = fixtures::settings();
        let mut fixture = AssertionFixture::new();
        fixture.in_response_to = Some("_unknown".into());
        let assertion = parse(&fixture);
        let mut ctx = context(&settings);
        ctx.in_response_to = InResponseTo::Unknown("_unknown".into());
        assert_eq!(
            reasons(&validate(&assertion, &ctx)),
            vec![ValidationReason::UnsolicitedResponse]
        );

        let lenient = fixtures::settings_with(|config| config.security.allow_unsolicited_responses = true);
        let mut ctx = context(&lenient);
        ctx.in_response_to = InResponseTo::Unknown("_unknown".into());
        assert!(validate(&assertion, &ctx).is_empty());
    }

    #[test]
    fn test_bearer_in_response_to_must_agree() {
        let settings = fixtures::settings();
        let mut fixture = AssertionFixture::new();
        fixture.in_response_to = Some("_other".into());
        let mut ctx = context(&settings);
        ctx.in_response_to = InResponseTo::Known("_issued".into());
        assert_eq!(
            reasons(&validate(&parse(&fixture), &ctx)),
            vec![ValidationReason::UnsolicitedResponse]
        );
    }

    #[test]
    fn test_missing_bearer_confirmation() {
        let settings = fixtures::settings();
        let mut fixture = AssertionFixture::new();
        fixture.bearer = false;
        assert_eq!(
            reasons(&validate(&parse(&fixture), &context(&settings))),
            vec![ValidationReason::SubjectConfirmation]
        );
    }

    #[test]
    fn test_encryption_requirements() {
        let settings = fixtures::settings_with(|config| {
            config.security.want_assertions_encrypted = true;
            config.security.want_name_id_encrypted = true;
        });
        let errors = validate(&parse(&AssertionFixture::new()), &context(&settings));
        assert_eq!(
            reasons(&errors),
            vec![ValidationReason::EncryptionRequired, ValidationReason::EncryptionRequired]
        );

        let mut fixture = AssertionFixture::new();
        fixture.encrypt_name_id = true;
        let assertion = parse(&fixture);
        assert_eq!(assertion.name_id().value, fixtures::USER);
        let mut ctx = context(&settings);
        ctx.assertion_encrypted = true;
        assert!(validate(&assertion, &ctx).is_empty());
    }

    #[test]
    fn test_duplicate_attribute() {
        let settings = fixtures::settings();
        let mut fixture = AssertionFixture::new();
        fixture.attributes.push(("mail".into(), None, vec!["other@example.com".into()]));
        assert_eq!(
            reasons(&validate(&parse(&fixture), &context(&settings))),
            vec![ValidationReason::DuplicateAttribute]
        );
    }

    #[rstest]
    #[case::no_issuer("<saml:Issuer>", "Issuer")]
    #[case::no_subject("<saml:Subject>", "Subject")]
    #[case::no_conditions("<saml:Conditions ", "Conditions")]
    #[case::no_authn_statement("<saml:AuthnStatement ", "AuthnStatement")]
    fn test_missing_required_element(#[case] opening: &str, #[case] name: &str) {
        let xml = AssertionFixture::new().to_xml();
        let start = xml.find(opening).unwrap();
        let close = format!("</saml:{}>", name);
        let end = xml[start..].find(&close).unwrap() + start + close.len();
        let stripped = format!("{}{}", &xml[..start], &xml[end..]);
        let doc = Document::parse(&stripped).unwrap();
        let err = Assertion::from_element(doc.root(), None, true).unwrap_err();
        assert!(matches!(err, SamlError::MalformedMessage(msg) if msg.contains(name)));
    }

    #[test]
    fn test_encrypted_name_id_without_key() {
        let mut fixture = AssertionFixture::new();
        fixture.encrypt_name_id = true;
        let doc = Document::parse(&fixture.to_xml()).unwrap();
        let err = Assertion::from_element(doc.root(), None, true).unwrap_err();
        assert!(matches!(err, SamlError::Decryption(_)));
    }
}
