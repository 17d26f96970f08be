//! Keys, configuration and IdP-side message builders shared by the tests.
//!
//! Key pairs are generated once per test binary. Messages are built the way
//! an IdP would: assertion signed first, then encrypted, then embedded in a
//! Response that may itself be signed.

use std::sync::LazyLock;

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Duration, Utc};
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509, X509Builder, X509NameBuilder},
};
use url::form_urlencoded::byte_serialize;

use crate::{
    bindings::{MessageParam, encode_redirect},
    config::{
        IdentityProviderConfig, LoggingConfig, MetadataConfig, PemSource, SecurityConfig,
        ServiceProviderConfig, SpConfig,
    },
    constants::{
        AUTHN_CONTEXT_PASSWORD_PROTECTED, CM_BEARER, NS_ASSERTION, NS_PROTOCOL, NS_XS, NS_XSI,
        name_id_format, status,
    },
    crypto::{
        DigestAlgorithm, SignatureAlgorithm, SigningCredentials, dsig::sign_element, sign_bytes,
        xmlenc::encrypt_element,
    },
    message::{format_instant, generate_id},
    settings::Settings,
    xml::escape_value,
};

pub const SP_ENTITY_ID: &str = "https://sp.example.com/saml/metadata";
pub const ACS_URL: &str = "https://sp.example.com/saml/acs";
pub const SLS_URL: &str = "https://sp.example.com/saml/sls";
pub const IDP_ENTITY_ID: &str = "https://idp.example.com/saml";
pub const IDP_SSO_URL: &str = "https://idp.example.com/saml/sso";
pub const IDP_SLO_URL: &str = "https://idp.example.com/saml/slo";
pub const USER: &str = "alice@example.com";
pub const SESSION_INDEX: &str = "sess-42";

pub struct TestCredentials {
    pub key: PKey<Private>,
    pub certificate: X509,
    pub key_pem: String,
    pub certificate_pem: String,
}

static IDP: LazyLock<TestCredentials> = LazyLock::new(|| generate_credentials("idp.example.com"));
static SP: LazyLock<TestCredentials> = LazyLock::new(|| generate_credentials("sp.example.com"));

pub fn idp_credentials() -> &'static TestCredentials {
    &IDP
}

pub fn sp_credentials() -> &'static TestCredentials {
    &SP
}

/// Self-signed RSA-2048 certificate valid for a year.
fn generate_credentials(common_name: &str) -> TestCredentials {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(365).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let certificate = builder.build();

    TestCredentials {
        key_pem: String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap(),
        certificate_pem: String::from_utf8(certificate.to_pem().unwrap()).unwrap(),
        key,
        certificate,
    }
}

/// What the IdP signs with.
pub fn idp_signing() -> SigningCredentials {
    let idp = idp_credentials();
    SigningCredentials {
        key: idp.key.clone(),
        certificate: idp.certificate.clone(),
        signature_algorithm: SignatureAlgorithm::RsaSha256,
        digest_algorithm: DigestAlgorithm::Sha256,
    }
}

/// SP with a key pair, trusting the test IdP, all bindings HTTP-Redirect and
/// every optional signing flag off.
pub fn sp_config() -> SpConfig {
    SpConfig {
        sp: ServiceProviderConfig {
            entity_id: SP_ENTITY_ID.into(),
            acs_url: ACS_URL.into(),
            sls_url: Some(SLS_URL.into()),
            name_id_format: None,
            certificate: Some(PemSource::Pem(sp_credentials().certificate_pem.clone())),
            new_certificate: None,
            private_key: Some(PemSource::Pem(sp_credentials().key_pem.clone())),
        },
        idp: IdentityProviderConfig {
            entity_id: IDP_ENTITY_ID.into(),
            sso_url: Some(IDP_SSO_URL.into()),
            sso_binding: Default::default(),
            slo_url: Some(IDP_SLO_URL.into()),
            slo_response_url: None,
            slo_binding: Default::default(),
            certificates: vec![PemSource::Pem(idp_credentials().certificate_pem.clone())],
            certificate_fingerprint: None,
            fingerprint_algorithm: DigestAlgorithm::Sha256,
        },
        security: SecurityConfig::default(),
        metadata: MetadataConfig::default(),
        logging: LoggingConfig::default(),
    }
}

pub fn settings() -> Settings {
    settings_with(|_| {})
}

pub fn settings_with(customize: impl FnOnce(&mut SpConfig)) -> Settings {
    let mut config = sp_config();
    customize(&mut config);
    Settings::from_config(&config).unwrap()
}

/// Percent-escapes in `query` rewritten to lowercase hex.
fn lowercase_escapes(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    let mut remaining = 0;
    for c in query.chars() {
        if remaining > 0 {
            out.push(c.to_ascii_lowercase());
            remaining -= 1;
        } else {
            if c == '%' {
                remaining = 2;
            }
            out.push(c);
        }
    }
    out
}

fn url_encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// Redirect query (without `?`) for `xml`, signed by the IdP when `signed`.
fn idp_redirect_query(
    param: MessageParam,
    xml: &str,
    signed: bool,
    relay_state: Option<&str>,
) -> String {
    let signer = idp_signing();
    let url = encode_redirect(SLS_URL, param, xml, relay_state, signed.then_some(&signer)).unwrap();
    url.split_once('?').unwrap().1.to_string()
}

/// Redirect query signed over lowercase percent-escapes, as some IdPs emit.
fn idp_redirect_query_lowercase(param: MessageParam, xml: &str, relay_state: Option<&str>) -> String {
    let signer = idp_signing();
    let mut query = lowercase_escapes(&idp_redirect_query(param, xml, false, relay_state));
    query.push_str("&SigAlg=");
    query.push_str(&lowercase_escapes(&url_encode(signer.signature_algorithm.uri())));
    let signature = sign_bytes(&signer.key, signer.signature_algorithm, query.as_bytes()).unwrap();
    query.push_str("&Signature=");
    query.push_str(&url_encode(&STANDARD.encode(signature)));
    query
}

fn idp_post_payload(xml: &str, id: &str, signed: bool) -> String {
    let xml = if signed {
        sign_element(xml, id, &idp_signing()).unwrap()
    } else {
        xml.to_string()
    };
    STANDARD.encode(xml)
}

fn name_id_xml(encrypt: bool) -> String {
    let plain = format!(
        r#"<saml:NameID xmlns:saml="{}" Format="{}">{}</saml:NameID>"#,
        NS_ASSERTION,
        name_id_format::EMAIL_ADDRESS,
        USER
    );
    if encrypt {
        encrypt_element(&plain, &sp_credentials().certificate, "EncryptedID").unwrap()
    } else {
        plain
    }
}

/// A standalone `saml:Assertion` as the test IdP would issue it.
#[derive(Debug, Clone)]
pub struct AssertionFixture {
    pub id: String,
    pub issuer: String,
    pub audience: String,
    pub recipient: String,
    pub in_response_to: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_on_or_after: DateTime<Utc>,
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    pub bearer: bool,
    pub encrypt_name_id: bool,
    /// (Name, FriendlyName, values)
    pub attributes: Vec<(String, Option<String>, Vec<String>)>,
}

impl AssertionFixture {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            issuer: IDP_ENTITY_ID.into(),
            audience: SP_ENTITY_ID.into(),
            recipient: ACS_URL.into(),
            in_response_to: None,
            not_before: now - Duration::minutes(5),
            not_on_or_after: now + Duration::minutes(10),
            session_not_on_or_after: None,
            bearer: true,
            encrypt_name_id: false,
            attributes: vec![
                ("mail".into(), Some("email".into()), vec![USER.into()]),
                ("groups".into(), None, vec!["admins".into(), "users".into()]),
            ],
        }
    }

    pub fn to_xml(&self) -> String {
        let now = Utc::now();

        let confirmation = if self.bearer {
            let in_response_to = self
                .in_response_to
                .as_deref()
                .map(|id| format!(r#" InResponseTo="{}""#, escape_value(id)))
                .unwrap_or_default();
            format!(
                concat!(
                    r#"<saml:SubjectConfirmation Method="{}">"#,
                    r#"<saml:SubjectConfirmationData NotOnOrAfter="{}" Recipient="{}"{}/>"#,
                    "</saml:SubjectConfirmation>"
                ),
                CM_BEARER,
                format_instant(self.not_on_or_after),
                escape_value(&self.recipient),
                in_response_to
            )
        } else {
            String::new()
        };

        let session_not_on_or_after = self
            .session_not_on_or_after
            .map(|instant| format!(r#" SessionNotOnOrAfter="{}""#, format_instant(instant)))
            .unwrap_or_default();

        let attributes: String = self
            .attributes
            .iter()
            .map(|(name, friendly_name, values)| {
                let friendly = friendly_name
                    .as_deref()
                    .map(|f| format!(r#" FriendlyName="{}""#, escape_value(f)))
                    .unwrap_or_default();
                let values: String = values
                    .iter()
                    .map(|v| {
                        format!(
                            r#"<saml:AttributeValue xsi:type="xs:string">{}</saml:AttributeValue>"#,
                            escape_value(v)
                        )
                    })
                    .collect();
                format!(
                    r#"<saml:Attribute Name="{}"{}>{}</saml:Attribute>"#,
                    escape_value(name),
                    friendly,
                    values
                )
            })
            .collect();

        format!(
            concat!(
                r#"<saml:Assertion xmlns:saml="{saml}" xmlns:xs="{xs}" xmlns:xsi="{xsi}" "#,
                r#"ID="{id}" Version="2.0" IssueInstant="{now}">"#,
                "<saml:Issuer>{issuer}</saml:Issuer>",
                "<saml:Subject>{name_id}{confirmation}</saml:Subject>",
                r#"<saml:Conditions NotBefore="{not_before}" NotOnOrAfter="{not_on_or_after}">"#,
                "<saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>",
                "</saml:Conditions>",
                r#"<saml:AuthnStatement AuthnInstant="{now}" SessionIndex="{session_index}"{session_end}>"#,
                "<saml:AuthnContext><saml:AuthnContextClassRef>{class_ref}</saml:AuthnContextClassRef></saml:AuthnContext>",
                "</saml:AuthnStatement>",
                "<saml:AttributeStatement>{attributes}</saml:AttributeStatement>",
                "</saml:Assertion>"
            ),
            saml = NS_ASSERTION,
            xs = NS_XS,
            xsi = NS_XSI,
            id = self.id,
            now = format_instant(now),
            issuer = escape_value(&self.issuer),
            name_id = name_id_xml(self.encrypt_name_id),
            confirmation = confirmation,
            not_before = format_instant(self.not_before),
            not_on_or_after = format_instant(self.not_on_or_after),
            audience = escape_value(&self.audience),
            session_index = SESSION_INDEX,
            session_end = session_not_on_or_after,
            class_ref = AUTHN_CONTEXT_PASSWORD_PROTECTED,
            attributes = attributes,
        )
    }
}

/// A `samlp:Response` carrying an [`AssertionFixture`].
#[derive(Debug, Clone)]
pub struct ResponseFixture {
    pub assertion: AssertionFixture,
    pub sign_assertion: bool,
    pub sign_response: bool,
    pub encrypt_assertion: bool,
    pub status: String,
    pub destination: Option<String>,
    /// Set on the Response and, unless the assertion names its own, on the
    /// bearer confirmation.
    pub in_response_to: Option<String>,
    pub duplicate_assertion: bool,
    pub signature_algorithm: SignatureAlgorithm,
    pub digest_algorithm: DigestAlgorithm,
}

impl ResponseFixture {
    pub fn new() -> Self {
        Self {
            assertion: AssertionFixture::new(),
            sign_assertion: true,
            sign_response: false,
            encrypt_assertion: false,
            status: status::SUCCESS.into(),
            destination: Some(ACS_URL.into()),
            in_response_to: None,
            duplicate_assertion: false,
            signature_algorithm: SignatureAlgorithm::RsaSha256,
            digest_algorithm: DigestAlgorithm::Sha256,
        }
    }

    fn signer(&self) -> SigningCredentials {
        SigningCredentials {
            signature_algorithm: self.signature_algorithm,
            digest_algorithm: self.digest_algorithm,
            ..idp_signing()
        }
    }

    pub fn to_xml(&self) -> String {
        let signer = self.signer();

        let mut assertion = self.assertion.clone();
        if assertion.in_response_to.is_none() {
            assertion.in_response_to = self.in_response_to.clone();
        }
        let mut assertion_xml = assertion.to_xml();
        if self.sign_assertion {
            assertion_xml = sign_element(&assertion_xml, &assertion.id, &signer).unwrap();
        }
        if self.encrypt_assertion {
            assertion_xml =
                encrypt_element(&assertion_xml, &sp_credentials().certificate, "EncryptedAssertion")
                    .unwrap();
        }
        if self.duplicate_assertion {
            assertion_xml = assertion_xml.repeat(2);
        }

        let response_id = generate_id();
        let mut attributes = String::new();
        if let Some(destination) = &self.destination {
            attributes.push_str(&format!(r#" Destination="{}""#, escape_value(destination)));
        }
        if let Some(in_response_to) = &self.in_response_to {
            attributes.push_str(&format!(r#" InResponseTo="{}""#, escape_value(in_response_to)));
        }

        let xml = format!(
            concat!(
                r#"<samlp:Response xmlns:samlp="{samlp}" xmlns:saml="{saml}" "#,
                r#"ID="{id}" Version="2.0" IssueInstant="{now}"{attributes}>"#,
                "<saml:Issuer>{issuer}</saml:Issuer>",
                r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
                "{assertion}",
                "</samlp:Response>"
            ),
            samlp = NS_PROTOCOL,
            saml = NS_ASSERTION,
            id = response_id,
            now = format_instant(Utc::now()),
            attributes = attributes,
            issuer = IDP_ENTITY_ID,
            status = escape_value(&self.status),
            assertion = assertion_xml,
        );

        if self.sign_response {
            sign_element(&xml, &response_id, &signer).unwrap()
        } else {
            xml
        }
    }

    /// Base64 `SAMLResponse` form value.
    pub fn encoded(&self) -> String {
        STANDARD.encode(self.to_xml())
    }
}

/// An IdP-initiated `samlp:LogoutRequest`.
#[derive(Debug, Clone)]
pub struct LogoutRequestFixture {
    pub id: String,
    pub issuer: String,
    pub destination: Option<String>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub encrypt_name_id: bool,
}

impl LogoutRequestFixture {
    pub fn new() -> Self {
        Self {
            id: generate_id(),
            issuer: IDP_ENTITY_ID.into(),
            destination: Some(SLS_URL.into()),
            not_on_or_after: None,
            encrypt_name_id: false,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut attributes = String::new();
        if let Some(destination) = &self.destination {
            attributes.push_str(&format!(r#" Destination="{}""#, escape_value(destination)));
        }
        if let Some(not_on_or_after) = self.not_on_or_after {
            attributes.push_str(&format!(
                r#" NotOnOrAfter="{}""#,
                format_instant(not_on_or_after)
            ));
        }
        format!(
            concat!(
                r#"<samlp:LogoutRequest xmlns:samlp="{samlp}" xmlns:saml="{saml}" "#,
                r#"ID="{id}" Version="2.0" IssueInstant="{now}"{attributes}>"#,
                "<saml:Issuer>{issuer}</saml:Issuer>",
                "{name_id}",
                "<samlp:SessionIndex>{session_index}</samlp:SessionIndex>",
                "</samlp:LogoutRequest>"
            ),
            samlp = NS_PROTOCOL,
            saml = NS_ASSERTION,
            id = self.id,
            now = format_instant(Utc::now()),
            attributes = attributes,
            issuer = escape_value(&self.issuer),
            name_id = name_id_xml(self.encrypt_name_id),
            session_index = SESSION_INDEX,
        )
    }

    pub fn redirect_query(&self, signed: bool, relay_state: Option<&str>) -> String {
        idp_redirect_query(MessageParam::Request, &self.to_xml(), signed, relay_state)
    }

    pub fn redirect_query_lowercase_escapes(&self, relay_state: Option<&str>) -> String {
        idp_redirect_query_lowercase(MessageParam::Request, &self.to_xml(), relay_state)
    }

    pub fn post_payload(&self, signed: bool) -> String {
        idp_post_payload(&self.to_xml(), &self.id, signed)
    }
}

/// The IdP's answer to an SP-initiated LogoutRequest.
#[derive(Debug, Clone)]
pub struct LogoutResponseFixture {
    pub id: String,
    pub in_response_to: String,
    pub issuer: String,
    pub destination: Option<String>,
    pub status: String,
}

impl LogoutResponseFixture {
    pub fn new(in_response_to: &str) -> Self {
        Self {
            id: generate_id(),
            in_response_to: in_response_to.into(),
            issuer: IDP_ENTITY_ID.into(),
            destination: Some(SLS_URL.into()),
            status: status::SUCCESS.into(),
        }
    }

    pub fn to_xml(&self) -> String {
        let destination = self
            .destination
            .as_deref()
            .map(|d| format!(r#" Destination="{}""#, escape_value(d)))
            .unwrap_or_default();
        format!(
            concat!(
                r#"<samlp:LogoutResponse xmlns:samlp="{samlp}" xmlns:saml="{saml}" "#,
                r#"ID="{id}" Version="2.0" IssueInstant="{now}" InResponseTo="{irt}"{destination}>"#,
                "<saml:Issuer>{issuer}</saml:Issuer>",
                r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
                "</samlp:LogoutResponse>"
            ),
            samlp = NS_PROTOCOL,
            saml = NS_ASSERTION,
            id = self.id,
            now = format_instant(Utc::now()),
            irt = escape_value(&self.in_response_to),
            destination = destination,
            issuer = escape_value(&self.issuer),
            status = escape_value(&self.status),
        )
    }

    pub fn redirect_query(&self, signed: bool, relay_state: Option<&str>) -> String {
        idp_redirect_query(MessageParam::Response, &self.to_xml(), signed, relay_state)
    }

    pub fn post_payload(&self, signed: bool) -> String {
        idp_post_payload(&self.to_xml(), &self.id, signed)
    }
}

#[test]
fn test_lowercase_escapes() {
    assert_eq!(lowercase_escapes("a=%2F%3Db%2B"), "a=%2f%3db%2b");
    assert_eq!(lowercase_escapes("SAMLRequest=AB"), "SAMLRequest=AB");
}
