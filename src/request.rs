//! Outbound AuthnRequest, LogoutRequest and LogoutResponse messages.

use chrono::Utc;

use crate::{
    bindings::{Binding, MessageParam, OutboundMessage, PostForm, encode_redirect},
    constants::{NS_ASSERTION, NS_PROTOCOL, SAML_VERSION, name_id_format},
    crypto::{dsig::sign_element, xmlenc::encrypt_element},
    error::{SamlError, SamlResult},
    message::{format_instant, generate_id},
    settings::Settings,
    store::{RequestIdStore, RequestKind},
    xml::escape_value,
};

/// An encoded request and the ID a response must answer.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub id: String,
    pub message: OutboundMessage,
}

/// Build an AuthnRequest for the IdP's SSO endpoint and register its ID.
///
/// `return_to` travels as RelayState.
pub async fn build_authn_request(
    settings: &Settings,
    return_to: Option<&str>,
    store: &dyn RequestIdStore,
) -> SamlResult<OutboundRequest> {
    let destination = settings
        .idp_sso_url()
        .ok_or_else(|| SamlError::Configuration("idp.sso_url is not configured".into()))?;
    let security = settings.security();
    let id = generate_id();

    let mut flags = String::new();
    if security.force_authn {
        flags.push_str(" ForceAuthn=\"true\"");
    }
    if security.is_passive {
        flags.push_str(" IsPassive=\"true\"");
    }

    let policy_format = if security.want_name_id_encrypted {
        name_id_format::ENCRYPTED
    } else {
        settings.name_id_format()
    };

    let requested_context = if security.requested_authn_context.is_empty() {
        String::new()
    } else {
        let refs: String = security
            .requested_authn_context
            .iter()
            .map(|class_ref| {
                format!(
                    "<saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef>",
                    escape_value(class_ref)
                )
            })
            .collect();
        format!(
            "<samlp:RequestedAuthnContext Comparison=\"{}\">{}</samlp:RequestedAuthnContext>",
            security.authn_context_comparison.as_str(),
            refs
        )
    };

    let xml = format!(
        concat!(
            "<samlp:AuthnRequest xmlns:samlp=\"{samlp}\" xmlns:saml=\"{saml}\" ",
            "ID=\"{id}\" Version=\"{version}\" IssueInstant=\"{instant}\" ",
            "Destination=\"{destination}\" ProtocolBinding=\"{binding}\" ",
            "AssertionConsumerServiceURL=\"{acs}\"{flags}>",
            "<saml:Issuer>{issuer}</saml:Issuer>",
            "<samlp:NameIDPolicy Format=\"{format}\" AllowCreate=\"true\"/>",
            "{context}",
            "</samlp:AuthnRequest>"
        ),
        samlp = NS_PROTOCOL,
        saml = NS_ASSERTION,
        id = id,
        version = SAML_VERSION,
        instant = format_instant(Utc::now()),
        destination = escape_value(destination),
        binding = Binding::HttpPost.uri(),
        acs = escape_value(settings.acs_url()),
        flags = flags,
        issuer = escape_value(settings.sp_entity_id()),
        format = escape_value(policy_format),
        context = requested_context,
    );

    let message = encode(
        settings,
        settings.idp_sso_binding(),
        destination,
        MessageParam::Request,
        &xml,
        &id,
        return_to,
        security.authn_requests_signed,
    )?;
    store.put(&id, RequestKind::Authn, Utc::now() + settings.request_id_ttl()).await?;

    tracing::debug!(
        request_id = %id,
        binding = ?settings.idp_sso_binding(),
        signed = security.authn_requests_signed,
        "Built AuthnRequest"
    );

    Ok(OutboundRequest { id, message })
}

/// Build a LogoutRequest for the IdP's SLO endpoint and register its ID.
pub async fn build_logout_request(
    settings: &Settings,
    name_id: &str,
    session_index: Option<&str>,
    return_to: Option<&str>,
    store: &dyn RequestIdStore,
) -> SamlResult<OutboundRequest> {
    let destination = settings
        .idp_slo_url()
        .ok_or_else(|| SamlError::Configuration("idp.slo_url is not configured".into()))?;
    let security = settings.security();
    let id = generate_id();

    let plain_name_id = format!(
        "<saml:NameID xmlns:saml=\"{}\" Format=\"{}\">{}</saml:NameID>",
        NS_ASSERTION,
        escape_value(settings.name_id_format()),
        escape_value(name_id)
    );
    let name_id_xml = if security.name_id_encrypted {
        let certificate = settings.idp_certificates().first().ok_or_else(|| {
            SamlError::Configuration("NameID encryption requires an IdP certificate".into())
        })?;
        encrypt_element(&plain_name_id, certificate, "EncryptedID")
            .map_err(|e| SamlError::Configuration(format!("failed to encrypt NameID: {}", e)))?
    } else {
        plain_name_id
    };

    let session_index_xml = session_index
        .map(|index| format!("<samlp:SessionIndex>{}</samlp:SessionIndex>", escape_value(index)))
        .unwrap_or_default();

    let xml = format!(
        concat!(
            "<samlp:LogoutRequest xmlns:samlp=\"{samlp}\" xmlns:saml=\"{saml}\" ",
            "ID=\"{id}\" Version=\"{version}\" IssueInstant=\"{instant}\" ",
            "Destination=\"{destination}\">",
            "<saml:Issuer>{issuer}</saml:Issuer>",
            "{name_id}",
            "{session_index}",
            "</samlp:LogoutRequest>"
        ),
        samlp = NS_PROTOCOL,
        saml = NS_ASSERTION,
        id = id,
        version = SAML_VERSION,
        instant = format_instant(Utc::now()),
        destination = escape_value(destination),
        issuer = escape_value(settings.sp_entity_id()),
        name_id = name_id_xml,
        session_index = session_index_xml,
    );

    let message = encode(
        settings,
        settings.idp_slo_binding(),
        destination,
        MessageParam::Request,
        &xml,
        &id,
        return_to,
        security.logout_requests_signed,
    )?;
    store.put(&id, RequestKind::Logout, Utc::now() + settings.request_id_ttl()).await?;

    tracing::debug!(
        request_id = %id,
        binding = ?settings.idp_slo_binding(),
        signed = security.logout_requests_signed,
        encrypted_name_id = security.name_id_encrypted,
        "Built LogoutRequest"
    );

    Ok(OutboundRequest { id, message })
}

/// Build the reply to an IdP-initiated LogoutRequest.
pub fn build_logout_response(
    settings: &Settings,
    in_response_to: &str,
    status_code: &str,
    relay_state: Option<&str>,
) -> SamlResult<OutboundMessage> {
    let destination = settings.idp_slo_response_url().ok_or_else(|| {
        SamlError::Configuration("idp.slo_url is not configured".into())
    })?;
    let id = generate_id();

    let xml = format!(
        concat!(
            "<samlp:LogoutResponse xmlns:samlp=\"{samlp}\" xmlns:saml=\"{saml}\" ",
            "ID=\"{id}\" Version=\"{version}\" IssueInstant=\"{instant}\" ",
            "Destination=\"{destination}\" InResponseTo=\"{in_response_to}\">",
            "<saml:Issuer>{issuer}</saml:Issuer>",
            "<samlp:Status><samlp:StatusCode Value=\"{status}\"/></samlp:Status>",
            "</samlp:LogoutResponse>"
        ),
        samlp = NS_PROTOCOL,
        saml = NS_ASSERTION,
        id = id,
        version = SAML_VERSION,
        instant = format_instant(Utc::now()),
        destination = escape_value(destination),
        in_response_to = escape_value(in_response_to),
        issuer = escape_value(settings.sp_entity_id()),
        status = escape_value(status_code),
    );

    encode(
        settings,
        settings.idp_slo_binding(),
        destination,
        MessageParam::Response,
        &xml,
        &id,
        relay_state,
        settings.security().logout_responses_signed,
    )
}

#[allow(clippy::too_many_arguments)]
fn encode(
    settings: &Settings,
    binding: Binding,
    destination: &str,
    param: MessageParam,
    xml: &str,
    id: &str,
    relay_state: Option<&str>,
    sign: bool,
) -> SamlResult<OutboundMessage> {
    let signer = if sign {
        Some(settings.signing_credentials().ok_or_else(|| {
            SamlError::Configuration("signing requires sp.private_key and sp.certificate".into())
        })?)
    } else {
        None
    };

    match binding {
        Binding::HttpRedirect => Ok(OutboundMessage::Redirect {
            url: encode_redirect(destination, param, xml, relay_state, signer)?,
        }),
        Binding::HttpPost => {
            let xml = match signer {
                Some(credentials) => sign_element(xml, id, credentials)
                    .map_err(|e| SamlError::Configuration(format!("failed to sign {}: {}", id, e)))?,
                None => xml.to_string(),
            };
            Ok(OutboundMessage::Post(PostForm::new(destination, param, &xml, relay_state)))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        bindings::{InboundMessage, decode_payload},
        config::AuthnContextComparison,
        constants::status,
        crypto::dsig,
        store::{MemoryRequestIdStore, RequestKind},
        tests::fixtures,
        xml::Document,
    };

    use super::*;

    fn decode(message: &OutboundMessage) -> String {
        match message {
            OutboundMessage::Redirect { url } => {
                let query = url.split_once('?').unwrap().1;
                InboundMessage::from_query(query).unwrap().decode_xml().unwrap()
            }
            OutboundMessage::Post(form) => decode_payload(&form.value).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_authn_request_redirect() {
        let settings = fixtures::settings();
        let store = MemoryRequestIdStore::new();
        let request = build_authn_request(&settings, Some("/dashboard"), &store).await.unwrap();

        assert!(request.id.starts_with('_'));
        assert_eq!(request.id.len(), 33);
        assert!(store.exists(&request.id, RequestKind::Authn).await.unwrap());

        let url = request.message.redirect_url().unwrap();
        assert!(url.starts_with(fixtures::IDP_SSO_URL));
        assert!(url.contains("RelayState=%2Fdashboard"));
        assert!(!url.contains("Signature="));

        let xml = decode(&request.message);
        let doc = Document::parse(&xml).unwrap();
        let root = doc.root();
        assert!(root.is(NS_PROTOCOL, "AuthnRequest"));
        assert_eq!(root.attr("ID"), Some(request.id.as_str()));
        assert_eq!(root.attr("AssertionConsumerServiceURL"), Some(fixtures::ACS_URL));
        assert_eq!(root.attr("Destination"), Some(fixtures::IDP_SSO_URL));
        assert!(root.attr("ForceAuthn").is_none());
        assert_eq!(
            root.child(NS_PROTOCOL, "NameIDPolicy").and_then(|p| p.attr("Format")),
            Some(name_id_format::EMAIL_ADDRESS)
        );
        assert!(root.child(NS_PROTOCOL, "RequestedAuthnContext").is_none());
    }

    #[tokio::test]
    async fn test_authn_request_signed_redirect_verifies() {
        let settings = fixtures::settings_with(|config| {
            config.security.authn_requests_signed = true;
            config.security.force_authn = true;
            config.security.requested_authn_context =
                vec![crate::constants::AUTHN_CONTEXT_PASSWORD_PROTECTED.into()];
            config.security.authn_context_comparison = AuthnContextComparison::Minimum;
        });
        let store = MemoryRequestIdStore::new();
        let request = build_authn_request(&settings, Some("/"), &store).await.unwrap();
        let url = request.message.redirect_url().unwrap();
        let query = crate::bindings::RedirectQuery::parse(url.split_once('?').unwrap().1).unwrap();
        let sp_trust = crate::crypto::TrustAnchors {
            certificates: vec![fixtures::sp_credentials().certificate.clone()],
            ..Default::default()
        };
        query.verify_signature(&sp_trust, true, true).unwrap();

        let xml = query.decode_message().unwrap();
        let doc = Document::parse(&xml).unwrap();
        assert_eq!(doc.root().attr("ForceAuthn"), Some("true"));
        let context = doc.root().child(NS_PROTOCOL, "RequestedAuthnContext").unwrap();
        assert_eq!(context.attr("Comparison"), Some("minimum"));
    }

    #[tokio::test]
    async fn test_authn_request_signed_post() {
        let settings = fixtures::settings_with(|config| {
            config.idp.sso_binding = Binding::HttpPost;
            config.security.authn_requests_signed = true;
        });
        let store = MemoryRequestIdStore::new();
        let request = build_authn_request(&settings, None, &store).await.unwrap();
        let OutboundMessage::Post(form) = &request.message else {
            panic!("expected POST form");
        };
        assert_eq!(form.action, fixtures::IDP_SSO_URL);
        assert!(form.relay_state.is_none());
        assert!(form.to_html().contains("name=\"SAMLRequest\""));
        let xml = decode(&request.message);
        assert!(dsig::verify(&xml, &fixtures::sp_credentials().certificate));
    }

    #[tokio::test]
    async fn test_authn_request_requires_sso_url() {
        let settings = fixtures::settings_with(|config| config.idp.sso_url = None);
        let store = MemoryRequestIdStore::new();
        let err = build_authn_request(&settings, None, &store).await.unwrap_err();
        assert!(matches!(err, SamlError::Configuration(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_logout_request() {
        let settings = fixtures::settings();
        let store = MemoryRequestIdStore::new();
        let request = build_logout_request(
            &settings,
            fixtures::USER,
            Some(fixtures::SESSION_INDEX),
            Some("/bye"),
            &store,
        )
        .await
        .unwrap();
        assert!(store.exists(&request.id, RequestKind::Logout).await.unwrap());
        assert!(!store.exists(&request.id, RequestKind::Authn).await.unwrap());
        let url = request.message.redirect_url().unwrap();
        assert!(url.starts_with(fixtures::IDP_SLO_URL));

        let xml = decode(&request.message);
        let doc = Document::parse(&xml).unwrap();
        let name_id = doc.root().child(NS_ASSERTION, "NameID").unwrap();
        assert_eq!(name_id.text(), fixtures::USER);
        assert_eq!(name_id.attr("Format"), Some(name_id_format::EMAIL_ADDRESS));
        assert_eq!(
            doc.root().child(NS_PROTOCOL, "SessionIndex").map(|s| s.text()).as_deref(),
            Some(fixtures::SESSION_INDEX)
        );
    }

    #[tokio::test]
    async fn test_logout_request_encrypted_name_id() {
        let settings = fixtures::settings_with(|config| config.security.name_id_encrypted = true);
        let store = MemoryRequestIdStore::new();
        let request = build_logout_request(&settings, fixtures::USER, None, None, &store)
            .await
            .unwrap();
        let xml = decode(&request.message);
        assert!(!xml.contains(fixtures::USER));

        let doc = Document::parse(&xml).unwrap();
        let encrypted = doc.root().child(NS_ASSERTION, "EncryptedID").unwrap();
        let name_id = crate::crypto::xmlenc::decrypt_element(
            encrypted,
            &fixtures::idp_credentials().key,
            true,
        )
        .unwrap();
        assert_eq!(name_id.text(), fixtures::USER);
    }

    #[tokio::test]
    async fn test_logout_request_requires_slo_url() {
        let settings = fixtures::settings_with(|config| config.idp.slo_url = None);
        let store = MemoryRequestIdStore::new();
        let err = build_logout_request(&settings, fixtures::USER, None, None, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, SamlError::Configuration(_)));
    }

    #[test]
    fn test_logout_response_targets_response_url() {
        let settings = fixtures::settings_with(|config| {
            config.idp.slo_response_url = Some("https://idp.example.com/slo/response".into());
        });
        let message = build_logout_response(&settings, "_idp_req", status::SUCCESS, None).unwrap();
        let url = message.redirect_url().unwrap();
        assert!(url.starts_with("https://idp.example.com/slo/response?SAMLResponse="));

        let xml = decode(&message);
        let doc = Document::parse(&xml).unwrap();
        assert_eq!(doc.root().attr("InResponseTo"), Some("_idp_req"));
        assert_eq!(
            doc.root()
                .child(NS_PROTOCOL, "Status")
                .and_then(|s| s.child(NS_PROTOCOL, "StatusCode"))
                .and_then(|c| c.attr("Value")),
            Some(status::SUCCESS)
        );
    }

    #[test]
    fn test_values_are_escaped() {
        let settings = fixtures::settings();
        let message = build_logout_response(&settings, "_a\"<b>", status::SUCCESS, None).unwrap();
        let xml = decode(&message);
        assert!(Document::parse(&xml).is_ok());
        assert!(xml.contains("&quot;&lt;b&gt;"));
    }
}
