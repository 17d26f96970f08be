//! Assertion Consumer Service: processing of `samlp:Response` messages.

use chrono::{DateTime, Utc};

use crate::{
    assertion::{self, Assertion, InResponseTo, ValidationContext},
    bindings::decode_payload,
    constants::NS_ASSERTION,
    crypto::{dsig, xmlenc::decrypt_element},
    error::{SamlError, SamlResult, ValidationFailure, ValidationResult},
    message::{MessageKind, Status, issuer},
    settings::Settings,
    store::{RequestIdStore, RequestKind},
    xml::{Document, Element},
};

/// Process the base64 `SAMLResponse` form value posted to the ACS.
pub async fn process_response(
    settings: &Settings,
    saml_response: &str,
    store: &dyn RequestIdStore,
) -> ValidationResult<Assertion> {
    process_response_at(settings, saml_response, store, Utc::now()).await
}

/// [`process_response`] with an explicit clock.
pub async fn process_response_at(
    settings: &Settings,
    saml_response: &str,
    store: &dyn RequestIdStore,
    now: DateTime<Utc>,
) -> ValidationResult<Assertion> {
    let result = process(settings, saml_response, store, now).await;
    match &result {
        Ok(assertion) => tracing::debug!(
            assertion_id = %assertion.id(),
            issuer = %assertion.issuer(),
            session_index = assertion.session_index(),
            "Accepted SAML response"
        ),
        Err(failure) => tracing::warn!(
            errors = failure.errors().len(),
            error = %failure.last_error(),
            "Rejected SAML response"
        ),
    }
    result
}

async fn process(
    settings: &Settings,
    saml_response: &str,
    store: &dyn RequestIdStore,
    now: DateTime<Utc>,
) -> ValidationResult<Assertion> {
    let xml = decode_payload(saml_response).map_err(SamlError::from)?;
    let document = Document::parse(&xml).map_err(SamlError::from)?;
    let root = document.root();

    let kind = MessageKind::check(root)?;
    if kind != MessageKind::Response {
        return Err(SamlError::MalformedMessage(format!(
            "expected Response, received {}",
            kind.as_str()
        ))
        .into());
    }

    let status = Status::parse(root)?;
    if !status.is_success() {
        return Err(status.to_error().into());
    }

    let extracted = extract_assertion(settings, root)?;

    // A bare IdP-initiated Response may still name a request in the bearer
    // confirmation; that ID is correlated and consumed the same way.
    let claimed = root
        .attr("InResponseTo")
        .filter(|id| !id.is_empty())
        .or_else(|| {
            extracted
                .assertion
                .bearer()
                .and_then(|bearer| bearer.in_response_to.as_deref())
                .filter(|id| !id.is_empty())
        });
    let in_response_to = match claimed {
        None => InResponseTo::Absent,
        Some(id) => {
            if store.take(id, RequestKind::Authn).await.map_err(SamlError::from)? {
                InResponseTo::Known(id.to_string())
            } else {
                InResponseTo::Unknown(id.to_string())
            }
        }
    };

    let response_issuer = issuer(root);
    let ctx = ValidationContext {
        settings,
        now,
        destination: root.attr("Destination"),
        response_issuer: response_issuer.as_deref(),
        in_response_to,
        assertion_encrypted: extracted.encrypted,
    };
    match ValidationFailure::from_errors(assertion::validate(&extracted.assertion, &ctx)) {
        Some(failure) => Err(failure),
        None => Ok(extracted.assertion),
    }
}

struct ExtractedAssertion {
    assertion: Assertion,
    encrypted: bool,
}

/// Enforce the signature policy, decrypt if needed and parse the single
/// assertion of `root`.
fn extract_assertion(settings: &Settings, root: &Element) -> SamlResult<ExtractedAssertion> {
    let security = settings.security();
    let reject_deprecated = security.reject_deprecated_algorithms;

    let plain: Vec<&Element> = root.children_named(NS_ASSERTION, "Assertion").collect();
    let encrypted: Vec<&Element> = root.children_named(NS_ASSERTION, "EncryptedAssertion").collect();
    if plain.len() + encrypted.len() != 1 {
        return Err(SamlError::MalformedMessage(format!(
            "Response must contain exactly one assertion, found {}",
            plain.len() + encrypted.len()
        )));
    }
    if root
        .descendants()
        .filter(|el| el.is(NS_ASSERTION, "Assertion"))
        .count()
        > plain.len()
    {
        return Err(SamlError::MalformedMessage("nested assertion found".into()));
    }

    let response_signed = dsig::is_signed(root);
    if response_signed {
        dsig::verify_element(root, root, settings.trust(), reject_deprecated)?;
    } else if security.want_messages_signed {
        return Err(SamlError::SignatureVerification("Response is not signed".into()));
    }

    let decrypted;
    let (element, document_root, was_encrypted) = match (plain.first(), encrypted.first()) {
        (Some(assertion), _) => (*assertion, root, false),
        (None, Some(wrapper)) => {
            let key = settings.sp_private_key().ok_or_else(|| {
                SamlError::Decryption(
                    "EncryptedAssertion received but no SP private key is configured".into(),
                )
            })?;
            decrypted = decrypt_element(wrapper, key, reject_deprecated)?;
            if !decrypted.is(NS_ASSERTION, "Assertion") {
                return Err(SamlError::MalformedMessage(format!(
                    "EncryptedAssertion contains {} instead of Assertion",
                    decrypted.local_name()
                )));
            }
            (&decrypted, &decrypted, true)
        }
        (None, None) => {
            return Err(SamlError::MalformedMessage("Response has no assertion".into()));
        }
    };

    let assertion_signed = dsig::is_signed(element);
    if assertion_signed {
        dsig::verify_element(document_root, element, settings.trust(), reject_deprecated)?;
    } else if security.want_assertions_signed {
        return Err(SamlError::SignatureVerification("Assertion is not signed".into()));
    }
    if !response_signed && !assertion_signed {
        return Err(SamlError::SignatureVerification(
            "neither the Response nor the Assertion is signed".into(),
        ));
    }

    let assertion = Assertion::from_element(element, settings.sp_private_key(), reject_deprecated)?;
    Ok(ExtractedAssertion {
        assertion,
        encrypted: was_encrypted,
    })
}

#[cfg(test)]
mod tests {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use chrono::Duration;

    use super::*;
    use crate::{
        constants::NS_PROTOCOL,
        crypto::SignatureAlgorithm,
        error::ValidationReason,
        store::MemoryRequestIdStore,
        tests::fixtures::{self, ResponseFixture},
    };

    async fn run(settings: &Settings, fixture: &ResponseFixture) -> ValidationResult<Assertion> {
        let store = MemoryRequestIdStore::new();
        process_response(settings, &fixture.encoded(), &store).await
    }

    #[tokio::test]
    async fn test_signed_assertion_accepted() {
        let settings = fixtures::settings();
        let assertion = run(&settings, &ResponseFixture::new()).await.unwrap();
        assert_eq!(assertion.name_id().value, fixtures::USER);
        assert_eq!(assertion.issuer(), fixtures::IDP_ENTITY_ID);
    }

    #[tokio::test]
    async fn test_signed_response_only_accepted() {
        let settings = fixtures::settings();
        let mut fixture = ResponseFixture::new();
        fixture.sign_assertion = false;
        fixture.sign_response = true;
        assert!(run(&settings, &fixture).await.is_ok());
    }

    #[tokio::test]
    async fn test_response_signature_does_not_satisfy_assertion_requirement() {
        let settings = fixtures::settings_with(|config| config.security.want_assertions_signed = true);
        let mut fixture = ResponseFixture::new();
        fixture.sign_assertion = false;
        fixture.sign_response = true;
        let failure = run(&settings, &fixture).await.unwrap_err();
        assert!(failure.is_signature_error());
        assert_eq!(failure.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_want_messages_signed() {
        let settings = fixtures::settings_with(|config| config.security.want_messages_signed = true);
        let failure = run(&settings, &ResponseFixture::new()).await.unwrap_err();
        assert!(failure.is_signature_error());
    }

    #[tokio::test]
    async fn test_unsigned_rejected() {
        let settings = fixtures::settings();
        let mut fixture = ResponseFixture::new();
        fixture.sign_assertion = false;
        let failure = run(&settings, &fixture).await.unwrap_err();
        assert!(failure.is_signature_error());
    }

    #[tokio::test]
    async fn test_encrypted_assertion_decrypted() {
        let settings = fixtures::settings_with(|config| config.security.want_assertions_encrypted = true);
        let mut fixture = ResponseFixture::new();
        fixture.encrypt_assertion = true;
        let assertion = run(&settings, &fixture).await.unwrap();
        assert_eq!(assertion.session_index(), Some(fixtures::SESSION_INDEX));
    }

    #[tokio::test]
    async fn test_encrypted_assertion_without_key() {
        let settings = fixtures::settings_with(|config| {
            config.sp.private_key = None;
            config.sp.certificate = None;
        });
        let mut fixture = ResponseFixture::new();
        fixture.encrypt_assertion = true;
        let failure = run(&settings, &fixture).await.unwrap_err();
        assert!(matches!(failure.last_error(), SamlError::Decryption(_)));
    }

    #[tokio::test]
    async fn test_expired_reports_only_expiry() {
        let settings = fixtures::settings();
        let mut fixture = ResponseFixture::new();
        fixture.assertion.not_before = Utc::now() - Duration::hours(2);
        fixture.assertion.not_on_or_after = Utc::now() - Duration::hours(1);
        let failure = run(&settings, &fixture).await.unwrap_err();
        assert_eq!(failure.reasons(), vec![ValidationReason::Expired]);
        assert!(!failure.is_signature_error());
    }

    #[tokio::test]
    async fn test_status_failure_stops_processing() {
        let settings = fixtures::settings();
        let mut fixture = ResponseFixture::new();
        fixture.status = crate::constants::status::REQUESTER.into();
        let failure = run(&settings, &fixture).await.unwrap_err();
        assert_eq!(failure.reasons(), vec![ValidationReason::StatusNotSuccess]);
    }

    #[tokio::test]
    async fn test_destination_mismatch() {
        let settings = fixtures::settings();
        let mut fixture = ResponseFixture::new();
        fixture.destination = Some("https://attacker.example.com/acs".into());
        let failure = run(&settings, &fixture).await.unwrap_err();
        assert_eq!(failure.reasons(), vec![ValidationReason::DestinationMismatch]);
    }

    #[tokio::test]
    async fn test_wrong_root_element() {
        let settings = fixtures::settings();
        let xml = format!(
            r#"<samlp:LogoutResponse xmlns:samlp="{NS_PROTOCOL}" ID="_1" Version="2.0"/>"#
        );
        let store = MemoryRequestIdStore::new();
        let failure = process_response(&settings, &STANDARD.encode(xml), &store)
            .await
            .unwrap_err();
        assert!(matches!(failure.last_error(), SamlError::MalformedMessage(msg) if msg.contains("LogoutResponse")));
    }

    #[tokio::test]
    async fn test_garbage_input() {
        let settings = fixtures::settings();
        let store = MemoryRequestIdStore::new();
        let failure = process_response(&settings, "%%%not base64", &store).await.unwrap_err();
        assert!(matches!(failure.last_error(), SamlError::MalformedMessage(_)));

        let failure = process_response(&settings, &STANDARD.encode("<unclosed"), &store)
            .await
            .unwrap_err();
        assert!(matches!(failure.last_error(), SamlError::MalformedMessage(_)));
    }

    #[tokio::test]
    async fn test_two_assertions_rejected() {
        let settings = fixtures::settings();
        let mut fixture = ResponseFixture::new();
        fixture.duplicate_assertion = true;
        let failure = run(&settings, &fixture).await.unwrap_err();
        assert!(matches!(failure.last_error(), SamlError::MalformedMessage(_)));
    }

    #[tokio::test]
    async fn test_deprecated_signature_algorithm() {
        let mut fixture = ResponseFixture::new();
        fixture.signature_algorithm = SignatureAlgorithm::RsaSha1;
        fixture.digest_algorithm = crate::crypto::DigestAlgorithm::Sha1;

        let strict = fixtures::settings();
        assert!(run(&strict, &fixture).await.unwrap_err().is_signature_error());

        let lenient =
            fixtures::settings_with(|config| config.security.reject_deprecated_algorithms = false);
        assert!(run(&lenient, &fixture).await.is_ok());
    }

    #[tokio::test]
    async fn test_bearer_only_in_response_to_is_correlated() {
        let settings = fixtures::settings();
        let store = MemoryRequestIdStore::new();

        let mut fixture = ResponseFixture::new();
        fixture.in_response_to = None;
        fixture.assertion.in_response_to = Some("_never_issued".into());
        let failure = process_response(&settings, &fixture.encoded(), &store)
            .await
            .unwrap_err();
        assert_eq!(failure.reasons(), vec![ValidationReason::UnsolicitedResponse]);

        store
            .put("_issued", RequestKind::Authn, Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        fixture.assertion.in_response_to = Some("_issued".into());
        let encoded = fixture.encoded();
        assert!(process_response(&settings, &encoded, &store).await.is_ok());
        assert!(store.is_empty().await);

        let replay = process_response(&settings, &encoded, &store).await.unwrap_err();
        assert_eq!(replay.reasons(), vec![ValidationReason::UnsolicitedResponse]);
    }

    #[tokio::test]
    async fn test_logout_request_id_does_not_answer_login() {
        let settings = fixtures::settings();
        let store = MemoryRequestIdStore::new();
        store
            .put("_logout", RequestKind::Logout, Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        let mut fixture = ResponseFixture::new();
        fixture.in_response_to = Some("_logout".into());
        let failure = process_response(&settings, &fixture.encoded(), &store)
            .await
            .unwrap_err();
        assert_eq!(failure.reasons(), vec![ValidationReason::UnsolicitedResponse]);
        assert!(store.exists("_logout", RequestKind::Logout).await.unwrap());
    }

    #[tokio::test]
    async fn test_fingerprint_trust() {
        let fp = crate::crypto::fingerprint(&fixtures::idp_credentials().certificate, Default::default())
            .unwrap();
        let settings = fixtures::settings_with(|config| {
            config.idp.certificates.clear();
            config.idp.certificate_fingerprint = Some(fp.clone());
        });
        assert!(run(&settings, &ResponseFixture::new()).await.is_ok());

        let wrong = fixtures::settings_with(|config| {
            config.idp.certificates.clear();
            config.idp.certificate_fingerprint = Some("00".repeat(32));
        });
        assert!(run(&wrong, &ResponseFixture::new()).await.unwrap_err().is_signature_error());
    }
}
