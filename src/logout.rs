//! Single Logout Service: IdP-initiated `LogoutRequest`s and the IdP's
//! `LogoutResponse` to an SP-initiated logout.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    assertion::NameId,
    bindings::{InboundMessage, OutboundMessage},
    constants::{NS_PROTOCOL, status},
    crypto::dsig,
    error::{SamlError, SamlResult, ValidationFailure, ValidationReason, ValidationResult},
    message::{MessageKind, Status, instant_attr, issuer},
    request::build_logout_response,
    settings::Settings,
    store::{RequestIdStore, RequestKind},
    xml::{Document, Element},
};

/// Error returned by a [`SessionTeardown`] hook.
pub type TeardownError = Box<dyn std::error::Error + Send + Sync>;

/// The session the IdP asked this SP to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutNotice {
    /// Caller-chosen name of the IdP the request came from.
    pub idp: String,
    pub name_id: String,
    pub name_id_format: Option<String>,
    /// May be empty, meaning every session of `name_id`.
    pub session_indexes: Vec<String>,
}

/// Ends the local session(s) named by an IdP-initiated logout.
///
/// Called at most once per logout request, after the request has been fully
/// validated and before the reply to the IdP is built. An error aborts the
/// logout and no reply is produced.
#[async_trait]
pub trait SessionTeardown: Send + Sync {
    async fn teardown(&self, notice: &LogoutNotice) -> Result<(), TeardownError>;
}

#[async_trait]
impl<F> SessionTeardown for F
where
    F: Fn(&LogoutNotice) -> Result<(), TeardownError> + Send + Sync,
{
    async fn teardown(&self, notice: &LogoutNotice) -> Result<(), TeardownError> {
        self(notice)
    }
}

/// Result of a successfully processed SLO message.
#[derive(Debug, Clone)]
pub enum SloOutcome {
    /// IdP-initiated logout: the session was torn down and `response` must be
    /// sent back to the IdP.
    LogoutRequested {
        notice: LogoutNotice,
        response: OutboundMessage,
    },
    /// The IdP acknowledged a logout this SP started.
    LogoutCompleted {
        in_response_to: Option<String>,
        relay_state: Option<String>,
    },
}

/// Process a message received at the Single Logout Service.
///
/// With `retrieve_params_from_server`, a redirect signature is checked over
/// the query values exactly as received rather than re-encoded.
pub async fn process_slo<H>(
    settings: &Settings,
    message: &InboundMessage,
    retrieve_params_from_server: bool,
    idp: &str,
    store: &dyn RequestIdStore,
    hook: &H,
) -> ValidationResult<SloOutcome>
where
    H: SessionTeardown + ?Sized,
{
    process_slo_at(settings, message, retrieve_params_from_server, idp, store, hook, Utc::now()).await
}

/// [`process_slo`] with an explicit clock.
#[allow(clippy::too_many_arguments)]
pub async fn process_slo_at<H>(
    settings: &Settings,
    message: &InboundMessage,
    retrieve_params_from_server: bool,
    idp: &str,
    store: &dyn RequestIdStore,
    hook: &H,
    now: DateTime<Utc>,
) -> ValidationResult<SloOutcome>
where
    H: SessionTeardown + ?Sized,
{
    let xml = message.decode_xml().map_err(SamlError::from)?;
    let document = Document::parse(&xml).map_err(SamlError::from)?;
    let root = document.root();

    let result = match MessageKind::check(root)? {
        MessageKind::LogoutRequest => {
            logout_request(settings, message, retrieve_params_from_server, idp, root, hook, now)
                .await
        }
        MessageKind::LogoutResponse => {
            logout_response(settings, message, retrieve_params_from_server, root, store).await
        }
        other => Err(SamlError::MalformedMessage(format!(
            "expected LogoutRequest or LogoutResponse, received {}",
            other.as_str()
        ))
        .into()),
    };

    if let Err(failure) = &result {
        tracing::warn!(
            errors = failure.errors().len(),
            error = %failure.last_error(),
            "Rejected SAML logout message"
        );
    }
    result
}

async fn logout_request<H>(
    settings: &Settings,
    message: &InboundMessage,
    retrieve_params_from_server: bool,
    idp: &str,
    root: &Element,
    hook: &H,
    now: DateTime<Utc>,
) -> ValidationResult<SloOutcome>
where
    H: SessionTeardown + ?Sized,
{
    verify_signature(settings, message, retrieve_params_from_server, root)?;

    let security = settings.security();
    let (name_id, encrypted) = NameId::from_parent(
        root,
        settings.sp_private_key(),
        security.reject_deprecated_algorithms,
    )?;

    let mut errors = Vec::new();
    check_issuer(settings, root, &mut errors);
    check_destination(settings, root, &mut errors);
    if let Some(not_on_or_after) = instant_attr(root, "NotOnOrAfter")?
        && now - settings.clock_skew() >= not_on_or_after
    {
        errors.push(SamlError::validation(
            ValidationReason::Expired,
            format!("LogoutRequest NotOnOrAfter {} has passed", not_on_or_after),
        ));
    }
    if security.want_name_id_encrypted && !encrypted {
        errors.push(SamlError::validation(
            ValidationReason::EncryptionRequired,
            "NameID is not encrypted",
        ));
    }
    if let Some(failure) = ValidationFailure::from_errors(errors) {
        return Err(failure);
    }

    let notice = LogoutNotice {
        idp: idp.to_string(),
        name_id: name_id.value,
        name_id_format: name_id.format,
        session_indexes: root
            .children_named(NS_PROTOCOL, "SessionIndex")
            .map(Element::trimmed_text)
            .collect(),
    };

    hook.teardown(&notice)
        .await
        .map_err(|e| SamlError::SessionTeardown(e.to_string()))?;

    let request_id = root.attr("ID").unwrap_or_default();
    let response = build_logout_response(settings, request_id, status::SUCCESS, message.relay_state())?;

    tracing::debug!(
        idp = %notice.idp,
        request_id = %request_id,
        sessions = notice.session_indexes.len(),
        "Processed IdP-initiated logout"
    );

    Ok(SloOutcome::LogoutRequested { notice, response })
}

async fn logout_response(
    settings: &Settings,
    message: &InboundMessage,
    retrieve_params_from_server: bool,
    root: &Element,
    store: &dyn RequestIdStore,
) -> ValidationResult<SloOutcome> {
    verify_signature(settings, message, retrieve_params_from_server, root)?;
    let status = Status::parse(root)?;

    let mut errors = Vec::new();
    check_issuer(settings, root, &mut errors);
    check_destination(settings, root, &mut errors);

    let in_response_to = root
        .attr("InResponseTo")
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    if let Some(id) = &in_response_to {
        if !store.take(id, RequestKind::Logout).await.map_err(SamlError::from)?
            && !settings.security().allow_unsolicited_responses
        {
            errors.push(SamlError::validation(
                ValidationReason::UnsolicitedResponse,
                format!("InResponseTo {} does not match an outstanding request", id),
            ));
        }
    }
    if !status.is_success() {
        errors.push(status.to_error());
    }
    if let Some(failure) = ValidationFailure::from_errors(errors) {
        return Err(failure);
    }

    tracing::debug!(in_response_to = in_response_to.as_deref(), "Logout completed at the IdP");

    Ok(SloOutcome::LogoutCompleted {
        in_response_to,
        relay_state: message.relay_state().map(str::to_string),
    })
}

/// Check the binding's signature: the detached query signature for
/// HTTP-Redirect, the enveloped signature for HTTP-POST.
fn verify_signature(
    settings: &Settings,
    message: &InboundMessage,
    retrieve_params_from_server: bool,
    root: &Element,
) -> SamlResult<()> {
    let security = settings.security();
    let reject_deprecated = security.reject_deprecated_algorithms;
    let signed = match message {
        InboundMessage::Redirect(query) if query.is_signed() => {
            query.verify_signature(settings.trust(), reject_deprecated, retrieve_params_from_server)?;
            true
        }
        InboundMessage::Post { .. } if dsig::is_signed(root) => {
            dsig::verify_element(root, root, settings.trust(), reject_deprecated)?;
            true
        }
        _ => false,
    };
    if !signed && security.want_messages_signed {
        return Err(SamlError::SignatureVerification(format!(
            "{} is not signed",
            root.local_name()
        )));
    }
    Ok(())
}

fn check_issuer(settings: &Settings, root: &Element, errors: &mut Vec<SamlError>) {
    if let Some(issuer) = issuer(root)
        && issuer != settings.idp_entity_id()
    {
        errors.push(SamlError::validation(
            ValidationReason::IssuerMismatch,
            format!("issuer {} is not {}", issuer, settings.idp_entity_id()),
        ));
    }
}

fn check_destination(settings: &Settings, root: &Element, errors: &mut Vec<SamlError>) {
    if !settings.security().check_destination {
        return;
    }
    if let Some(destination) = root.attr("Destination")
        && settings.sls_url() != Some(destination)
    {
        errors.push(SamlError::validation(
            ValidationReason::DestinationMismatch,
            format!(
                "Destination {} is not {}",
                destination,
                settings.sls_url().unwrap_or("(no SLS URL configured)")
            ),
        ));
    }
}
