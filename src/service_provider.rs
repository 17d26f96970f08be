//! The handful of calls a web framework adapter needs: login, logout, ACS,
//! SLS and metadata.

use std::sync::Arc;

use crate::{
    assertion::Assertion,
    bindings::InboundMessage,
    error::{SamlResult, ValidationResult},
    logout::{SessionTeardown, SloOutcome, process_slo},
    metadata,
    request::{OutboundRequest, build_authn_request, build_logout_request},
    response::process_response,
    settings::Settings,
    store::SharedRequestIdStore,
};

/// A configured service provider with its request-ID store.
#[derive(Clone)]
pub struct ServiceProvider {
    settings: Arc<Settings>,
    store: SharedRequestIdStore,
}

impl ServiceProvider {
    pub fn new(settings: Arc<Settings>, store: SharedRequestIdStore) -> Self {
        Self { settings, store }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start SP-initiated SSO. `return_to` comes back as RelayState.
    pub async fn login(&self, return_to: Option<&str>) -> SamlResult<OutboundRequest> {
        self.store.cleanup().await?;
        build_authn_request(&self.settings, return_to, self.store.as_ref()).await
    }

    /// Start SP-initiated logout for the session identified by `name_id` and
    /// `session_index` (both from the login assertion).
    pub async fn logout(
        &self,
        return_to: Option<&str>,
        name_id: &str,
        session_index: Option<&str>,
    ) -> SamlResult<OutboundRequest> {
        self.store.cleanup().await?;
        build_logout_request(
            &self.settings,
            name_id,
            session_index,
            return_to,
            self.store.as_ref(),
        )
        .await
    }

    /// Consume the `SAMLResponse` form field posted to the ACS URL.
    pub async fn acs(&self, saml_response: &str) -> ValidationResult<Assertion> {
        process_response(&self.settings, saml_response, self.store.as_ref()).await
    }

    /// Handle a message delivered to the SLS URL.
    pub async fn sls<H>(
        &self,
        message: &InboundMessage,
        idp: &str,
        retrieve_params_from_server: bool,
        hook: &H,
    ) -> ValidationResult<SloOutcome>
    where
        H: SessionTeardown + ?Sized,
    {
        process_slo(
            &self.settings,
            message,
            retrieve_params_from_server,
            idp,
            self.store.as_ref(),
            hook,
        )
        .await
    }

    /// Published SP metadata, see [`metadata::CONTENT_TYPE`].
    pub fn metadata(&self) -> SamlResult<String> {
        metadata::generate_checked(&self.settings)
    }
}

impl std::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("sp_entity_id", &self.settings.sp_entity_id())
            .field("idp_entity_id", &self.settings.idp_entity_id())
            .finish_non_exhaustive()
    }
}
