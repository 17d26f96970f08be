//! SAML 2.0 Service Provider protocol engine.
//!
//! [`ServiceProvider`] is the entry point for web adapters: it builds
//! AuthnRequests and LogoutRequests, validates Responses posted to the ACS,
//! handles single logout at the SLS and publishes SP metadata. The lower-level
//! modules are public for callers that manage their own request-ID store or
//! need the XML signature primitives directly.

pub mod assertion;
pub mod bindings;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod logout;
pub mod message;
pub mod metadata;
#[cfg(feature = "cli")]
pub mod observability;
pub mod request;
pub mod response;
pub mod service_provider;
pub mod settings;
pub mod store;
pub mod xml;

#[cfg(test)]
mod tests;

pub use assertion::{Assertion, NameId, SamlAttribute};
pub use bindings::{Binding, InboundMessage, OutboundMessage, PostForm};
pub use config::SpConfig;
pub use error::{SamlError, SamlResult, ValidationFailure, ValidationReason, ValidationResult};
pub use logout::{LogoutNotice, SessionTeardown, SloOutcome};
pub use request::OutboundRequest;
pub use service_provider::ServiceProvider;
pub use settings::Settings;
pub use store::{MemoryRequestIdStore, RequestIdStore, RequestKind, SharedRequestIdStore};
