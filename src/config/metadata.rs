use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Optional content of the published SP metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataConfig {
    /// `validUntil` on the EntityDescriptor. Omitted unless set.
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,

    /// `cacheDuration` as an xs:duration, e.g. `PT604800S`.
    #[serde(default)]
    pub cache_duration: Option<String>,

    #[serde(default)]
    pub organization: Option<OrganizationConfig>,

    #[serde(default)]
    pub contacts: Vec<ContactConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrganizationConfig {
    pub name: String,
    pub display_name: String,
    pub url: String,
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_lang() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContactConfig {
    pub contact_type: ContactType,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub email_address: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContactType {
    Technical,
    Support,
    Administrative,
    Billing,
    Other,
}

impl ContactType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContactType::Technical => "technical",
            ContactType::Support => "support",
            ContactType::Administrative => "administrative",
            ContactType::Billing => "billing",
            ContactType::Other => "other",
        }
    }
}
