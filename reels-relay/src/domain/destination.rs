//! Destination entity: one publishing target with its own credential.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote id assigned to destinations whose identity could not be resolved.
pub const PAGE_ID_PLACEHOLDER_PREFIX: &str = "UNKNOWN_PAGE_";

/// Credential prefix left in unedited configuration templates.
pub const TOKEN_PLACEHOLDER_PREFIX: &str = "YOUR_PAGE_ACCESS_TOKEN_";

/// Verification status reported for unverified accounts.
pub const NOT_VERIFIED: &str = "not_verified";

/// Account metadata returned by the identity provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub followers_count: Option<u64>,
    #[serde(default)]
    pub verification_status: Option<String>,
}

/// A publishing target.
#[derive(Clone, Serialize, Deserialize)]
pub struct Destination {
    /// Sequential registry id.
    pub id: u32,
    /// Remote account identifier (page id).
    pub remote_id: String,
    /// Bearer credential. Never serialized.
    #[serde(skip_serializing, default)]
    pub access_token: String,
    /// Credential group (application id) the token belongs to.
    pub credential_group: String,
    pub name: String,
    pub category: Option<String>,
    pub enabled: bool,
    pub last_error: Option<String>,
    pub followers: Option<u64>,
    pub verification: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Destination {
    pub fn new(
        id: u32,
        remote_id: impl Into<String>,
        access_token: impl Into<String>,
        credential_group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            remote_id: remote_id.into(),
            access_token: access_token.into(),
            credential_group: credential_group.into(),
            name: name.into(),
            category: None,
            enabled: true,
            last_error: None,
            followers: None,
            verification: None,
            resolved_at: None,
        }
    }

    /// Build an enabled destination from a resolved identity.
    pub fn resolved(
        id: u32,
        access_token: impl Into<String>,
        credential_group: impl Into<String>,
        identity: AccountIdentity,
    ) -> Self {
        Self {
            category: Some(identity.category.unwrap_or_else(|| "Unknown".to_string())),
            followers: Some(identity.followers_count.unwrap_or(0)),
            verification: Some(
                identity
                    .verification_status
                    .unwrap_or_else(|| NOT_VERIFIED.to_string()),
            ),
            resolved_at: Some(Utc::now()),
            ..Self::new(id, identity.id, access_token, credential_group, identity.name)
        }
    }

    /// Build a disabled stand-in for a credential that failed to resolve.
    pub fn placeholder(
        id: u32,
        access_token: impl Into<String>,
        credential_group: impl Into<String>,
        remote_id: Option<String>,
        name: Option<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            enabled: false,
            last_error: Some(error.into()),
            resolved_at: Some(Utc::now()),
            ..Self::new(
                id,
                remote_id.unwrap_or_else(|| format!("{PAGE_ID_PLACEHOLDER_PREFIX}{id}")),
                access_token,
                credential_group,
                name.unwrap_or_else(|| format!("Page {id} (API Error)")),
            )
        }
    }

    pub fn has_valid_remote_id(&self) -> bool {
        !self.remote_id.is_empty() && !self.remote_id.starts_with(PAGE_ID_PLACEHOLDER_PREFIX)
    }

    pub fn has_valid_token(&self) -> bool {
        !self.access_token.is_empty() && !self.access_token.starts_with(TOKEN_PLACEHOLDER_PREFIX)
    }

    pub fn has_valid_name(&self) -> bool {
        !self.name.is_empty() && !self.name.contains("API Error")
    }

    /// Enabled and carrying real identifiers and credentials.
    pub fn is_usable(&self) -> bool {
        self.enabled && self.has_valid_remote_id() && self.has_valid_token()
    }

    pub fn is_unverified(&self) -> bool {
        self.verification.as_deref() == Some(NOT_VERIFIED)
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("remote_id", &self.remote_id)
            .field("access_token", &"<redacted>")
            .field("credential_group", &self.credential_group)
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("last_error", &self.last_error)
            .finish()
    }
}

/// Fields for an explicitly added destination.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDestination {
    pub remote_id: String,
    #[serde(default)]
    pub access_token: String,
    pub credential_group: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Defaults to enabled when omitted.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub followers: Option<u64>,
    #[serde(default)]
    pub verification: Option<String>,
}

impl NewDestination {
    pub fn into_destination(self, id: u32) -> Destination {
        Destination {
            category: self.category,
            enabled: self.enabled.unwrap_or(true),
            followers: self.followers,
            verification: self.verification,
            ..Destination::new(
                id,
                self.remote_id,
                self.access_token,
                self.credential_group,
                self.name,
            )
        }
    }
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationPatch {
    pub remote_id: Option<String>,
    pub access_token: Option<String>,
    pub credential_group: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
    pub enabled: Option<bool>,
    /// `Some(None)` clears the recorded error.
    pub last_error: Option<Option<String>>,
    pub followers: Option<u64>,
    pub verification: Option<String>,
}

impl DestinationPatch {
    pub fn apply(self, destination: &mut Destination) {
        if let Some(remote_id) = self.remote_id {
            destination.remote_id = remote_id;
        }
        if let Some(token) = self.access_token {
            destination.access_token = token;
        }
        if let Some(group) = self.credential_group {
            destination.credential_group = group;
        }
        if let Some(name) = self.name {
            destination.name = name;
        }
        if let Some(category) = self.category {
            destination.category = Some(category);
        }
        if let Some(enabled) = self.enabled {
            destination.enabled = enabled;
        }
        if let Some(last_error) = self.last_error {
            destination.last_error = last_error;
        }
        if let Some(followers) = self.followers {
            destination.followers = Some(followers);
        }
        if let Some(verification) = self.verification {
            destination.verification = Some(verification);
        }
    }
}
