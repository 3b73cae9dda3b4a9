//! Identity provider: resolves account metadata from a bare credential.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::domain::AccountIdentity;
use crate::utils::graph::{GraphConfig, GraphError, decode_json};

/// Fields requested when resolving a page token.
const IDENTITY_FIELDS: &str = "id,name,category,followers_count,verification_status";

/// Fields requested by connection checks.
const CONNECTION_FIELDS: &str = "id,name";

const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity lookup failed.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The provider answered with an error.
    #[error("Facebook API Error: {status} - {message}")]
    Api {
        status: u16,
        message: String,
        code: Option<i64>,
    },

    /// No usable response was received.
    #[error("Facebook API request failed: {0}")]
    Request(GraphError),
}

impl ResolutionError {
    /// Numeric provider error code, if any.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Api { code, .. } => *code,
            Self::Request(_) => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Request(e) => e.is_transient(),
        }
    }
}

impl From<GraphError> for ResolutionError {
    fn from(error: GraphError) -> Self {
        match error {
            GraphError::Api {
                status,
                message,
                code,
            } => Self::Api {
                status,
                message,
                code,
            },
            other => Self::Request(other),
        }
    }
}

/// Account metadata lookups.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolve the account a credential belongs to.
    async fn resolve(&self, access_token: &str) -> Result<AccountIdentity, ResolutionError>;

    /// Fetch id and name of a known account, verifying the credential can reach it.
    async fn lookup(
        &self,
        remote_id: &str,
        access_token: &str,
    ) -> Result<AccountIdentity, ResolutionError>;
}

/// Graph API backed identity provider.
pub struct GraphIdentityProvider {
    client: Client,
    config: GraphConfig,
}

impl GraphIdentityProvider {
    pub fn new(client: Client, config: GraphConfig) -> Self {
        Self { client, config }
    }

    async fn fetch(
        &self,
        path: &str,
        fields: &str,
        access_token: &str,
    ) -> Result<AccountIdentity, ResolutionError> {
        let response = self
            .client
            .get(self.config.endpoint(path))
            .query(&[("access_token", access_token), ("fields", fields)])
            .timeout(IDENTITY_TIMEOUT)
            .send()
            .await
            .map_err(GraphError::from)?;

        let identity: AccountIdentity = decode_json(response).await?;
        debug!(id = %identity.id, name = %identity.name, "Resolved account identity");
        Ok(identity)
    }
}

#[async_trait]
impl IdentityProvider for GraphIdentityProvider {
    #[instrument(skip(self, access_token))]
    async fn resolve(&self, access_token: &str) -> Result<AccountIdentity, ResolutionError> {
        self.fetch("me", IDENTITY_FIELDS, access_token).await
    }

    #[instrument(skip(self, access_token))]
    async fn lookup(
        &self,
        remote_id: &str,
        access_token: &str,
    ) -> Result<AccountIdentity, ResolutionError> {
        self.fetch(remote_id, CONNECTION_FIELDS, access_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_from_graph_error() {
        let err: ResolutionError = GraphError::from_body(
            400,
            r#"{"error":{"message":"Invalid OAuth access token.","code":190}}"#,
        )
        .into();
        assert_eq!(err.code(), Some(190));
        assert_eq!(
            err.to_string(),
            "Facebook API Error: 400 - Invalid OAuth access token."
        );
        assert!(!err.is_transient());

        let err: ResolutionError = GraphError::Timeout.into();
        assert!(matches!(err, ResolutionError::Request(GraphError::Timeout)));
        assert!(err.is_transient());
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_identity_deserializes_partial_fields() {
        let identity: AccountIdentity =
            serde_json::from_str(r#"{"id":"123","name":"My Page"}"#).unwrap();
        assert_eq!(identity.id, "123");
        assert!(identity.followers_count.is_none());
    }
}
