//! Destination registry.
//!
//! Holds the in-memory list of publishing targets. Each configured credential
//! is resolved once against the identity provider; a failed resolution yields
//! a disabled placeholder so that one bad credential never blocks the rest.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use super::identity::IdentityProvider;
use crate::domain::{Destination, DestinationPatch, NewDestination};
use crate::{Error, Result};

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Fixed pause between identity lookups.
    #[serde(default = "default_resolve_delay_ms")]
    pub resolve_delay_ms: u64,
}

fn default_resolve_delay_ms() -> u64 {
    100
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            resolve_delay_ms: default_resolve_delay_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn resolve_delay(&self) -> Duration {
        Duration::from_millis(self.resolve_delay_ms)
    }
}

/// One configured credential, before resolution.
#[derive(Clone, Serialize, Deserialize)]
pub struct DestinationCredential {
    /// 1-based position in the configuration; becomes the destination id.
    pub index: u32,
    #[serde(skip_serializing, default)]
    pub access_token: String,
    pub credential_group: String,
    /// Remote id used when resolution fails.
    #[serde(default)]
    pub fallback_remote_id: Option<String>,
    /// Display name used when resolution fails.
    #[serde(default)]
    pub fallback_name: Option<String>,
}

impl std::fmt::Debug for DestinationCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationCredential")
            .field("index", &self.index)
            .field("access_token", &"<redacted>")
            .field("credential_group", &self.credential_group)
            .field("fallback_remote_id", &self.fallback_remote_id)
            .field("fallback_name", &self.fallback_name)
            .finish()
    }
}

/// Source of the destination snapshot taken when a job is submitted.
#[async_trait]
pub trait DestinationSource: Send + Sync {
    async fn enabled_destinations(&self) -> Result<Vec<Destination>>;
}

/// Structural check over enabled destinations.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub enabled_count: usize,
    pub disabled_count: usize,
    pub total_count: usize,
}

/// Member of a credential group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupMember {
    pub id: u32,
    pub name: String,
    pub remote_id: String,
    pub enabled: bool,
}

/// Usage of one credential group.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupUsage {
    pub total: usize,
    pub names: Vec<String>,
    pub destinations: Vec<GroupMember>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryReport {
    pub total_count: usize,
    pub enabled_count: usize,
    pub credential_groups: usize,
    pub groups: BTreeMap<String, GroupUsage>,
    pub validation: RegistryValidation,
}

/// In-memory registry of publishing destinations.
pub struct DestinationRegistry {
    provider: Arc<dyn IdentityProvider>,
    config: RegistryConfig,
    credentials: RwLock<Vec<DestinationCredential>>,
    destinations: RwLock<Vec<Destination>>,
}

impl DestinationRegistry {
    pub fn new(provider: Arc<dyn IdentityProvider>, config: RegistryConfig) -> Self {
        Self {
            provider,
            config,
            credentials: RwLock::new(Vec::new()),
            destinations: RwLock::new(Vec::new()),
        }
    }

    /// Resolve every credential and replace the destination list.
    ///
    /// Returns the number of destinations that are usable afterwards.
    pub async fn initialize(&self, credentials: Vec<DestinationCredential>) -> usize {
        info!(count = credentials.len(), "Initializing destinations");
        *self.credentials.write() = credentials.clone();

        let mut resolved = Vec::with_capacity(credentials.len());
        for (i, credential) in credentials.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.resolve_delay()).await;
            }
            resolved.push(self.resolve(credential).await);
        }

        *self.destinations.write() = resolved;
        let usable = self.enabled_count();
        info!(usable, total = self.total_count(), "Destinations initialized");
        usable
    }

    /// Re-resolve the credentials passed to the last [`initialize`](Self::initialize).
    pub async fn refresh(&self) -> usize {
        let credentials = self.credentials.read().clone();
        self.initialize(credentials).await
    }

    /// Resolve one credential. Failures produce a disabled placeholder.
    #[instrument(skip(self, credential), fields(index = credential.index))]
    pub async fn resolve(&self, credential: &DestinationCredential) -> Destination {
        match self.provider.resolve(&credential.access_token).await {
            Ok(identity) => {
                info!(
                    remote_id = %identity.id,
                    name = %identity.name,
                    "Destination resolved"
                );
                Destination::resolved(
                    credential.index,
                    credential.access_token.clone(),
                    credential.credential_group.clone(),
                    identity,
                )
            }
            Err(e) => {
                error!(error = %e, "Failed to resolve destination");
                Destination::placeholder(
                    credential.index,
                    credential.access_token.clone(),
                    credential.credential_group.clone(),
                    credential.fallback_remote_id.clone(),
                    credential.fallback_name.clone(),
                    e.to_string(),
                )
            }
        }
    }

    /// Destinations that are enabled and pass the integrity checks, in id order.
    pub fn get_enabled(&self) -> Vec<Destination> {
        self.destinations
            .read()
            .iter()
            .filter(|d| d.is_usable())
            .cloned()
            .collect()
    }

    pub fn get(&self, id: u32) -> Option<Destination> {
        self.destinations.read().iter().find(|d| d.id == id).cloned()
    }

    pub fn get_by_remote_id(&self, remote_id: &str) -> Option<Destination> {
        self.destinations
            .read()
            .iter()
            .find(|d| d.remote_id == remote_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Destination> {
        self.destinations.read().clone()
    }

    pub fn toggle(&self, id: u32, enabled: bool) -> Result<Destination> {
        self.update(
            id,
            DestinationPatch {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
    }

    pub fn update(&self, id: u32, patch: DestinationPatch) -> Result<Destination> {
        let mut destinations = self.destinations.write();
        let destination = destinations
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::not_found("Destination", id.to_string()))?;
        patch.apply(destination);
        info!(id, name = %destination.name, enabled = destination.enabled, "Destination updated");
        Ok(destination.clone())
    }

    /// Append a destination with the next free id.
    pub fn add(&self, data: NewDestination) -> Destination {
        let mut destinations = self.destinations.write();
        let id = destinations.iter().map(|d| d.id).max().map_or(1, |max| max + 1);
        let destination = data.into_destination(id);
        info!(id, name = %destination.name, "Destination added");
        destinations.push(destination.clone());
        destination
    }

    pub fn remove(&self, id: u32) -> Result<Destination> {
        let mut destinations = self.destinations.write();
        let position = destinations
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| Error::not_found("Destination", id.to_string()))?;
        let removed = destinations.remove(position);
        info!(id, name = %removed.name, "Destination removed");
        Ok(removed)
    }

    pub fn total_count(&self) -> usize {
        self.destinations.read().len()
    }

    /// Number of usable destinations.
    pub fn enabled_count(&self) -> usize {
        self.destinations.read().iter().filter(|d| d.is_usable()).count()
    }

    /// Usable destinations sharing `group`.
    pub fn by_credential_group(&self, group: &str) -> Vec<Destination> {
        self.destinations
            .read()
            .iter()
            .filter(|d| d.is_usable() && d.credential_group == group)
            .cloned()
            .collect()
    }

    /// Distinct credential groups of usable destinations, in first-seen order.
    pub fn credential_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = Vec::new();
        for destination in self.destinations.read().iter().filter(|d| d.is_usable()) {
            if !groups.contains(&destination.credential_group) {
                groups.push(destination.credential_group.clone());
            }
        }
        groups
    }

    pub fn group_usage_stats(&self) -> BTreeMap<String, GroupUsage> {
        let mut stats: BTreeMap<String, GroupUsage> = BTreeMap::new();
        for destination in self.destinations.read().iter() {
            let usage = stats.entry(destination.credential_group.clone()).or_default();
            usage.total += 1;
            usage.names.push(destination.name.clone());
            usage.destinations.push(GroupMember {
                id: destination.id,
                name: destination.name.clone(),
                remote_id: destination.remote_id.clone(),
                enabled: destination.enabled,
            });
        }
        stats
    }

    /// Check every destination whose enabled flag is set.
    ///
    /// Warnings do not affect `is_valid`.
    pub fn validate(&self) -> RegistryValidation {
        let destinations = self.destinations.read();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for d in destinations.iter().filter(|d| d.enabled) {
            if !d.has_valid_remote_id() {
                errors.push(format!("Page {}: Invalid or missing page ID", d.id));
            }
            if !d.has_valid_token() {
                errors.push(format!("Page {}: Invalid or missing access token", d.id));
            }
            if !d.has_valid_name() {
                errors.push(format!("Page {}: Invalid or missing page name", d.id));
            }
            if let Some(err) = &d.last_error {
                warnings.push(format!("Page {} ({}): Has error - {}", d.id, d.name, err));
            }
            if d.is_unverified() {
                warnings.push(format!("Page {} ({}): Page is not verified", d.id, d.name));
            }
        }

        let total_count = destinations.len();
        let enabled_count = destinations.iter().filter(|d| d.is_usable()).count();
        RegistryValidation {
            is_valid: errors.is_empty(),
            errors,
            warnings,
            enabled_count,
            disabled_count: total_count - enabled_count,
            total_count,
        }
    }

    /// Log and return a registry overview.
    pub fn report(&self) -> RegistryReport {
        let groups = self.group_usage_stats();
        let validation = self.validate();
        let report = RegistryReport {
            total_count: self.total_count(),
            enabled_count: self.enabled_count(),
            credential_groups: groups.len(),
            groups,
            validation,
        };

        info!(
            total = report.total_count,
            enabled = report.enabled_count,
            groups = report.credential_groups,
            "Destination registry report"
        );
        for (group, usage) in &report.groups {
            info!(group = %group, pages = usage.total, names = %usage.names.join(", "), "Credential group");
        }
        for error in &report.validation.errors {
            error!("{}", error);
        }
        for warning in &report.validation.warnings {
            warn!("{}", warning);
        }
        report
    }
}

#[async_trait]
impl DestinationSource for DestinationRegistry {
    async fn enabled_destinations(&self) -> Result<Vec<Destination>> {
        Ok(self.get_enabled())
    }
}
