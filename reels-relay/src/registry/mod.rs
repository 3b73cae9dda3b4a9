//! Destination registry and identity resolution.

mod identity;
mod service;

pub use identity::{GraphIdentityProvider, IdentityProvider, ResolutionError};
pub use service::{
    DestinationCredential, DestinationRegistry, DestinationSource, GroupMember, GroupUsage,
    RegistryConfig, RegistryReport, RegistryValidation,
};
