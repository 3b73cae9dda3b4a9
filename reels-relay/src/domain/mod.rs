//! Domain layer for reels-relay.
//!
//! Jobs, their per-destination results, and the destinations they are posted to.

pub mod destination;
pub mod job;

pub use destination::{
    AccountIdentity, Destination, DestinationPatch, NewDestination, PAGE_ID_PLACEHOLDER_PREFIX,
    TOKEN_PLACEHOLDER_PREFIX,
};
pub use job::{Job, JobId, JobRequest, JobStatus, JobSummary, PostResult, ResultStatus};
