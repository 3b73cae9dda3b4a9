//! Publishing a video to one destination.

mod error;
mod graph;
mod platform;
mod protocol;

pub use error::{TransferError, TransferPhase, UploadError, safe_message};
pub use graph::GraphPublisher;
pub use platform::{PlatformError, PublishingPlatform};
pub use protocol::{DEFAULT_CAPTION, UploadOutcome, UploadPath, UploadProtocol};
