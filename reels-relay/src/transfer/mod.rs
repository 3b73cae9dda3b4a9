//! Transfer tuning and instrumentation.

pub mod tracker;
pub mod tuner;

pub use tracker::{DestinationReport, PerformanceReport, TransferSummary, TransferTracker};
pub use tuner::{
    MIB, NetworkProfile, NetworkQuality, NetworkReport, TransferSettings, TransferTuner,
    TunerConfig, TunerEvent, UploadSample,
};
