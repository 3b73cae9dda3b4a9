//! Job dispatching and progress notifications.

mod notifier;
mod service;

pub use notifier::{JobNotification, Notifier};
pub use service::{
    ConnectionCheck, ConnectionStatus, DispatchConfig, DispatchEvent, JobDispatcher, QueueStatus,
    Uploader,
};
