//! reels-relay library crate.
//!
//! Sequentially republishes a submitted video to every enabled Facebook page,
//! using the Reels resumable upload protocol with a single-shot fallback.

pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod logging;
pub mod media;
pub mod notification;
pub mod registry;
pub mod transfer;
pub mod upload;
pub mod utils;

pub use error::{Error, Result};
