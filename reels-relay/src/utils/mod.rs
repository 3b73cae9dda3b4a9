//! Shared helpers.

pub mod graph;
pub mod http_client;
