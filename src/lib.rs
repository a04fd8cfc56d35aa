//! Voice-session client core for xiaozhi-compatible servers.

pub mod activation;
pub mod application;
pub mod audio;
pub mod blocking_queue;
pub mod config;
pub mod error;
pub mod protocol;
pub mod streaming;
pub mod vad;
