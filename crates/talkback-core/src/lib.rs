//! Core types, config, errors, wire protocol, and state store for Talkback.

pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod types;
