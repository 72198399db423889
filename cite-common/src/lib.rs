//! # Citation Repair Common Library
//!
//! Shared code for the citation repair workspace including:
//! - Error type and result alias
//! - TOML bootstrap configuration
//! - Tracing initialization
//! - Event types (RepairEvent enum) and the broadcast event bus
//! - Key-value persistence for checkpoints and schedule entries

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod store;

pub use error::{Error, Result};
pub use events::{EventBus, RepairEvent};
pub use store::{open_store, FileStore, KeyValueStore, MemoryStore};
