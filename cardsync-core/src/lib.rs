//! cardsync core library: domain types, configuration and errors.
//!
//! Public API surface:
//! - [`types`]: newtypes and domain structs
//! - [`error`]: [`ConfigError`]
//! - [`config`]: [`SyncConfig`] and its YAML loader

pub mod config;
pub mod error;
pub mod types;

pub use config::{CollectionRule, SyncConfig};
pub use error::ConfigError;
pub use types::{
    Block, CollectionLocation, ContentHash, Identity, NoteRecord, RemoteId, RemoteRecord,
    Revision, ShortIdentity,
};
