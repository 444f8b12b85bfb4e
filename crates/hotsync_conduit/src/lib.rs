//! # HotSync Conduit Registry
//!
//! Maps application creators to the conduits that synchronize them, with
//! their run priority, paths, remote database name and user preferences.
//!
//! String getters come in two forms: a borrowing form returning `&str` and
//! an `_into` form that copies into a caller buffer with a trailing NUL and
//! fails with [`RegistryError::BufferTooSmall`] instead of truncating.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod registry;

pub use config::{
    ConduitConfig, ConduitKind, PreferenceScope, SyncPreference, SyncType, DEFAULT_PRIORITY,
};
pub use error::{RegistryError, RegistryResult};
pub use registry::{copy_into, ConduitRegistry};
