//! Spacesync Core Library
//!
//! This crate provides the core types, canonical encoding, and hash
//! derivations for the spacesync replication protocol.
//!
//! # Modules
//!
//! - [`types`]: Core protocol types (SpaceId, ObjectId, Element, RawChange, etc.)
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Identity derivations and verification
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
