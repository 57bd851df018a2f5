//! Gemini API key source
//!
//! Loads the ordered API key list the admission pool rotates over, and owns
//! the secret-hygiene wrapper for key material. This crate is a standalone
//! library with no dependency on the pool — it can be tested and used
//! independently.
//!
//! Startup flow:
//! 1. Service calls `KeyStore::load()` with the key file path
//! 2. Load failures (missing file, bad JSON, empty list, zero quota,
//!    duplicates) are fatal — there is nothing to serve without keys
//! 3. `KeyStore::into_records()` hands the ordered records to the pool
//!
//! Membership is immutable after load. Runtime mutations (deactivation,
//! usage counts) happen in the pool and are never persisted back.

pub mod error;
pub mod records;
pub mod secret;

pub use error::{Error, Result};
pub use records::{KeyQuota, KeyRecord, KeyStatus, KeyStore};
pub use secret::{Secret, mask_key};
