//! Admission pool for Gemini API keys
//!
//! Manages a fixed ring of interchangeable API keys, each with an
//! independent requests-per-minute quota, and hands a usable key to
//! concurrent callers while enforcing per-key token-bucket rate limits and
//! availability state.
//!
//! Key lifecycle:
//! 1. `gemini-keystore` loads and validates the ordered key list at startup
//! 2. `KeyPool::new` takes ownership of the records; membership is fixed
//!    for the process lifetime
//! 3. Callers `select()` a key round-robin; its bucket is debited at
//!    selection time
//! 4. After the upstream call, the caller reports the outcome:
//!    `report_success` bumps the usage counter, `report_failure` retires
//!    the key (or starts a cooldown under `FailurePolicy::Cooldown`)
//! 5. Exhaustion is returned as a value (`Error::Exhausted`), a normal
//!    outcome the caller answers with backoff or a transient error upward
//!
//! Build the pool once and share it by reference (`Arc<KeyPool>`); a second
//! instance would lose bucket levels and the rotation position.

pub mod bucket;
pub mod error;
pub mod pool;

mod metrics;

pub use bucket::TokenBucket;
pub use error::{Error, Result};
pub use pool::{FailurePolicy, KeyPool, KeyState, SelectedKey};
