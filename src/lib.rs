//! covercache - A two-tier image cache.
//!
//! Images are resolved memory -> disk -> network. Decoded images live in a bounded
//! LRU, original downloaded bytes are persisted under a hashed key, and decoding can
//! bound the longest edge so large covers never reach memory at full size.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing the cache tiers and adapters.
pub mod infrastructure;
/// Presentation layer containing UI-facing loaders.
pub mod presentation;

/// Current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
