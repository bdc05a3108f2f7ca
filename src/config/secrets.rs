//! Secret handling re-exports, so callers don't depend on `secrecy` directly.

pub use secrecy::{ExposeSecret, SecretString};
