//! Secret handling utilities.
//!
//! Re-exports secrecy types used for connection strings.

pub use secrecy::{ExposeSecret, SecretString};

/// Expose an optional secret, for handing a URL to a client constructor.
pub fn expose_optional(secret: &Option<SecretString>) -> Option<&str> {
    secret.as_ref().map(|s| s.expose_secret())
}
