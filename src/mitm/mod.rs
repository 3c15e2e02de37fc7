//! MITM interception: leaf certificate issuance, the TTL'd leaf cache, and
//! the TLS interceptor that feeds decrypted requests back into the forwarder.

pub mod interceptor;
pub mod issuer;
pub mod manager;

pub use interceptor::{serve_mitm, InterceptError};
pub use issuer::{IssuerError, LeafIdentity, LeafIssuer};
pub use manager::{MitmError, MitmManager};
