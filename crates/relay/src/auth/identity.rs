use beacon_common::types::UserId;
use thiserror::Error;

/// Why a bearer credential could not be turned into a user identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("credential is missing")]
    Missing,
    #[error("credential has expired")]
    Expired,
    #[error("credential signature is invalid")]
    InvalidSignature,
    #[error("credential claims are malformed: {0}")]
    MalformedClaims(String),
    #[error("credential does not name a user")]
    MissingIdentity,
}

/// Validates a bearer credential and yields the user it was issued to.
///
/// Used once per connection at handshake time and by the REST bearer
/// middleware. Implementations must reject zero and negative identities.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, credential: &str) -> Result<UserId, IdentityError>;
}
