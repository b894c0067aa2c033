//! Who is asking, and what they may do.
//!
//! Connections authenticate to the server with the service password
//! (`source`). Individual users then attach a JWT access token to the
//! session; `jwt` issues, rotates and revokes those tokens and `password`
//! hashes the credentials they are exchanged for.

mod jwt;
mod password;
mod source;

pub use jwt::{Claims, MIN_SECRET_LEN, RevocationStore, TokenKind, TokenPair, TokenService};
pub use password::{check_password_policy, hash_password, verify_password};
pub use source::ServiceAuthSource;

use ulid::Ulid;

use crate::model::Role;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token expired")]
    Expired,
    #[error("token revoked")]
    Revoked,
    #[error("expected a {expected} token")]
    WrongKind { expected: TokenKind },
    #[error("token was issued for another database")]
    WrongTenant,
    #[error("authentication required: SET hotdesk.token first")]
    Unauthenticated,
    #[error("permission denied: {0}")]
    Forbidden(&'static str),
    #[error("password must be {min} to {max} characters")]
    PasswordPolicy { min: usize, max: usize },
    #[error("JWT secret must be at least {0} characters")]
    WeakSecret(usize),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("cannot record revocation: {0}")]
    Storage(String),
}

/// The verified caller behind an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account_id: Ulid,
    pub role: Role,
    pub tenant: String,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AuthError::Forbidden("admin only"))
        }
    }

    /// Admins act for anyone; customers only for themselves.
    pub fn require_self_or_admin(&self, account_id: Ulid) -> Result<(), AuthError> {
        if self.is_admin() || self.account_id == account_id {
            Ok(())
        } else {
            Err(AuthError::Forbidden("not your booking"))
        }
    }
}
