//! HS256 access and refresh tokens.
//!
//! Expiry is checked against the injected [`Clock`] rather than by
//! `jsonwebtoken`, so tests can move time. Revoked refresh tokens (after
//! rotation) and logged-out tokens are remembered by `jti` in a
//! [`RevocationStore`] until they would have expired anyway. Tokens are bound
//! to one tenant, so each tenant keeps its own store.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::Role;

use super::{AuthError, Identity};

pub const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Account id.
    pub sub: Ulid,
    pub role: Role,
    /// Database the token was issued for.
    pub tenant: String,
    pub kind: TokenKind,
    pub jti: Ulid,
    /// Unix seconds.
    pub iat: i64,
    /// Unix seconds.
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub access_expires_at: i64,
    /// Unix seconds.
    pub refresh_expires_at: i64,
}

/// Durable set of `jti`s that must no longer be accepted.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    fn is_revoked(&self, jti: &Ulid) -> bool;

    /// Record `jti` until `exp` (unix seconds). Returns false if it was
    /// already revoked; concurrent calls for one `jti` see exactly one true.
    async fn revoke(&self, jti: Ulid, exp: i64) -> Result<bool, AuthError>;
}

pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: i64,
    refresh_ttl_secs: i64,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(
        secret: &str,
        access_ttl_secs: i64,
        refresh_ttl_secs: i64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AuthError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::WeakSecret(MIN_SECRET_LEN));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl_secs,
            refresh_ttl_secs,
            clock,
        })
    }

    fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Signature and shape only. Callers check kind, tenant, expiry and revocation.
    fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    fn check(
        &self,
        claims: &Claims,
        kind: TokenKind,
        tenant: &str,
        revoked: &dyn RevocationStore,
    ) -> Result<(), AuthError> {
        if claims.kind != kind {
            return Err(AuthError::WrongKind { expected: kind });
        }
        if claims.tenant != tenant {
            return Err(AuthError::WrongTenant);
        }
        if claims.exp <= self.clock.now_secs() {
            return Err(AuthError::Expired);
        }
        if revoked.is_revoked(&claims.jti) {
            return Err(AuthError::Revoked);
        }
        Ok(())
    }

    pub fn issue_pair(
        &self,
        account_id: Ulid,
        role: Role,
        tenant: &str,
    ) -> Result<TokenPair, AuthError> {
        let now = self.clock.now_secs();
        let claims = |kind, ttl| Claims {
            sub: account_id,
            role,
            tenant: tenant.to_string(),
            kind,
            jti: Ulid::new(),
            iat: now,
            exp: now + ttl,
        };
        let access = claims(TokenKind::Access, self.access_ttl_secs);
        let refresh = claims(TokenKind::Refresh, self.refresh_ttl_secs);
        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            access_expires_at: access.exp,
            refresh_expires_at: refresh.exp,
        })
    }

    pub fn verify_access(
        &self,
        token: &str,
        tenant: &str,
        revoked: &dyn RevocationStore,
    ) -> Result<Identity, AuthError> {
        let claims = self.decode(token)?;
        self.check(&claims, TokenKind::Access, tenant, revoked)?;
        Ok(Identity {
            account_id: claims.sub,
            role: claims.role,
            tenant: claims.tenant,
        })
    }

    /// Exchange a refresh token for a new pair. The presented token is
    /// revoked, so a second exchange with it fails.
    pub async fn rotate(
        &self,
        refresh_token: &str,
        tenant: &str,
        revoked: &dyn RevocationStore,
    ) -> Result<(Identity, TokenPair), AuthError> {
        let claims = self.decode(refresh_token)?;
        self.check(&claims, TokenKind::Refresh, tenant, revoked)?;
        // Insert-or-fail so two concurrent rotations cannot both win.
        if !revoked.revoke(claims.jti, claims.exp).await? {
            return Err(AuthError::Revoked);
        }
        let pair = self.issue_pair(claims.sub, claims.role, tenant)?;
        let identity = Identity {
            account_id: claims.sub,
            role: claims.role,
            tenant: claims.tenant,
        };
        Ok((identity, pair))
    }

    /// Blacklist a token of either kind. Returns false if it was already revoked.
    pub async fn revoke(
        &self,
        token: &str,
        tenant: &str,
        revoked: &dyn RevocationStore,
    ) -> Result<bool, AuthError> {
        let claims = self.decode(token)?;
        if claims.tenant != tenant {
            return Err(AuthError::WrongTenant);
        }
        if claims.exp <= self.clock.now_secs() {
            return Ok(false);
        }
        revoked.revoke(claims.jti, claims.exp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use dashmap::DashMap;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";
    /// 2030-01-01T00:00:00Z
    const T0: i64 = 1_893_456_000_000;

    #[derive(Default)]
    struct MemoryRevocations(DashMap<Ulid, i64>);

    #[async_trait]
    impl RevocationStore for MemoryRevocations {
        fn is_revoked(&self, jti: &Ulid) -> bool {
            self.0.contains_key(jti)
        }

        async fn revoke(&self, jti: Ulid, exp: i64) -> Result<bool, AuthError> {
            Ok(self.0.insert(jti, exp).is_none())
        }
    }

    fn service() -> (TokenService, Arc<ManualClock>, MemoryRevocations) {
        let clock = Arc::new(ManualClock::new(T0));
        let svc = TokenService::new(SECRET, 900, 7 * 24 * 3600, clock.clone()).unwrap();
        (svc, clock, MemoryRevocations::default())
    }

    #[test]
    fn short_secret_rejected() {
        let clock = Arc::new(ManualClock::new(T0));
        let result = TokenService::new("too-short", 900, 3600, clock);
        assert!(matches!(result, Err(AuthError::WeakSecret(MIN_SECRET_LEN))));
    }

    #[test]
    fn access_token_roundtrip() {
        let (svc, _, store) = service();
        let id = Ulid::new();
        let pair = svc.issue_pair(id, Role::Customer, "main").unwrap();
        assert_eq!(pair.access_expires_at, T0 / 1000 + 900);

        let who = svc.verify_access(&pair.access_token, "main", &store).unwrap();
        assert_eq!(who.account_id, id);
        assert_eq!(who.role, Role::Customer);
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let (svc, _, store) = service();
        let pair = svc.issue_pair(Ulid::new(), Role::Admin, "main").unwrap();
        let result = svc.verify_access(&pair.refresh_token, "main", &store);
        assert!(matches!(
            result,
            Err(AuthError::WrongKind { expected: TokenKind::Access })
        ));
    }

    #[test]
    fn token_bound_to_tenant() {
        let (svc, _, store) = service();
        let pair = svc.issue_pair(Ulid::new(), Role::Admin, "main").unwrap();
        assert!(matches!(
            svc.verify_access(&pair.access_token, "other", &store),
            Err(AuthError::WrongTenant)
        ));
    }

    #[test]
    fn access_token_expires() {
        let (svc, clock, store) = service();
        let pair = svc.issue_pair(Ulid::new(), Role::Customer, "main").unwrap();
        clock.advance(899_000);
        assert!(svc.verify_access(&pair.access_token, "main", &store).is_ok());
        clock.advance(1_000);
        assert!(matches!(
            svc.verify_access(&pair.access_token, "main", &store),
            Err(AuthError::Expired)
        ));
    }

    #[test]
    fn tampered_token_rejected() {
        let (svc, _, store) = service();
        let pair = svc.issue_pair(Ulid::new(), Role::Customer, "main").unwrap();
        // Admin claims under a customer token's signature.
        let admin = svc.issue_pair(Ulid::new(), Role::Admin, "main").unwrap();
        let parts: Vec<&str> = pair.access_token.split('.').collect();
        let admin_parts: Vec<&str> = admin.access_token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], admin_parts[1], parts[2]);
        assert!(matches!(
            svc.verify_access(&forged, "main", &store),
            Err(AuthError::InvalidToken(_))
        ));

        let clock = Arc::new(ManualClock::new(T0));
        let other = TokenService::new("another-secret-of-thirty-two-chars!!", 900, 3600, clock)
            .unwrap();
        assert!(matches!(
            other.verify_access(&pair.access_token, "main", &store),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn rotation_blacklists_old_refresh_token() {
        let (svc, _, store) = service();
        let id = Ulid::new();
        let pair = svc.issue_pair(id, Role::Customer, "main").unwrap();

        let (who, next) = svc.rotate(&pair.refresh_token, "main", &store).await.unwrap();
        assert_eq!(who.account_id, id);
        assert_ne!(next.refresh_token, pair.refresh_token);
        assert!(svc.verify_access(&next.access_token, "main", &store).is_ok());

        assert!(matches!(
            svc.rotate(&pair.refresh_token, "main", &store).await,
            Err(AuthError::Revoked)
        ));
        assert!(svc.rotate(&next.refresh_token, "main", &store).await.is_ok());
    }

    #[tokio::test]
    async fn access_token_cannot_rotate() {
        let (svc, _, store) = service();
        let pair = svc.issue_pair(Ulid::new(), Role::Customer, "main").unwrap();
        assert!(matches!(
            svc.rotate(&pair.access_token, "main", &store).await,
            Err(AuthError::WrongKind { expected: TokenKind::Refresh })
        ));
    }

    #[tokio::test]
    async fn logout_revokes_until_expiry() {
        let (svc, clock, store) = service();
        let pair = svc.issue_pair(Ulid::new(), Role::Customer, "main").unwrap();
        assert!(svc.revoke(&pair.access_token, "main", &store).await.unwrap());
        assert!(!svc.revoke(&pair.access_token, "main", &store).await.unwrap());
        assert!(matches!(
            svc.verify_access(&pair.access_token, "main", &store),
            Err(AuthError::Revoked)
        ));

        // Already expired: nothing to remember.
        let later = svc.issue_pair(Ulid::new(), Role::Customer, "main").unwrap();
        clock.advance(900_000);
        assert!(!svc.revoke(&later.access_token, "main", &store).await.unwrap());
        assert_eq!(store.0.len(), 1);
    }
}
