use async_trait::async_trait;
use ulid::Ulid;

use crate::auth::{AuthError, RevocationStore};
use crate::model::Event;

use super::{Engine, EngineError};

impl Engine {
    pub fn is_token_revoked(&self, jti: &Ulid) -> bool {
        self.revoked_tokens.contains_key(jti)
    }

    /// Persist a revocation. Returns false if `jti` was already revoked.
    ///
    /// Runs under the catalogue lock: the check-then-commit must not race a
    /// second revocation of the same token or a compaction snapshot.
    pub async fn revoke_token(&self, jti: Ulid, exp: i64) -> Result<bool, EngineError> {
        let _catalogue = self.catalogue_lock.lock().await;
        if self.revoked_tokens.contains_key(&jti) {
            return Ok(false);
        }
        self.commit(Event::TokenRevoked { jti, exp }, &mut []).await?;
        Ok(true)
    }

    /// Forget revocations of tokens that have expired on their own. The
    /// next compaction drops them from the WAL as well.
    pub fn prune_revoked_tokens(&self) -> usize {
        let now = self.clock.now_secs();
        let before = self.revoked_tokens.len();
        self.revoked_tokens.retain(|_, exp| *exp > now);
        before.saturating_sub(self.revoked_tokens.len())
    }

    pub fn revoked_token_count(&self) -> usize {
        self.revoked_tokens.len()
    }
}

#[async_trait]
impl RevocationStore for Engine {
    fn is_revoked(&self, jti: &Ulid) -> bool {
        self.is_token_revoked(jti)
    }

    async fn revoke(&self, jti: Ulid, exp: i64) -> Result<bool, AuthError> {
        self.revoke_token(jti, exp)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))
    }
}
