use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Cleartext startup password shared by every client of the service.
/// Per-user identity comes later, from a session token.
#[derive(Debug)]
pub struct ServiceAuthSource {
    password: String,
}

impl ServiceAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ServiceAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(?login, "startup authentication");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
