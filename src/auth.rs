use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Single shared password for every database user. Clients are students'
/// booking front ends, not individual accounts.
#[derive(Debug)]
pub struct LabslotAuthSource {
    password: String,
}

impl LabslotAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for LabslotAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = ?login.user(), "password authentication");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
