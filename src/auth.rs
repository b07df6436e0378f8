use std::collections::HashMap;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{PgWireError, PgWireResult};

/// Cleartext password lookup against the configured `user → password` map.
#[derive(Debug, Clone)]
pub struct SlotdAuthSource {
    credentials: HashMap<String, String>,
}

impl SlotdAuthSource {
    pub fn new(credentials: HashMap<String, String>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for SlotdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().map(|u| u.to_string()).unwrap_or_default();
        match self.credentials.get(user.as_str()) {
            Some(password) => Ok(Password::new(None, password.as_bytes().to_vec())),
            None => {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!("login attempt for unknown user {user:?}");
                Err(PgWireError::InvalidPassword(user))
            }
        }
    }
}
