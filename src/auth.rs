//! Cleartext password check for pgwire logins. Every tenant shares the one
//! configured password; the tenant itself is picked by the database name.

use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

#[derive(Debug, Clone)]
pub struct SlotbookAuthSource {
    password: Arc<[u8]>,
}

impl SlotbookAuthSource {
    pub fn new(password: &str) -> Self {
        Self {
            password: Arc::from(password.as_bytes()),
        }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.to_vec()))
    }
}
