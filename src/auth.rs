use std::collections::HashSet;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

use crate::engine::BookingError;
use crate::limits::MAX_USER_LEN;
use crate::model::{Identity, Role, UserId};

/// Shared-password check for the cleartext startup handshake.
#[derive(Debug)]
pub struct SlotbookAuthSource {
    password: String,
}

impl SlotbookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

/// Maps a login name to an identity with a role.
#[derive(Debug, Clone, Default)]
pub struct RoleResolver {
    admins: HashSet<String>,
}

impl RoleResolver {
    pub fn new(admins: HashSet<String>) -> Self {
        Self { admins }
    }

    pub fn identify(&self, user: Option<&str>) -> Result<Identity, BookingError> {
        let user = user.map(str::trim).unwrap_or_default();
        if user.is_empty() {
            return Err(BookingError::Unauthenticated);
        }
        if user.len() > MAX_USER_LEN {
            return Err(BookingError::InvalidInput("user name too long".into()));
        }
        let role = if self.admins.contains(user) {
            Role::Admin
        } else {
            Role::Customer
        };
        Ok(Identity {
            user_id: UserId(user.to_string()),
            role,
        })
    }
}
