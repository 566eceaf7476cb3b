use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::password::{hash_password, verify_password};

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub full_name: String,
    pub username: String, // unique, lower-cased
    pub email: String,    // unique, lower-cased
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 hash, not exposed in JSON
    pub avatar: String,
    pub cover_image: Option<String>,
    #[serde(skip_serializing)]
    pub refresh_token: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl User {
    pub fn is_password_correct(&self, plain: &str) -> anyhow::Result<bool> {
        verify_password(plain, &self.password_hash)
    }
}

/// Fields required to insert a user. The password is hashed on construction.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub full_name: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub avatar: String,
    pub cover_image: Option<String>,
}

impl NewUser {
    pub fn new(
        full_name: &str,
        username: &str,
        email: &str,
        password: &str,
        avatar: String,
        cover_image: Option<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            full_name: full_name.trim().to_string(),
            username: normalize_identifier(username),
            email: normalize_identifier(email),
            password_hash: hash_password(password)?,
            avatar,
            cover_image,
        })
    }
}

/// Field-qualified lookup: matches a record whose username OR email equals the given value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserLookup {
    pub username: Option<String>,
    pub email: Option<String>,
}

impl UserLookup {
    pub fn new(username: Option<&str>, email: Option<&str>) -> Self {
        let clean = |v: Option<&str>| {
            v.map(normalize_identifier).filter(|v| !v.is_empty())
        };
        Self {
            username: clean(username),
            email: clean(email),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.email.is_none()
    }

    pub fn matches(&self, user: &User) -> bool {
        self.username.as_deref() == Some(user.username.as_str())
            || self.email.as_deref() == Some(user.email.as_str())
    }
}

/// Partial update applied by `UserStore::update_by_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserPatch {
    /// Set (`Some`) or clear (`None`) the persisted refresh token.
    RefreshToken(Option<String>),
}

/// User as returned to clients: no password hash, no refresh token.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PublicUser {
    pub id: Uuid,
    pub full_name: String,
    pub username: String,
    pub email: String,
    pub avatar: String,
    pub cover_image: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<User> for PublicUser {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            full_name: u.full_name,
            username: u.username,
            email: u.email,
            avatar: u.avatar,
            cover_image: u.cover_image,
            created_at: u.created_at,
            updated_at: u.updated_at,
        }
    }
}

pub(crate) fn normalize_identifier(v: &str) -> String {
    v.trim().to_lowercase()
}
