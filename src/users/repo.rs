use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::users::repo_types::{NewUser, User, UserLookup, UserPatch};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique index (username or email) rejected the write.
    #[error("user already exists")]
    Duplicate,
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
            _ => StoreError::Database(e),
        }
    }
}

/// Persistence of user records.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_one(&self, lookup: &UserLookup) -> Result<Option<User>, StoreError>;
    async fn create(&self, new: NewUser) -> Result<User, StoreError>;
    /// Returns the updated record, or `None` if no record has this id.
    async fn update_by_id(&self, id: Uuid, patch: UserPatch) -> Result<Option<User>, StoreError>;
}

const USER_COLUMNS: &str = "id, full_name, username, email, password_hash, avatar, cover_image, \
                            refresh_token, created_at, updated_at";

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_one(&self, lookup: &UserLookup) -> Result<Option<User>, StoreError> {
        if lookup.is_empty() {
            return Ok(None);
        }
        // NULL binds never compare equal, so an absent identifier matches nothing.
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 OR email = $2 LIMIT 1"
        ))
        .bind(lookup.username.as_deref())
        .bind(lookup.email.as_deref())
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (full_name, username, email, password_hash, avatar, cover_image)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&new.full_name)
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(&new.avatar)
        .bind(new.cover_image.as_deref())
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn update_by_id(&self, id: Uuid, patch: UserPatch) -> Result<Option<User>, StoreError> {
        let user = match patch {
            UserPatch::RefreshToken(token) => {
                sqlx::query_as::<_, User>(&format!(
                    r#"
                    UPDATE users
                       SET refresh_token = $2, updated_at = now()
                     WHERE id = $1
                    RETURNING {USER_COLUMNS}
                    "#
                ))
                .bind(id)
                .bind(token)
                .fetch_optional(&self.db)
                .await?
            }
        };
        Ok(user)
    }
}
