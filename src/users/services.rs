use axum::extract::FromRef;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    auth::jwt::JwtKeys,
    error::{ApiError, ApiResult},
    media::MediaAsset,
    state::AppState,
    uploads::UploadedFile,
    users::{
        dto::{LoginRequest, LoginResponse, RegisterInput, TokenPair},
        repo::StoreError,
        repo_types::{normalize_identifier, NewUser, PublicUser, UserLookup, UserPatch},
    },
};

const REGISTER_FAILED: &str = "Something went wrong while registering the user";
const TOKENS_FAILED: &str = "Something went wrong while generating refresh and access token";

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate => {
                ApiError::conflict("User with email or username already exists")
            }
            StoreError::Database(e) => {
                error!(error = %e, "user store failure");
                ApiError::internal("Internal server error")
            }
        }
    }
}

/// Why a token pair could not be issued.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("user {0} not found")]
    UserNotFound(Uuid),
    #[error("signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("persisting refresh token failed: {0}")]
    Persistence(#[from] StoreError),
}

impl From<TokenError> for ApiError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::UserNotFound(id) => {
                warn!(user_id = %id, "token issue for missing user");
                ApiError::not_found("User does not exist")
            }
            other => {
                error!(error = %other, "token issue failed");
                ApiError::internal(TOKENS_FAILED)
            }
        }
    }
}

/// Signs an access/refresh pair for the user and stores the refresh token on the record.
pub async fn issue_tokens(st: &AppState, user_id: Uuid) -> Result<TokenPair, TokenError> {
    let user = st
        .users
        .find_by_id(user_id)
        .await?
        .ok_or(TokenError::UserNotFound(user_id))?;

    let keys = JwtKeys::from_ref(st);
    let access_token = keys.sign_access(&user)?;
    let refresh_token = keys.sign_refresh(&user)?;

    st.users
        .update_by_id(user_id, UserPatch::RefreshToken(Some(refresh_token.clone())))
        .await?
        .ok_or(TokenError::UserNotFound(user_id))?;

    Ok(TokenPair {
        access_token,
        refresh_token,
    })
}

/// Registers a user. Temp files of the form are gone once this returns.
pub async fn register_user(st: &AppState, input: RegisterInput) -> ApiResult<PublicUser> {
    let temp_files: Vec<UploadedFile> = input
        .avatar
        .iter()
        .chain(input.cover_image.iter())
        .cloned()
        .collect();

    let result = register(st, input).await;

    for file in &temp_files {
        file.discard().await;
    }
    result
}

fn required(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

async fn register(st: &AppState, input: RegisterInput) -> ApiResult<PublicUser> {
    let (Some(full_name), Some(email), Some(username), Some(password)) = (
        required(input.full_name),
        required(input.email),
        required(input.username),
        required(input.password),
    ) else {
        return Err(ApiError::bad_request("All fields are required"));
    };

    if !is_valid_email(&normalize_identifier(&email)) {
        warn!(%email, "invalid email");
        return Err(ApiError::bad_request("Invalid email"));
    }

    let lookup = UserLookup::new(Some(&username), Some(&email));
    if st.users.find_one(&lookup).await?.is_some() {
        warn!(username = ?lookup.username, email = ?lookup.email, "user already exists");
        return Err(ApiError::conflict("User with email or username already exists"));
    }

    let avatar_file = input
        .avatar
        .ok_or_else(|| ApiError::bad_request("Avatar file is required"))?;

    let avatar = upload(st, &avatar_file, "avatar").await;
    let cover_image = match &input.cover_image {
        Some(file) => upload(st, file, "cover image").await,
        None => None,
    };

    let Some(avatar) = avatar else {
        destroy(st, cover_image.as_ref()).await;
        return Err(ApiError::bad_request("Avatar file is required"));
    };

    let new = NewUser::new(
        &full_name,
        &username,
        &email,
        &password,
        avatar.url.clone(),
        cover_image.as_ref().map(|a| a.url.clone()),
    )
    .map_err(|e| {
        error!(error = %e, "building user failed");
        ApiError::internal(REGISTER_FAILED)
    });
    let created = match new {
        Ok(new) => st.users.create(new).await.map_err(ApiError::from),
        Err(e) => Err(e),
    };
    let created = match created {
        Ok(user) => user,
        Err(e) => {
            destroy(st, Some(&avatar)).await;
            destroy(st, cover_image.as_ref()).await;
            return Err(e);
        }
    };

    let user = match st.users.find_by_id(created.id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            error!(user_id = %created.id, "created user vanished");
            return Err(ApiError::internal(REGISTER_FAILED));
        }
        Err(e) => {
            error!(error = %e, user_id = %created.id, "re-fetch created user failed");
            return Err(ApiError::internal(REGISTER_FAILED));
        }
    };

    info!(user_id = %user.id, username = %user.username, "user registered");
    Ok(PublicUser::from(user))
}

async fn upload(st: &AppState, file: &UploadedFile, what: &str) -> Option<MediaAsset> {
    match st.media.upload(&file.path, &file.content_type).await {
        Ok(asset) => Some(asset),
        Err(e) => {
            warn!(error = %e, what, "media upload failed");
            None
        }
    }
}

async fn destroy(st: &AppState, asset: Option<&MediaAsset>) {
    let Some(asset) = asset else { return };
    if let Err(e) = st.media.destroy(&asset.key).await {
        warn!(error = %e, key = %asset.key, "failed to destroy orphaned upload");
    }
}

pub async fn login_user(st: &AppState, req: LoginRequest) -> ApiResult<LoginResponse> {
    let lookup = UserLookup::new(req.username.as_deref(), req.email.as_deref());
    if lookup.is_empty() {
        return Err(ApiError::bad_request("Username or email is required"));
    }
    let password = required(req.password)
        .ok_or_else(|| ApiError::bad_request("Password is required"))?;

    let user = st
        .users
        .find_one(&lookup)
        .await?
        .ok_or_else(|| {
            warn!(username = ?lookup.username, email = ?lookup.email, "login unknown user");
            ApiError::not_found("User does not exist")
        })?;

    let ok = user.is_password_correct(&password).map_err(|e| {
        error!(error = %e, user_id = %user.id, "verify_password failed");
        ApiError::internal("Internal server error")
    })?;
    if !ok {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::unauthorized("Invalid user credentials"));
    }

    let tokens = issue_tokens(st, user.id).await?;

    let user = st
        .users
        .find_by_id(user.id)
        .await?
        .ok_or_else(|| ApiError::not_found("User does not exist"))?;

    info!(user_id = %user.id, "user logged in");
    Ok(LoginResponse {
        user: PublicUser::from(user),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
    })
}

/// Revokes the persisted refresh token. A missing record is not an error.
pub async fn logout_user(st: &AppState, user_id: Uuid) -> ApiResult<()> {
    match st
        .users
        .update_by_id(user_id, UserPatch::RefreshToken(None))
        .await?
    {
        Some(_) => info!(%user_id, "user logged out"),
        None => debug!(%user_id, "logout for unknown user"),
    }
    Ok(())
}

/// Exchanges the current refresh token for a new pair. Each refresh token works once.
pub async fn refresh_tokens(st: &AppState, incoming: Option<String>) -> ApiResult<TokenPair> {
    let incoming = required(incoming).ok_or_else(|| ApiError::unauthorized("Unauthorized request"))?;

    let keys = JwtKeys::from_ref(st);
    let claims = keys.verify_refresh(&incoming).map_err(|e| {
        warn!(error = %e, "refresh token rejected");
        ApiError::unauthorized("Invalid refresh token")
    })?;

    let user = st
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid refresh token"))?;

    if user.refresh_token.as_deref() != Some(incoming.as_str()) {
        warn!(user_id = %user.id, "stale refresh token presented");
        return Err(ApiError::unauthorized("Refresh token is expired or used"));
    }

    let tokens = issue_tokens(st, user.id).await?;
    debug!(user_id = %user.id, "tokens refreshed");
    Ok(tokens)
}

pub async fn current_user(st: &AppState, user_id: Uuid) -> ApiResult<PublicUser> {
    st.users
        .find_by_id(user_id)
        .await?
        .map(PublicUser::from)
        .ok_or_else(|| ApiError::not_found("User does not exist"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::{media::fake::FakeMediaStore, users::memory::MemoryUserStore};

    struct Harness {
        st: AppState,
        users: Arc<MemoryUserStore>,
        media: Arc<FakeMediaStore>,
    }

    fn harness_with(media: FakeMediaStore) -> Harness {
        let users = Arc::new(MemoryUserStore::default());
        let media = Arc::new(media);
        let st = AppState::fake_with(users.clone(), media.clone());
        Harness { st, users, media }
    }

    fn harness() -> Harness {
        harness_with(FakeMediaStore::default())
    }

    async fn temp_file(st: &AppState, name: &str) -> UploadedFile {
        UploadedFile::persist(
            std::path::Path::new(&st.config.upload_tmp_dir),
            Some(name),
            "image/png",
            Bytes::from_static(b"\x89PNG"),
        )
        .await
        .unwrap()
    }

    async fn form(st: &AppState, username: &str, email: &str) -> RegisterInput {
        RegisterInput {
            full_name: Some("Ada Lovelace".into()),
            email: Some(email.into()),
            username: Some(username.into()),
            password: Some("analytical".into()),
            avatar: Some(temp_file(st, "avatar.png").await),
            cover_image: None,
        }
    }

    async fn registered(h: &Harness, username: &str, email: &str) -> PublicUser {
        let input = form(&h.st, username, email).await;
        register_user(&h.st, input).await.expect("register")
    }

    #[tokio::test]
    async fn register_rejects_blank_or_missing_fields() {
        let h = harness();

        let mut blank = form(&h.st, "ada", "ada@example.com").await;
        blank.full_name = Some("   ".into());
        let avatar_path = blank.avatar.as_ref().unwrap().path.clone();
        let err = register_user(&h.st, blank).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "All fields are required"));
        assert!(!avatar_path.exists(), "temp file left behind");

        let mut missing = form(&h.st, "ada", "ada@example.com").await;
        missing.password = None;
        let err = register_user(&h.st, missing).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));

        assert_eq!(h.users.len(), 0);
        assert!(h.media.uploaded.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn register_rejects_malformed_email() {
        let h = harness();
        let input = form(&h.st, "ada", "not-an-email").await;
        let err = register_user(&h.st, input).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "Invalid email"));
    }

    #[tokio::test]
    async fn register_rejects_duplicates() {
        let h = harness();
        registered(&h, "ada", "ada@example.com").await;

        let same_name = form(&h.st, "ADA", "other@example.com").await;
        let err = register_user(&h.st, same_name).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        let same_email = form(&h.st, "someone", "Ada@Example.com").await;
        let err = register_user(&h.st, same_email).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));

        assert_eq!(h.users.len(), 1);
    }

    #[tokio::test]
    async fn register_requires_avatar() {
        let h = harness();
        let mut input = form(&h.st, "ada", "ada@example.com").await;
        input.avatar = None;
        let err = register_user(&h.st, input).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "Avatar file is required"));
        assert_eq!(h.users.len(), 0);
    }

    #[tokio::test]
    async fn failed_avatar_upload_is_a_bad_request_and_cleans_up_cover() {
        let h = harness_with(FakeMediaStore::failing_on("avatar"));
        let mut input = form(&h.st, "ada", "ada@example.com").await;
        input.cover_image = Some(temp_file(&h.st, "cover.png").await);

        let err = register_user(&h.st, input).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "Avatar file is required"));
        assert_eq!(h.users.len(), 0);

        let uploaded = h.media.uploaded.lock().unwrap().clone();
        assert_eq!(*h.media.destroyed.lock().unwrap(), uploaded);
    }

    #[tokio::test]
    async fn failed_cover_upload_still_registers() {
        let h = harness_with(FakeMediaStore::failing_on("cover"));
        let mut input = form(&h.st, "ada", "ada@example.com").await;
        input.cover_image = Some(temp_file(&h.st, "cover.png").await);

        let user = register_user(&h.st, input).await.expect("register");
        assert!(user.cover_image.is_none());
        assert!(user.avatar.starts_with("https://fake.local/"));
    }

    #[tokio::test]
    async fn register_returns_sanitized_lowercased_user() {
        let h = harness();
        let mut input = form(&h.st, "  AdaL ", "ada@example.com").await;
        input.cover_image = Some(temp_file(&h.st, "cover.png").await);

        let user = register_user(&h.st, input).await.expect("register");
        assert_eq!(user.username, "adal");
        assert_eq!(user.full_name, "Ada Lovelace");
        assert!(user.cover_image.is_some());

        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password").is_none());
        assert!(json.get("passwordHash").is_none());
        assert!(json.get("refreshToken").is_none());

        let stored = h.users.get(user.id).unwrap();
        assert_ne!(stored.password_hash, "analytical");
        assert!(stored.refresh_token.is_none());
    }

    #[tokio::test]
    async fn login_requires_identifier_and_password() {
        let h = harness();
        let err = login_user(
            &h.st,
            LoginRequest {
                username: Some(" ".into()),
                email: None,
                password: Some("x".into()),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "Username or email is required"));

        let err = login_user(
            &h.st,
            LoginRequest {
                username: Some("ada".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(ref m) if m == "Password is required"));
    }

    #[tokio::test]
    async fn login_unknown_user_is_not_found() {
        let h = harness();
        let err = login_user(
            &h.st,
            LoginRequest {
                email: Some("ghost@example.com".into()),
                password: Some("whatever".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn login_wrong_password_is_unauthorized() {
        let h = harness();
        registered(&h, "ada", "ada@example.com").await;
        let err = login_user(
            &h.st,
            LoginRequest {
                username: Some("ada".into()),
                password: Some("wrong".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn login_by_either_identifier_persists_refresh_token() {
        let h = harness();
        let user = registered(&h, "ada", "ada@example.com").await;

        let by_email = login_user(
            &h.st,
            LoginRequest {
                email: Some("ADA@example.com".into()),
                password: Some("analytical".into()),
                ..Default::default()
            },
        )
        .await
        .expect("login by email");
        assert_eq!(by_email.user.id, user.id);

        let by_name = login_user(
            &h.st,
            LoginRequest {
                username: Some("Ada".into()),
                password: Some("analytical".into()),
                ..Default::default()
            },
        )
        .await
        .expect("login by username");

        let keys = JwtKeys::from_ref(&h.st);
        assert_eq!(keys.verify(&by_name.access_token).unwrap().sub, user.id);
        assert_eq!(
            h.users.get(user.id).unwrap().refresh_token.as_deref(),
            Some(by_name.refresh_token.as_str())
        );
    }

    #[tokio::test]
    async fn logout_clears_refresh_token_and_tolerates_unknown_users() {
        let h = harness();
        let user = registered(&h, "ada", "ada@example.com").await;
        issue_tokens(&h.st, user.id).await.unwrap();
        assert!(h.users.get(user.id).unwrap().refresh_token.is_some());

        logout_user(&h.st, user.id).await.unwrap();
        assert!(h.users.get(user.id).unwrap().refresh_token.is_none());

        // never logged in
        logout_user(&h.st, user.id).await.unwrap();
        logout_user(&h.st, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn issue_tokens_reports_missing_user() {
        let h = harness();
        let id = Uuid::new_v4();
        let err = issue_tokens(&h.st, id).await.unwrap_err();
        assert!(matches!(err, TokenError::UserNotFound(missing) if missing == id));
        assert!(matches!(ApiError::from(err), ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn refresh_rotates_and_rejects_replay() {
        let h = harness();
        let user = registered(&h, "ada", "ada@example.com").await;
        let first = issue_tokens(&h.st, user.id).await.unwrap();

        let second = refresh_tokens(&h.st, Some(first.refresh_token.clone()))
            .await
            .expect("refresh");
        assert_ne!(second.refresh_token, first.refresh_token);

        let err = refresh_tokens(&h.st, Some(first.refresh_token)).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(ref m) if m == "Refresh token is expired or used"));

        let err = refresh_tokens(&h.st, Some(second.access_token)).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(ref m) if m == "Invalid refresh token"));

        let err = refresh_tokens(&h.st, None).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized(ref m) if m == "Unauthorized request"));
    }

    #[tokio::test]
    async fn current_user_is_sanitized() {
        let h = harness();
        let user = registered(&h, "ada", "ada@example.com").await;
        assert_eq!(current_user(&h.st, user.id).await.unwrap(), user);
        assert!(matches!(
            current_user(&h.st, Uuid::new_v4()).await.unwrap_err(),
            ApiError::NotFound(_)
        ));
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("a@b.co"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("a b@c.d"));
    }
}
