use std::path::Path;

use axum::{
    extract::{
        multipart::{Field, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use tracing::{instrument, warn};

use crate::{
    auth::{
        cookies::{self, REFRESH_COOKIE},
        extractors::AuthUser,
    },
    error::{ApiError, ApiResponse, ApiResult},
    state::AppState,
    uploads::UploadedFile,
    users::{
        dto::{Empty, LoginRequest, LoginResponse, RefreshRequest, RegisterInput, TokenPair},
        repo_types::PublicUser,
        services,
    },
};

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/users/register",
            post(register).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/users/login", post(login))
        .route("/users/logout", post(logout))
        .route("/users/refresh-token", post(refresh_token))
        .route("/users/current-user", get(current_user))
}

/// POST /users/register (multipart: fullName, email, username, password, avatar, coverImage?)
#[instrument(skip(state, mp))]
pub async fn register(
    State(state): State<AppState>,
    mp: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<PublicUser>>)> {
    let mp = mp?;
    let input = read_register_form(Path::new(&state.config.upload_tmp_dir), mp).await?;
    let user = services::register_user(&state, input).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::new(
            StatusCode::CREATED,
            user,
            "User registered successfully",
        )),
    ))
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<(CookieJar, Json<ApiResponse<LoginResponse>>)> {
    let Json(req) = body?;
    let res = services::login_user(&state, req).await?;
    let jar = cookies::set_session(
        jar,
        &res.access_token,
        &res.refresh_token,
        state.config.cookie_secure,
    );
    Ok((
        jar,
        Json(ApiResponse::new(
            StatusCode::OK,
            res,
            "User logged in successfully",
        )),
    ))
}

#[instrument(skip(state, jar))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    jar: CookieJar,
) -> ApiResult<(CookieJar, Json<ApiResponse<Empty>>)> {
    services::logout_user(&state, user_id).await?;
    let jar = cookies::clear_session(jar, state.config.cookie_secure);
    Ok((
        jar,
        Json(ApiResponse::new(StatusCode::OK, Empty {}, "User logged out")),
    ))
}

#[instrument(skip_all)]
pub async fn refresh_token(
    State(state): State<AppState>,
    jar: CookieJar,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> ApiResult<(CookieJar, Json<ApiResponse<TokenPair>>)> {
    let from_cookie = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty());

    // The body is optional when the cookie is present or no JSON was sent at all.
    let incoming = match (from_cookie, body) {
        (Some(token), _) => Some(token),
        (None, Ok(Json(b))) => b.refresh_token,
        (None, Err(JsonRejection::MissingJsonContentType(_))) => None,
        (None, Err(rejection)) => return Err(rejection.into()),
    };

    let tokens = services::refresh_tokens(&state, incoming).await?;
    let jar = cookies::set_session(
        jar,
        &tokens.access_token,
        &tokens.refresh_token,
        state.config.cookie_secure,
    );
    Ok((
        jar,
        Json(ApiResponse::new(StatusCode::OK, tokens, "Access token refreshed")),
    ))
}

#[instrument(skip(state))]
pub async fn current_user(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> ApiResult<Json<ApiResponse<PublicUser>>> {
    let user = services::current_user(&state, user_id).await?;
    Ok(Json(ApiResponse::new(
        StatusCode::OK,
        user,
        "Current user fetched successfully",
    )))
}

/// Reads the registration form, spooling the first `avatar` and `coverImage` files to `dir`.
async fn read_register_form(dir: &Path, mut mp: Multipart) -> ApiResult<RegisterInput> {
    let mut input = RegisterInput::default();
    let result = read_fields(dir, &mut mp, &mut input).await;
    if result.is_err() {
        for file in input.avatar.iter().chain(input.cover_image.iter()) {
            file.discard().await;
        }
    }
    result.map(|()| input)
}

async fn read_fields(dir: &Path, mp: &mut Multipart, input: &mut RegisterInput) -> ApiResult<()> {
    while let Some(field) = mp.next_field().await.map_err(bad_multipart)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "fullName" => input.full_name = Some(field.text().await.map_err(bad_multipart)?),
            "email" => input.email = Some(field.text().await.map_err(bad_multipart)?),
            "username" => input.username = Some(field.text().await.map_err(bad_multipart)?),
            "password" => input.password = Some(field.text().await.map_err(bad_multipart)?),
            "avatar" if input.avatar.is_none() => input.avatar = spool(dir, field).await?,
            "coverImage" if input.cover_image.is_none() => {
                input.cover_image = spool(dir, field).await?
            }
            _ => {}
        }
    }
    Ok(())
}

/// `None` for an empty file part, which browsers send when no file was chosen.
async fn spool(dir: &Path, field: Field<'_>) -> ApiResult<Option<UploadedFile>> {
    let file_name = field.file_name().map(str::to_string);
    let content_type = field
        .content_type()
        .map(str::to_string)
        .unwrap_or_else(|| "application/octet-stream".into());
    let body = field.bytes().await.map_err(bad_multipart)?;
    if body.is_empty() {
        return Ok(None);
    }

    let file = UploadedFile::persist(dir, file_name.as_deref(), &content_type, body)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "spooling upload failed");
            ApiError::internal("Internal server error")
        })?;
    Ok(Some(file))
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> ApiError {
    warn!(error = %e, "malformed multipart body");
    ApiError::bad_request("Invalid multipart body")
}
