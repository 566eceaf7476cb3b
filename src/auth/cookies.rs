//! Session cookies holding the access and refresh tokens.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

pub const ACCESS_COOKIE: &str = "accessToken";
pub const REFRESH_COOKIE: &str = "refreshToken";

fn session_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path("/")
        .build()
}

/// Adds both session cookies. They are never readable from client-side scripts.
pub fn set_session(jar: CookieJar, access_token: &str, refresh_token: &str, secure: bool) -> CookieJar {
    jar.add(session_cookie(ACCESS_COOKIE, access_token.to_string(), secure))
        .add(session_cookie(REFRESH_COOKIE, refresh_token.to_string(), secure))
}

fn removal_cookie(name: &'static str, secure: bool) -> Cookie<'static> {
    let mut cookie = session_cookie(name, String::new(), secure);
    cookie.make_removal();
    cookie
}

/// Overwrites both session cookies with expired ones, whether or not the request carried them.
pub fn clear_session(jar: CookieJar, secure: bool) -> CookieJar {
    jar.add(removal_cookie(ACCESS_COOKIE, secure))
        .add(removal_cookie(REFRESH_COOKIE, secure))
}
