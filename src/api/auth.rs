//! HTTP Basic authentication for the control plane.
//!
//! Credentials come from `HQ_ADMIN_USERNAME` / `HQ_ADMIN_PASSWORD`
//! (defaults `admin` / `admin`) and are compared in constant time.

use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use subtle::ConstantTimeEq;

const USERNAME_ENV: &str = "HQ_ADMIN_USERNAME";
const PASSWORD_ENV: &str = "HQ_ADMIN_PASSWORD";
const DEFAULT_USERNAME: &str = "admin";
const DEFAULT_PASSWORD: &str = "admin";

pub async fn basic_auth(request: Request, next: Next) -> Response {
    if authorized(request.headers()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"homeworq\""),
            )],
        )
            .into_response()
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = BASE64.decode(encoded) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((username, password)) = credentials.split_once(':') else {
        return false;
    };

    let expected_username =
        std::env::var(USERNAME_ENV).unwrap_or_else(|_| DEFAULT_USERNAME.to_string());
    let expected_password =
        std::env::var(PASSWORD_ENV).unwrap_or_else(|_| DEFAULT_PASSWORD.to_string());

    // Evaluate both comparisons to keep timing independent of which
    // credential mismatched.
    let username_ok = username.as_bytes().ct_eq(expected_username.as_bytes());
    let password_ok = password.as_bytes().ct_eq(expected_password.as_bytes());
    bool::from(username_ok & password_ok)
}
