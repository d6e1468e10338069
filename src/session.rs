use std::convert::Infallible;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue};

use crate::error::GatewayError;
use crate::settings::Environment;

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";

const ACCESS_MAX_AGE_SECS: u64 = 60 * 60;
const REFRESH_MAX_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Tokens issued by the auth service at login or signup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// The caller's credentials for one request, passed explicitly to every
/// backend call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    token: Option<String>,
}

impl SessionContext {
    pub fn anonymous() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let token = token.into();
        Self { token: (!token.is_empty()).then_some(token) }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        let token = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|raw| cookie_value(raw, ACCESS_COOKIE));
        Self { token }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn require_token(&self) -> Result<&str, GatewayError> {
        self.token().ok_or(GatewayError::Unauthorized)
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for SessionContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name && !value.is_empty()).then(|| value.to_string())
    })
}

/// Cookie attributes follow the deployment environment: production cookies
/// are `Secure` and `SameSite=Strict`, development ones `SameSite=Lax`.
#[derive(Debug, Clone, Copy)]
pub struct CookiePolicy {
    secure: bool,
}

impl CookiePolicy {
    pub fn for_environment(env: Environment) -> Self {
        Self { secure: env.is_production() }
    }

    fn render(&self, name: &str, value: &str, max_age: u64) -> String {
        let same_site = if self.secure { "Strict" } else { "Lax" };
        let mut cookie = format!("{name}={value}; Path=/; HttpOnly; SameSite={same_site}; Max-Age={max_age}");
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` values that replace whatever session the browser held.
    /// A session without a refresh token expires any stale refresh cookie.
    pub fn set_session(&self, session: &AuthSession) -> Vec<String> {
        let refresh = match &session.refresh_token {
            Some(token) => self.render(REFRESH_COOKIE, token, REFRESH_MAX_AGE_SECS),
            None => self.render(REFRESH_COOKIE, "", 0),
        };
        vec![self.render(ACCESS_COOKIE, &session.access_token, ACCESS_MAX_AGE_SECS), refresh]
    }

    pub fn clear_session(&self) -> Vec<String> {
        vec![self.render(ACCESS_COOKIE, "", 0), self.render(REFRESH_COOKIE, "", 0)]
    }
}

pub fn append_set_cookies(headers: &mut HeaderMap, cookies: Vec<String>) {
    for cookie in cookies {
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            headers.append(header::SET_COOKIE, value);
        }
    }
}
