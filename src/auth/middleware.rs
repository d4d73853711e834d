//! Authentication extractors
//!
//! Protects routes that require a session and resolves which owner a
//! request acts for.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, request::Parts},
};
use axum_extra::extract::CookieJar;

use super::session::{SESSION_COOKIE, Session, verify_session_token};
use crate::AppState;
use crate::data::Owner;
use crate::error::AppError;

fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(ToOwned::to_owned)
        .or_else(|| {
            let jar = CookieJar::from_headers(headers);
            jar.get(SESSION_COOKIE).map(|cookie| cookie.value().to_owned())
        })
}

/// Extractor for the current authenticated session
///
/// # Usage
/// ```ignore
/// async fn handler(CurrentUser(session): CurrentUser) -> impl IntoResponse {
///     format!("Hello, {}", session.user_id)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Session);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(session) = parts.extensions.get::<Session>().cloned() {
            return Ok(CurrentUser(session));
        }

        let state = AppState::from_ref(state);
        let token = extract_token_from_headers(&parts.headers).ok_or(AppError::Unauthorized)?;
        let session = verify_session_token(&token, &state.config.auth.session_secret)?;
        parts.extensions.insert(session.clone());

        Ok(CurrentUser(session))
    }
}

/// Session plus the owner selected by `?owner=user|company`
#[derive(Debug, Clone)]
pub struct CurrentOwner {
    pub session: Session,
    pub owner: Owner,
}

fn owner_param(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "owner")
        .map(|(_, value)| value.into_owned())
}

#[async_trait]
impl<S> FromRequestParts<S> for CurrentOwner
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentUser(session) = CurrentUser::from_request_parts(parts, state).await?;
        let owner = session.owner(owner_param(parts).as_deref())?;
        Ok(CurrentOwner { session, owner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn bearer_header_wins_over_cookie() {
        let request = Request::builder()
            .header("Authorization", "Bearer from-header")
            .header("Cookie", "session=from-cookie")
            .body(())
            .unwrap();
        assert_eq!(
            extract_token_from_headers(request.headers()).as_deref(),
            Some("from-header")
        );

        let request = Request::builder()
            .header("Cookie", "theme=dark; session=from-cookie")
            .body(())
            .unwrap();
        assert_eq!(
            extract_token_from_headers(request.headers()).as_deref(),
            Some("from-cookie")
        );
    }

    #[test]
    fn reads_owner_from_query() {
        let (parts, _) = Request::builder()
            .uri("/conversations?limit=5&owner=company")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(owner_param(&parts).as_deref(), Some("company"));

        let (parts, _) = Request::builder().uri("/conversations").body(()).unwrap().into_parts();
        assert_eq!(owner_param(&parts), None);
    }
}
