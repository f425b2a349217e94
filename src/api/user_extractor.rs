use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};
use crate::model::UserContext;

/// Axum extractor for UserContext from request headers
///
/// The surrounding application authenticates the caller and forwards:
/// - X-User-Id: Required user identifier
/// - X-User-Email: Optional user email
/// - X-User-Name: Optional user display name
///
/// Requests without `X-User-Id` are rejected with 401.
#[async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;

        let user_id = extract_header_value(headers, "x-user-id").ok_or(StatusCode::UNAUTHORIZED)?;
        let user_email = extract_header_value(headers, "x-user-email");
        let user_name = extract_header_value(headers, "x-user-name");

        Ok(UserContext::with_details(user_id, user_email, user_name))
    }
}

/// Extract a non-empty header value as string
fn extract_header_value(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
