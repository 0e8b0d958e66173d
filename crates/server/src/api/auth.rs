use axum::extract::{Request as HttpRequest, State};
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;
use conduit_core::{Credential, Payload, Request};

use super::AppState;
use crate::error::ServerError;

/// Operation checked against the caller's permissions on admin routes.
/// Only `*` or `admin:*` grants it.
pub const ADMIN_OPERATION: &str = "admin.api";

const API_KEY_HEADER: &str = "x-api-key";

/// Read the caller's credential: `x-api-key` wins over `Authorization: Bearer`.
pub fn credential_from(headers: &HeaderMap) -> Option<Credential> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(Credential::ApiKey(key.trim().to_owned()));
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| Credential::Bearer(token.trim().to_owned()))
}

/// Reject callers without the admin permission. A no-op when auth is
/// disabled.
pub async fn require_admin(
    State(state): State<AppState>,
    request: HttpRequest,
    next: Next,
) -> Result<Response, ServerError> {
    let auth = state.runtime.gateway().auth();
    if auth.is_enabled() {
        let mut probe = Request::new("admin-api", ADMIN_OPERATION, Payload::default());
        if let Some(credential) = credential_from(request.headers()) {
            probe = probe.with_credential(credential);
        }
        let context = auth.authenticate(&probe)?;
        auth.authorize(&context, ADMIN_OPERATION)?;
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn api_key_header_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(credential_from(&headers), Some(Credential::Bearer("tok".into())));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("k-1"));
        assert_eq!(credential_from(&headers), Some(Credential::ApiKey("k-1".into())));
    }

    #[test]
    fn non_bearer_authorization_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(credential_from(&headers), None);
    }
}
