//! Bearer token guard for the admin API

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::AppState;
use crate::error::AppError;

fn extract_token_from_headers(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Constant-time comparison so response timing does not leak the token.
fn tokens_match(presented: &str, expected: &str) -> bool {
    bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

/// Middleware to require the configured API token
///
/// A no-op when `server.api_token` is unset.
///
/// # Usage
/// ```ignore
/// let protected_routes = Router::new()
///     .route("/deliveries", ...)
///     .layer(middleware::from_fn_with_state(state, require_api_token));
/// ```
pub async fn require_api_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = state.config.server.api_token.as_deref() {
        let presented =
            extract_token_from_headers(request.headers()).ok_or(AppError::Unauthorized)?;
        if !tokens_match(presented, expected) {
            tracing::debug!("Rejected admin API request with wrong token");
            return Err(AppError::Unauthorized);
        }
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_is_extracted() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer s3cret"));
        assert_eq!(extract_token_from_headers(&headers), Some("s3cret"));

        headers.insert("Authorization", HeaderValue::from_static("Basic s3cret"));
        assert_eq!(extract_token_from_headers(&headers), None);
    }

    #[test]
    fn tokens_match_requires_exact_value() {
        assert!(tokens_match("s3cret", "s3cret"));
        assert!(!tokens_match("s3cre", "s3cret"));
        assert!(!tokens_match("s3creT", "s3cret"));
        assert!(!tokens_match("s3cret-and-more", "s3cret"));
        assert!(!tokens_match("", "s3cret"));
    }
}
