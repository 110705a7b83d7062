use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use loft_domain::OwnerId;

/// Header carrying the principal that the external authentication layer
/// verified. Token verification itself lives outside the core; anything
/// reaching this process without a verified principal is refused.
pub const PRINCIPAL_HEADER: &str = "x-loft-principal";

/// The verified caller, injected into request extensions by the middleware.
#[derive(Debug, Clone)]
pub struct Principal(pub OwnerId);

/// Axum middleware requiring a non-empty verified-principal header.
/// Applied to all routes, the event socket included — no anonymous access.
pub async fn require_principal(mut request: Request, next: Next) -> Response {
    let principal = request
        .headers()
        .get(PRINCIPAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    match principal {
        Some(owner) => {
            let principal = Principal(OwnerId::new(owner));
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        None => (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response(),
    }
}
