// =============================================================================
// Bearer Token Authentication — Axum extractor backed by the users table
// =============================================================================
//
// `Authorization: Bearer <token>` resolves to an active user row; the token
// lives in an indexed unique column, and route authorization then walks the
// ownership chain (resource → strategy account → strategy → user).
//
// Usage:
//
//   async fn handler(AuthUser(user): AuthUser, ...) { ... }
//
// Missing or unknown tokens short-circuit with 401 before the handler runs.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::app_state::AppState;
use crate::db::UserRow;

/// Extractor yielding the authenticated user.
pub struct AuthUser(pub UserRow);

pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "error": self.message,
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        let token = match auth_header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                warn!("missing or malformed Authorization header");
                return Err(AuthRejection {
                    status: StatusCode::UNAUTHORIZED,
                    message: "Missing or invalid authorization token",
                });
            }
        };

        match state.db.user_by_api_token(token).await {
            Ok(Some(user)) => Ok(AuthUser(user)),
            Ok(None) => {
                warn!("unknown bearer token presented");
                Err(AuthRejection {
                    status: StatusCode::UNAUTHORIZED,
                    message: "Invalid authorization token",
                })
            }
            Err(e) => {
                warn!(error = %e, "user lookup failed during authentication");
                Err(AuthRejection {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "Authentication backend unavailable",
                })
            }
        }
    }
}
