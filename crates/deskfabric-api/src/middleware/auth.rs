//! JWT Authentication Middleware
//!
//! Validates the caller's access token and makes the user available to
//! handlers via Axum's Extension. Browsers cannot set headers on a WebSocket
//! handshake, so the token may also arrive as a `token` query parameter.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use deskfabric_auth::{JwtError, JwtValidator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::models::ErrorResponse;

/// Authenticated user context extracted from JWT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// User role (admin, user)
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// JWT validation state shared across middleware instances
#[derive(Clone)]
pub struct JwtState {
    pub validator: Arc<JwtValidator>,
}

impl JwtState {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            validator: Arc::new(JwtValidator::new(secret)),
        }
    }
}

type AuthRejection = (StatusCode, Json<ErrorResponse>);

fn unauthorized(error: impl Into<String>, code: &str) -> AuthRejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new(error, code)),
    )
}

fn query_token(request: &Request) -> Option<String> {
    request.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    })
}

/// Authentication middleware for protected routes
///
/// Token lookup order: `Authorization: Bearer <token>` header, then the
/// `token` query parameter. Refresh tokens are rejected.
pub async fn require_auth(
    State(state): State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthRejection> {
    let token = match request.headers().get(header::AUTHORIZATION) {
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::to_string)
            .ok_or_else(|| {
                unauthorized(
                    "Invalid Authorization header format. Expected 'Bearer <token>'",
                    "INVALID_AUTH_FORMAT",
                )
            })?,
        None => query_token(&request).ok_or_else(|| {
            unauthorized(
                "Missing authentication token (Authorization header or token query parameter)",
                "MISSING_AUTH",
            )
        })?,
    };

    let claims = state.validator.validate_access(&token).map_err(|e| {
        debug!("Rejected token: {}", e);
        match e {
            JwtError::WrongTokenType => {
                unauthorized("Expected an access token", "INVALID_TOKEN_TYPE")
            }
            e => unauthorized(format!("Invalid or expired token: {}", e), "INVALID_TOKEN"),
        }
    })?;

    if claims.user_id.is_empty() {
        return Err(unauthorized(
            "Token missing 'user_id' claim",
            "MISSING_USER_ID",
        ));
    }

    request.extensions_mut().insert(AuthUser {
        user_id: claims.user_id,
        username: claims.username,
        role: claims.role,
    });

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, middleware, routing::get, Router};
    use chrono::Duration;
    use deskfabric_auth::{JwtClaims, TokenType};
    use tower::ServiceExt;

    const SECRET: &[u8] = b"test-secret-key";

    async fn protected_handler(axum::Extension(user): axum::Extension<AuthUser>) -> Json<AuthUser> {
        Json(user)
    }

    fn create_test_app() -> Router {
        let jwt_state = Arc::new(JwtState::new(SECRET));

        Router::new()
            .route("/protected", get(protected_handler))
            .layer(middleware::from_fn_with_state(jwt_state.clone(), require_auth))
            .with_state(jwt_state)
    }

    fn token(claims: JwtClaims) -> String {
        JwtValidator::encode(SECRET, &claims).unwrap()
    }

    fn access_claims(user_id: &str) -> JwtClaims {
        JwtClaims::new(
            user_id.to_string(),
            "deskfabric".to_string(),
            Duration::hours(1),
        )
    }

    async fn error_body(response: Response) -> ErrorResponse {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_valid_bearer_token() {
        let app = create_test_app();
        let token = token(
            access_claims("user-123")
                .with_role("admin".to_string())
                .with_username("alice".to_string()),
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let user: AuthUser = serde_json::from_slice(&body).unwrap();
        assert_eq!(user.user_id, "user-123");
        assert_eq!(user.username.as_deref(), Some("alice"));
        assert!(user.is_admin());
    }

    #[tokio::test]
    async fn test_token_query_parameter() {
        let app = create_test_app();
        let token = token(access_claims("user-123"));

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/protected?foo=bar&token={}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_body(response).await.code.as_deref(), Some("MISSING_AUTH"));
    }

    #[tokio::test]
    async fn test_invalid_bearer_format() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("Authorization", "Token abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            error_body(response).await.code.as_deref(),
            Some("INVALID_AUTH_FORMAT")
        );
    }

    #[tokio::test]
    async fn test_expired_token() {
        let app = create_test_app();
        let claims = JwtClaims::new(
            "user-123".to_string(),
            "deskfabric".to_string(),
            Duration::seconds(-10),
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {}", token(claims)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let error = error_body(response).await;
        assert_eq!(error.code.as_deref(), Some("INVALID_TOKEN"));
        assert!(error.error.contains("Invalid or expired token"));
    }

    #[tokio::test]
    async fn test_wrong_secret() {
        let app = create_test_app();
        let forged = JwtValidator::encode(b"another-secret", &access_claims("user-123")).unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {}", forged))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_refresh_token_rejected() {
        let app = create_test_app();
        let refresh = token(access_claims("user-123").with_token_type(TokenType::Refresh));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {}", refresh))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            error_body(response).await.code.as_deref(),
            Some("INVALID_TOKEN_TYPE")
        );
    }

    #[tokio::test]
    async fn test_empty_user_id_rejected() {
        let app = create_test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("Authorization", format!("Bearer {}", token(access_claims(""))))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            error_body(response).await.code.as_deref(),
            Some("MISSING_USER_ID")
        );
    }
}
