use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

/// Gates the HTTP surface behind an API key, when one is configured. OPTIONS
/// requests (CORS preflight) always pass through untouched.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if !auth_state.config.enable_auth {
        return Ok(next.run(request).await);
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let client_ip = client_ip_from(&headers);

    if method == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let Some(expected_key) = &auth_state.config.api_key else {
        warn!("auth enabled but no API_KEY configured");
        return Err(unauthorized_response(StatusCode::INTERNAL_SERVER_ERROR));
    };

    let provided_key = match extract_key(&headers) {
        Some(key) => key,
        None => {
            warn!(path, client_ip, "missing or malformed credentials");
            return Err(unauthorized_response(StatusCode::UNAUTHORIZED));
        }
    };

    if provided_key.as_bytes().ct_eq(expected_key.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        warn!(path, client_ip, "rejected invalid api key");
        Err(unauthorized_response(StatusCode::UNAUTHORIZED))
    }
}

fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(header_value) = headers.get("x-api-key") {
        return header_value.to_str().ok().map(str::to_string);
    }
    if let Some(header_value) = headers.get("authorization") {
        let auth_str = header_value.to_str().ok()?;
        return auth_str.strip_prefix("Bearer ").map(str::to_string);
    }
    None
}

fn client_ip_from(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

fn unauthorized_response(status: StatusCode) -> Response {
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        "Internal Server Error"
    } else {
        "Unauthorized"
    };
    (status, Json(json!({"error": message}))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(key: Option<&str>) -> ApiConfig {
        ApiConfig {
            bind_address: "127.0.0.1:0".to_string(),
            api_key: key.map(str::to_string),
            enable_auth: key.is_some(),
            allowed_origins: vec![],
            subscriber_queue_capacity: 256,
        }
    }

    #[test]
    fn extract_key_prefers_x_api_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "abc".parse().unwrap());
        headers.insert("authorization", "Bearer xyz".parse().unwrap());
        assert_eq!(extract_key(&headers), Some("abc".to_string()));
    }

    #[test]
    fn extract_key_requires_bearer_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic xyz".parse().unwrap());
        assert_eq!(extract_key(&headers), None);
    }

    #[test]
    fn disabled_auth_has_no_key() {
        let cfg = config(None);
        assert!(!cfg.enable_auth);
    }
}
