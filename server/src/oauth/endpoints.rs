//! The OAuth 2.1 HTTP surface.
//!
//! Implements RFC 8414 / RFC 9728 metadata discovery, RFC 7591 dynamic
//! client registration (auto-approved), the authorization-code flow with
//! PKCE (`S256` and `plain`), token issuance, and revocation. Errors follow
//! the OAuth error body shape: `{"error": ..., "error_description": ...}`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::extract::ConnectInfo;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use sha2::Digest;
use sha2::Sha256;
use tracing::info;
use tracing::warn;

use onemcp_core::filter::scopes_to_tags;

use crate::http::AppState;
use crate::oauth::store::AUTH_CODE_TTL;
use crate::oauth::store::AuthCodeRecord;
use crate::oauth::store::AuthRequestRecord;
use crate::oauth::store::CLIENT_TTL;
use crate::oauth::store::ClientRecord;
use crate::oauth::store::FileSessionStore;
use crate::oauth::store::RecordKind;
use crate::oauth::store::SessionRecord;
use crate::oauth::store::TOKEN_TTL;
use crate::oauth::store::new_client_id;
use crate::oauth::store::new_code_id;
use crate::oauth::store::new_token_id;
use crate::session::AuthContext;

fn oauth_error(status: StatusCode, error: &str, description: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": error,
            "error_description": description.into(),
        })),
    )
        .into_response()
}

fn server_error(description: impl Into<String>) -> Response {
    oauth_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "server_error",
        description,
    )
}

fn rate_limited(state: &AppState, addr: &SocketAddr, endpoint: &'static str) -> Option<Response> {
    if state.rate_limiter.check(addr.ip(), endpoint) {
        None
    } else {
        warn!("rate limit hit for {endpoint} from {}", addr.ip());
        Some(oauth_error(
            StatusCode::TOO_MANY_REQUESTS,
            "invalid_request",
            "rate limit exceeded, try again later",
        ))
    }
}

fn store(state: &AppState) -> Result<&Arc<FileSessionStore>, Response> {
    state
        .proxy
        .oauth_store
        .as_ref()
        .ok_or_else(|| server_error("OAuth is not enabled"))
}

fn base_url(state: &AppState) -> String {
    state.proxy.public_url.trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Metadata discovery
// ---------------------------------------------------------------------------

/// RFC 8414 authorization-server metadata.
pub async fn authorization_server_metadata(State(state): State<AppState>) -> Json<Value> {
    let base = base_url(&state);
    Json(json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "registration_endpoint": format!("{base}/register"),
        "revocation_endpoint": format!("{base}/revoke"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code"],
        "code_challenge_methods_supported": ["S256", "plain"],
        "token_endpoint_auth_methods_supported": ["none"],
    }))
}

/// RFC 9728 protected-resource metadata.
pub async fn protected_resource_metadata(State(state): State<AppState>) -> Json<Value> {
    let base = base_url(&state);
    Json(json!({
        "resource": format!("{base}/mcp"),
        "authorization_servers": [base],
        "bearer_methods_supported": ["header"],
    }))
}

// ---------------------------------------------------------------------------
// Dynamic client registration (RFC 7591)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub client_name: Option<String>,
}

/// Registrations are auto-approved: every request yields a fresh
/// `client-<uuid>`.
pub async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Option<Json<RegisterRequest>>,
) -> Response {
    if let Some(response) = rate_limited(&state, &addr, "register") {
        return response;
    }
    let store = match store(&state) {
        Ok(store) => store,
        Err(response) => return response,
    };

    let request = body.map(|Json(request)| request).unwrap_or_default();
    let now = Utc::now();
    let record = ClientRecord {
        client_id: new_client_id(),
        client_name: request.client_name,
        redirect_uris: request.redirect_uris,
        created_at: now,
        expires_at: now + CLIENT_TTL,
    };
    if let Err(err) = store
        .put(RecordKind::Client, &record.client_id, &record)
        .await
    {
        return server_error(format!("failed to persist client: {err}"));
    }

    info!("registered OAuth client {}", record.client_id);
    (
        StatusCode::CREATED,
        Json(json!({
            "client_id": record.client_id,
            "client_name": record.client_name,
            "redirect_uris": record.redirect_uris,
            "client_id_issued_at": record.created_at.timestamp(),
            "token_endpoint_auth_method": "none",
        })),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Authorization endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub resource: Option<String>,
}

/// Validates the request, stages a consent record, and (consent being
/// auto-approved) redirects back with a one-shot code.
pub async fn authorize(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    if let Some(response) = rate_limited(&state, &addr, "authorize") {
        return response;
    }
    let store = match store(&state) {
        Ok(store) => store,
        Err(response) => return response,
    };

    if query.response_type.as_deref() != Some("code") {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "response_type must be `code`",
        );
    }
    let Some(client_id) = query.client_id else {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "client_id is required",
        );
    };
    let client: ClientRecord = match store.get(RecordKind::Client, &client_id) {
        Ok(Some(client)) => client,
        Ok(None) => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                format!("unknown client `{client_id}`"),
            );
        }
        Err(err) => return server_error(err.to_string()),
    };

    let redirect_uri = match resolve_redirect_uri(&client, query.redirect_uri) {
        Ok(uri) => uri,
        Err(description) => {
            return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", description);
        }
    };

    if let Some(method) = query.code_challenge_method.as_deref()
        && method != "S256"
        && method != "plain"
    {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "code_challenge_method must be S256 or plain",
        );
    }

    let scopes: Vec<String> = query
        .scope
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();

    let now = Utc::now();
    let code = new_code_id();
    let staged = AuthRequestRecord {
        code: code.clone(),
        client_id: client.client_id.clone(),
        redirect_uri: redirect_uri.clone(),
        code_challenge: query.code_challenge.clone(),
        code_challenge_method: query.code_challenge_method.clone(),
        resource: query.resource.clone(),
        scopes: scopes.clone(),
        state: query.state.clone(),
        created_at: now,
        expires_at: now + AUTH_CODE_TTL,
    };
    if let Err(err) = store.put(RecordKind::AuthRequest, &code, &staged).await {
        return server_error(format!("failed to stage consent: {err}"));
    }

    // Consent is auto-approved: promote the staged request into a one-shot
    // authorization code immediately.
    let grant = AuthCodeRecord {
        code: code.clone(),
        client_id: staged.client_id,
        redirect_uri: staged.redirect_uri,
        code_challenge: staged.code_challenge,
        code_challenge_method: staged.code_challenge_method,
        resource: staged.resource,
        scopes: staged.scopes,
        created_at: now,
        expires_at: now + AUTH_CODE_TTL,
    };
    if let Err(err) = store.put(RecordKind::AuthCode, &code, &grant).await {
        return server_error(format!("failed to persist code: {err}"));
    }
    let _ = store.delete(RecordKind::AuthRequest, &code).await;

    let mut location = format!(
        "{redirect_uri}{}code={}",
        if redirect_uri.contains('?') { "&" } else { "?" },
        urlencoding::encode(&code),
    );
    if let Some(state_param) = &query.state {
        location.push_str("&state=");
        location.push_str(&urlencoding::encode(state_param));
    }

    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn resolve_redirect_uri(
    client: &ClientRecord,
    requested: Option<String>,
) -> Result<String, String> {
    match requested {
        Some(uri) => {
            if !client.redirect_uris.is_empty() && !client.redirect_uris.contains(&uri) {
                return Err(format!("redirect_uri `{uri}` is not registered"));
            }
            Ok(uri)
        }
        None => match client.redirect_uris.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err("redirect_uri is required".to_string()),
        },
    }
}

// ---------------------------------------------------------------------------
// Token endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub resource: Option<String>,
}

pub async fn token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::Form(form): axum::extract::Form<TokenForm>,
) -> Response {
    if let Some(response) = rate_limited(&state, &addr, "token") {
        return response;
    }
    let store = match store(&state) {
        Ok(store) => store,
        Err(response) => return response,
    };

    if form.grant_type.as_deref() != Some("authorization_code") {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "grant_type must be `authorization_code`",
        );
    }
    let Some(code) = form.code else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "code is required");
    };

    // One-shot: read the code, then burn it before any further validation so
    // a second exchange (or a failed one) can never succeed.
    let grant: AuthCodeRecord = match store.get(RecordKind::AuthCode, &code) {
        Ok(Some(grant)) => grant,
        Ok(None) => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                "invalid_grant",
                "authorization code is invalid or expired",
            );
        }
        Err(err) => return server_error(err.to_string()),
    };
    if let Err(err) = store.delete(RecordKind::AuthCode, &code).await {
        return server_error(err.to_string());
    }

    if form.client_id.as_deref() != Some(grant.client_id.as_str()) {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "client_id does not match the authorization code",
        );
    }
    if let Some(redirect_uri) = &form.redirect_uri
        && redirect_uri != &grant.redirect_uri
    {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "redirect_uri does not match the authorization code",
        );
    }
    if grant.resource.is_some() && form.resource != grant.resource {
        return oauth_error(
            StatusCode::BAD_REQUEST,
            "invalid_grant",
            "resource does not match the authorization code",
        );
    }
    if let Err(description) = verify_pkce(
        grant.code_challenge.as_deref(),
        grant.code_challenge_method.as_deref(),
        form.code_verifier.as_deref(),
    ) {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_grant", description);
    }

    let now = Utc::now();
    let record = SessionRecord {
        token: new_token_id(),
        client_id: grant.client_id,
        resource: grant.resource,
        scopes: grant.scopes,
        created_at: now,
        expires_at: now + TOKEN_TTL,
    };
    if let Err(err) = store
        .put(RecordKind::Session, &record.token, &record)
        .await
    {
        return server_error(format!("failed to persist session: {err}"));
    }

    Json(json!({
        "access_token": record.token,
        "token_type": "Bearer",
        "expires_in": TOKEN_TTL.as_secs(),
        "scope": record.scopes.join(" "),
    }))
    .into_response()
}

pub fn verify_pkce(
    challenge: Option<&str>,
    method: Option<&str>,
    verifier: Option<&str>,
) -> Result<(), String> {
    let Some(challenge) = challenge else {
        return Ok(());
    };
    let Some(verifier) = verifier else {
        return Err("code_verifier is required".to_string());
    };
    let derived = match method.unwrap_or("plain") {
        "S256" => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
        "plain" => verifier.to_string(),
        other => return Err(format!("unsupported code_challenge_method `{other}`")),
    };
    if derived == challenge {
        Ok(())
    } else {
        Err("code_verifier does not match the challenge".to_string())
    }
}

// ---------------------------------------------------------------------------
// Revocation
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RevokeForm {
    pub token: Option<String>,
}

pub async fn revoke(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    axum::extract::Form(form): axum::extract::Form<RevokeForm>,
) -> Response {
    if let Some(response) = rate_limited(&state, &addr, "revoke") {
        return response;
    }
    let store = match store(&state) {
        Ok(store) => store,
        Err(response) => return response,
    };
    let Some(token) = form.token else {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_request", "token is required");
    };
    match store.delete(RecordKind::Session, &token).await {
        // Per RFC 7009, revoking an unknown token is still a success.
        Ok(_) => Json(json!({})).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Bearer validation (inbound middleware)
// ---------------------------------------------------------------------------

/// Validate the `Authorization: Bearer` header against the session store and
/// build the session's auth context.
pub fn validate_bearer(
    store: &FileSessionStore,
    headers: &HeaderMap,
) -> Result<AuthContext, Response> {
    let unauthorized = |description: &str| {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer error=\"invalid_token\"")],
            Json(json!({
                "error": "invalid_token",
                "error_description": description,
            })),
        )
            .into_response()
    };

    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| unauthorized("missing Authorization header"))?;
    let token = header_value
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized("Authorization header must use the Bearer scheme"))?;

    let record: SessionRecord = store
        .get(RecordKind::Session, token)
        .ok()
        .flatten()
        .ok_or_else(|| unauthorized("token is invalid or expired"))?;

    Ok(AuthContext {
        client_id: record.client_id,
        granted_tags: scopes_to_tags(&record.scopes),
        scopes: record.scopes,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pkce_s256_round_trip() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(
            verify_pkce(Some(&challenge), Some("S256"), Some(verifier)),
            Ok(())
        );
        assert!(verify_pkce(Some(&challenge), Some("S256"), Some("wrong")).is_err());
    }

    #[test]
    fn pkce_plain_compares_directly() {
        assert_eq!(verify_pkce(Some("abc"), Some("plain"), Some("abc")), Ok(()));
        assert_eq!(verify_pkce(Some("abc"), None, Some("abc")), Ok(()));
        assert!(verify_pkce(Some("abc"), Some("plain"), Some("xyz")).is_err());
    }

    #[test]
    fn pkce_without_challenge_is_a_no_op() {
        assert_eq!(verify_pkce(None, None, None), Ok(()));
    }

    #[test]
    fn pkce_challenge_requires_a_verifier() {
        assert!(verify_pkce(Some("abc"), Some("plain"), None).is_err());
    }

    #[test]
    fn redirect_uri_resolution_enforces_registration() {
        let client = ClientRecord {
            client_id: "client-x".to_string(),
            client_name: None,
            redirect_uris: vec!["http://a".to_string()],
            created_at: Utc::now(),
            expires_at: Utc::now() + CLIENT_TTL,
        };
        assert_eq!(
            resolve_redirect_uri(&client, Some("http://a".to_string())),
            Ok("http://a".to_string())
        );
        assert!(resolve_redirect_uri(&client, Some("http://evil".to_string())).is_err());
        // A single registered URI is used as the default.
        assert_eq!(
            resolve_redirect_uri(&client, None),
            Ok("http://a".to_string())
        );
    }
}
