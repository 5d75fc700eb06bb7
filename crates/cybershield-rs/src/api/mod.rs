use std::net::{IpAddr, SocketAddr};

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ConnectInfo, DefaultBodyLimit, FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::{
    auth::Session,
    jobs::ScanError,
    limiter::{RateLimitKey, RateLimited},
    models::{ScanJob, ScanState, ScanSummary},
    quota::UsageSnapshot,
    security::TargetError,
    AppState,
};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024;

pub fn router(state: AppState) -> Router {
    let submit = post(create_scan).layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/scans", get(list_scans).merge(submit))
        .route("/api/scans/{id}", get(get_scan))
        .route("/api/usage", get(usage))
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(state.clone(), throttle))
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(&'static str),
    /// Body or query string the extractors could not accept.
    Rejected { status: StatusCode, message: String },
    RouteNotFound,
    /// General request budget, shared by every route.
    Throttled(RateLimited),
    Scan(ScanError),
}

impl From<ScanError> for ApiError {
    fn from(err: ScanError) -> Self {
        ApiError::Scan(err)
    }
}

impl From<crate::store::StoreError> for ApiError {
    fn from(err: crate::store::StoreError) -> Self {
        ApiError::Scan(ScanError::Store(err))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Rejected {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Unauthorized(message) => {
                return error_body(StatusCode::UNAUTHORIZED, "unauthorized", message, None)
            }
            ApiError::Rejected { status, message } => {
                let reason = if status == StatusCode::PAYLOAD_TOO_LARGE {
                    "payload_too_large"
                } else {
                    "invalid_request"
                };
                return error_body(status, reason, &message, None);
            }
            ApiError::RouteNotFound => {
                return error_body(StatusCode::NOT_FOUND, "not_found", "Route not found", None)
            }
            ApiError::Throttled(limited) => {
                return too_many_requests(
                    &limited,
                    "Too many requests, please try again later.",
                )
            }
            ApiError::Scan(err) => err,
        };

        match err {
            ScanError::Validation(e) => {
                error_body(StatusCode::BAD_REQUEST, "validation", &e.to_string(), None)
            }
            ScanError::RateLimited(limited) => too_many_requests(&limited, &limited.to_string()),
            ScanError::QuotaExceeded(ref snapshot) => error_body(
                StatusCode::FORBIDDEN,
                "quota_exceeded",
                &err.to_string(),
                Some(json!({ "usage": snapshot })),
            ),
            ScanError::ScannerUnreachable => error_body(
                StatusCode::SERVICE_UNAVAILABLE,
                "scanner_unreachable",
                &err.to_string(),
                None,
            ),
            ScanError::NotFound => {
                error_body(StatusCode::NOT_FOUND, "not_found", &err.to_string(), None)
            }
            ScanError::Store(e) => {
                error!(error = %e, "request failed on storage");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error",
                    None,
                )
            }
        }
    }
}

fn too_many_requests(limited: &RateLimited, message: &str) -> Response {
    let mut resp = error_body(
        StatusCode::TOO_MANY_REQUESTS,
        "rate_limited",
        message,
        Some(json!({
            "limit": limited.limit,
            "retry_after_secs": limited.retry_after_secs,
        })),
    );
    resp.headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(limited.retry_after_secs));
    resp
}

fn error_body(
    status: StatusCode,
    reason: &str,
    message: &str,
    extra: Option<serde_json::Value>,
) -> Response {
    let mut error = json!({
        "reason": reason,
        "message": message,
        "status": status.as_u16(),
    });
    if let (Some(obj), Some(serde_json::Value::Object(extra))) = (error.as_object_mut(), extra) {
        obj.extend(extra);
    }
    (status, Json(json!({ "error": error }))).into_response()
}

/// `Json` whose rejections use the API error body.
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(ApiJson(value))
    }
}

/// `Query` whose rejections use the API error body.
pub struct ApiQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(ApiQuery(value))
    }
}

/// The authenticated caller.
pub struct CurrentUser(pub Session);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer(&parts.headers).ok_or(ApiError::Unauthorized("missing bearer"))?;
        state
            .sessions
            .get(&token)
            .await
            .map(CurrentUser)
            .ok_or(ApiError::Unauthorized("invalid token"))
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(ToString::to_string)
}

/// Owner behind a valid token, else the caller's address.
async fn caller_key(state: &AppState, token: Option<String>, addr: Option<IpAddr>) -> RateLimitKey {
    let owner_id = match token {
        Some(token) => state.sessions.get(&token).await.map(|s| s.owner_id),
        None => None,
    };
    RateLimitKey::resolve(owner_id.as_deref(), addr)
}

fn peer_ip(req: &Request) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// General request budget across every route.
pub async fn throttle(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (token, addr) = (bearer(req.headers()), peer_ip(&req));
    let key = caller_key(&state, token, addr).await;
    match state.api_limiter.check(&key).await {
        Ok(_) => next.run(req).await,
        Err(limited) => ApiError::Throttled(limited).into_response(),
    }
}

/// Hourly cap on scan submissions. Runs before authentication so
/// unauthenticated floods are still counted.
pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (token, addr) = (bearer(req.headers()), peer_ip(&req));
    let key = caller_key(&state, token, addr).await;
    match state.rate_limiter.check(&key).await {
        Ok(remaining) => {
            let mut resp = next.run(req).await;
            resp.headers_mut()
                .insert("x-ratelimit-remaining", HeaderValue::from(remaining));
            resp
        }
        Err(limited) => ApiError::from(ScanError::RateLimited(limited)).into_response(),
    }
}

pub async fn route_not_found() -> ApiError {
    ApiError::RouteNotFound
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "cybershield-rs",
        "scans_in_flight": state.orchestrator.in_flight().await,
        "limits": {
            "monthly_scans": state.quota.monthly_limit(),
            "scans_per_hour": state.rate_limiter.limit(),
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateScanRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
pub struct CreateScanResponse {
    id: Uuid,
    state: ScanState,
    message: &'static str,
}

pub async fn create_scan(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    ApiJson(payload): ApiJson<CreateScanRequest>,
) -> Result<(StatusCode, Json<CreateScanResponse>), ApiError> {
    if payload.url.trim().is_empty() {
        return Err(ScanError::Validation(TargetError::Missing).into());
    }

    let job = state
        .orchestrator
        .submit(&session.owner_id, &payload.url)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateScanResponse {
            id: job.id,
            state: job.state,
            message: "Scan initiated",
        }),
    ))
}

pub async fn get_scan(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<ScanJob>, ApiError> {
    // A malformed id is as missing as someone else's.
    let id = Uuid::parse_str(&id).map_err(|_| ScanError::NotFound)?;
    Ok(Json(state.orchestrator.get(id, &session.owner_id).await?))
}

/// Paging parameters as sent. Anything unparseable falls back to the default.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    page: Option<String>,
    limit: Option<String>,
}

fn positive_or(raw: Option<&str>, default: u32) -> u32 {
    raw.and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

#[derive(Debug, Serialize)]
pub struct Pagination {
    page: u32,
    limit: u32,
    total: u64,
    pages: u64,
}

#[derive(Debug, Serialize)]
pub struct ListScansResponse {
    scans: Vec<ScanSummary>,
    pagination: Pagination,
}

pub async fn list_scans(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> Result<Json<ListScansResponse>, ApiError> {
    let page = state
        .orchestrator
        .list(
            &session.owner_id,
            positive_or(query.page.as_deref(), 1),
            positive_or(query.limit.as_deref(), 10),
        )
        .await?;

    let pagination = Pagination {
        page: page.page,
        limit: page.limit,
        total: page.total,
        pages: page.pages(),
    };
    Ok(Json(ListScansResponse {
        scans: page.items,
        pagination,
    }))
}

pub async fn usage(
    State(state): State<AppState>,
    CurrentUser(session): CurrentUser,
) -> Result<Json<UsageSnapshot>, ApiError> {
    Ok(Json(state.quota.usage(&session.owner_id).await?))
}
