use std::time::Duration;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use userfront_core::User;
use uuid::Uuid;

use crate::config::PaginationSettings;
use crate::middleware::RequestId;
use crate::service::{RequestContext, ServiceError, UserService};

pub const NEXT_CURSOR_HEADER: &str = "x-nextcursor";
pub const PREV_CURSOR_HEADER: &str = "x-prevcursor";

#[derive(Clone)]
pub struct AppState {
    pub service: UserService,
    pub request_timeout: Duration,
    pub readiness_timeout: Duration,
    pub pagination: PaginationSettings,
}

impl AppState {
    fn context(&self, request_id: RequestId) -> RequestContext {
        RequestContext::new(self.request_timeout).with_correlation_id(request_id.0)
    }
}

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

#[derive(Serialize)]
pub struct ReadinessResponse<'a> {
    status: &'a str,
    storage: &'a str,
    cache: &'a str,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    correlation_id: Uuid,
}

/// User as rendered to clients. Password material stays server-side.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserView {
    pub id: i64,
    pub nickname: String,
    pub firstname: String,
    pub lastname: String,
    pub gender: String,
    pub status: i16,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            nickname: user.nickname,
            firstname: user.first_name,
            lastname: user.last_name,
            gender: user.gender,
            status: user.status,
        }
    }
}

/// A failed request together with the id the client can quote to support.
#[derive(Debug)]
pub struct ApiError {
    error: ServiceError,
    correlation_id: Uuid,
}

impl ApiError {
    pub fn new(error: ServiceError, correlation_id: Uuid) -> Self {
        Self {
            error,
            correlation_id,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let detail;
        let message = if status.is_server_error() {
            tracing::warn!(
                correlation_id = %self.correlation_id,
                error = %self.error,
                kind = self.error.kind(),
                "request failed"
            );
            match self.error {
                ServiceError::Unavailable { .. } => "service temporarily unavailable",
                ServiceError::DeadlineExceeded => "request timed out",
                _ => "internal server error",
            }
        } else {
            detail = self.error.to_string();
            detail.as_str()
        };
        let body = ErrorBody {
            error: message,
            correlation_id: self.correlation_id,
        };
        (status, Json(body)).into_response()
    }
}

fn rejected(message: String, request_id: RequestId) -> ApiError {
    ApiError::new(ServiceError::Invalid(message), request_id.0)
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub nickname: Option<String>,
}

fn parse_limit(raw: Option<&str>, pagination: &PaginationSettings) -> Result<i64, String> {
    let raw = raw.map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return Ok(pagination.default_limit);
    }
    let limit: i64 = raw
        .parse()
        .map_err(|_| format!("limit must be an integer, got '{raw}'"))?;
    Ok(if limit <= 0 {
        pagination.default_limit
    } else {
        limit.min(pagination.max_limit)
    })
}

fn parse_cursor(headers: &HeaderMap) -> Result<i64, String> {
    let Some(value) = headers.get(NEXT_CURSOR_HEADER) else {
        return Ok(0);
    };
    let raw = value
        .to_str()
        .map_err(|_| "cursor header is not valid text".to_string())?
        .trim();
    if raw.is_empty() {
        return Ok(0);
    }
    let offset: i64 = raw
        .parse()
        .map_err(|_| format!("cursor must be an integer, got '{raw}'"))?;
    Ok(offset.max(0))
}

fn cursor_value(cursor: i64) -> HeaderValue {
    HeaderValue::from(cursor)
}

pub async fn list_users(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let limit = parse_limit(params.limit.as_deref(), &state.pagination)
        .map_err(|m| rejected(m, request_id))?;
    let offset = parse_cursor(&headers).map_err(|m| rejected(m, request_id))?;

    let ctx = state.context(request_id);
    let page = state
        .service
        .find_all(&ctx, limit, offset)
        .await
        .map_err(|e| ApiError::new(e, ctx.correlation_id))?;

    let mut res = Json(page.users.into_iter().map(UserView::from).collect::<Vec<_>>())
        .into_response();
    res.headers_mut()
        .insert(NEXT_CURSOR_HEADER, cursor_value(page.next_cursor));
    res.headers_mut()
        .insert(PREV_CURSOR_HEADER, cursor_value(page.prev_cursor));
    Ok(res)
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<Json<UserView>, ApiError> {
    let ctx = state.context(request_id);
    let user = state
        .service
        .find_by_id(&ctx, &id)
        .await
        .map_err(|e| ApiError::new(e, ctx.correlation_id))?;
    Ok(Json(user.into()))
}

pub async fn search_user(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Query(params): Query<SearchParams>,
) -> Result<Json<UserView>, ApiError> {
    let nickname = params
        .nickname
        .ok_or_else(|| rejected("nickname query parameter is required".into(), request_id))?;
    let ctx = state.context(request_id);
    let user = state
        .service
        .find_by_nickname(&ctx, &nickname)
        .await
        .map_err(|e| ApiError::new(e, ctx.correlation_id))?;
    Ok(Json(user.into()))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Json(user): Json<User>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = state.context(request_id);
    let created = state
        .service
        .create(&ctx, user)
        .await
        .map_err(|e| ApiError::new(e, ctx.correlation_id))?;
    let location = HeaderValue::from_str(&format!("/user/{}", created.id))
        .unwrap_or_else(|_| HeaderValue::from_static("/user"));
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, location)],
        Json(UserView::from(created)),
    ))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
    Json(user): Json<User>,
) -> Result<Json<UserView>, ApiError> {
    let ctx = state.context(request_id);
    let updated = state
        .service
        .update(&ctx, &id, user)
        .await
        .map_err(|e| ApiError::new(e, ctx.correlation_id))?;
    Ok(Json(updated.into()))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let ctx = state.context(request_id);
    state
        .service
        .delete(&ctx, &id)
        .await
        .map_err(|e| ApiError::new(e, ctx.correlation_id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Pings both backends. Either failing makes the instance not ready.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let limit = state.readiness_timeout;
    let storage = state.service.storage();
    let cache = state.service.cache();

    let (storage_result, cache_result) = tokio::join!(
        tokio::time::timeout(limit, storage.ping()),
        tokio::time::timeout(limit, cache.ping()),
    );

    let storage_ok = match storage_result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(backend = storage.backend_name(), error = %e, "readiness: storage ping failed");
            false
        }
        Err(_) => {
            tracing::warn!(backend = storage.backend_name(), "readiness: storage ping timed out");
            false
        }
    };
    let cache_ok = match cache_result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(backend = cache.backend_name(), error = %e, "readiness: cache ping failed");
            false
        }
        Err(_) => {
            tracing::warn!(backend = cache.backend_name(), "readiness: cache ping timed out");
            false
        }
    };

    let label = |ok: bool| if ok { "ok" } else { "unavailable" };
    let ready = storage_ok && cache_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "not_ready" },
            storage: label(storage_ok),
            cache: label(cache_ok),
        }),
    )
}

pub async fn metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
