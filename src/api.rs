// 🌐 HTTP API - axum router over the receipt store
// Roles come from `Authorization: Bearer <password>`: the guest password grants
// read access, the developer password also unlocks processing and the failed queue.

use crate::analytics::{self, Dashboard, Filter, MonthlyAnalysis};
use crate::db::{self, SubmitOutcome};
use crate::models::{Category, Item, Receipt, ReceiptStatus, DEMO_USER_ID};
use crate::processor::{ProcessingReport, ReceiptProcessor};
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const ACTOR: &str = "api";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub processor: Arc<ReceiptProcessor>,
    pub guest_password: Option<String>,
    pub dev_password: Option<String>,
}

impl AppState {
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> anyhow::Result<T>) -> Result<T, ApiError> {
        let conn = self
            .db
            .lock()
            .map_err(|_| ApiError::Internal(anyhow::anyhow!("Database lock poisoned")))?;
        Ok(f(&conn)?)
    }
}

/// API Response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn err(message: String) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(message),
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing or invalid credentials")]
    Unauthorized,

    #[error("Developer access required")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(ApiResponse::err(self.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// AUTH
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Guest,
    Developer,
}

/// Any authenticated caller
pub struct Authenticated(pub Role);

/// A caller holding the developer password
pub struct RequireDeveloper;

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|val| val.to_str().ok())
            .and_then(|val| val.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty());

        let Some(token) = token else {
            warn!("Missing or invalid Authorization header");
            return Err(ApiError::Unauthorized);
        };

        if state.dev_password.as_deref() == Some(token) {
            Ok(Authenticated(Role::Developer))
        } else if state.guest_password.as_deref() == Some(token) {
            Ok(Authenticated(Role::Guest))
        } else {
            warn!("Invalid bearer token");
            Err(ApiError::Unauthorized)
        }
    }
}

#[async_trait]
impl FromRequestParts<AppState> for RequireDeveloper {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        match Authenticated::from_request_parts(parts, state).await? {
            Authenticated(Role::Developer) => Ok(RequireDeveloper),
            Authenticated(Role::Guest) => Err(ApiError::Forbidden),
        }
    }
}

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitReceiptRequest {
    pub extracted_text: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitReceiptResponse {
    pub receipt_id: String,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Receipt>,
}

#[derive(Debug, Serialize)]
pub struct ReceiptDetail {
    pub receipt: Receipt,
    pub items: Vec<Item>,
}

#[derive(Debug, Serialize)]
pub struct ProcessingStatus {
    pub running: bool,
    pub last_report: Option<ProcessingReport>,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub reset: usize,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub role: Role,
}

/// Dashboard query string; lists are comma separated
#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub categories: Option<String>,
    pub merchants: Option<String>,
}

impl DashboardQuery {
    pub fn into_filter(self) -> ApiResult<Filter> {
        let parse_date = |raw: Option<String>, field: &str| -> ApiResult<Option<NaiveDate>> {
            raw.filter(|s| !s.trim().is_empty())
                .map(|s| {
                    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| {
                        ApiError::BadRequest(format!("{} must be a YYYY-MM-DD date, got '{}'", field, s))
                    })
                })
                .transpose()
        };

        let start_date = parse_date(self.start_date, "start_date")?;
        let end_date = parse_date(self.end_date, "end_date")?;

        let categories = self
            .categories
            .map(|raw| {
                split_list(&raw)
                    .map(|label| label.parse::<Category>().map_err(|e| ApiError::BadRequest(e.to_string())))
                    .collect::<ApiResult<Vec<_>>>()
            })
            .transpose()?;

        let merchants = self
            .merchants
            .map(|raw| split_list(&raw).map(str::to_string).collect());

        Ok(Filter {
            start_date,
            end_date,
            categories,
            merchants,
        })
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /process-receipts - Start a background batch
async fn start_processing(_dev: RequireDeveloper, State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    match state.processor.spawn_batch() {
        Some(_) => {
            info!("receipt processing started");
            Ok((
                StatusCode::ACCEPTED,
                Json(ApiResponse::ok("Receipt processing has been started in the background.")),
            ))
        }
        None => Err(ApiError::Conflict("A processing batch is already running".to_string())),
    }
}

/// GET /process-receipts/status
async fn processing_status(_auth: Authenticated, State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(ProcessingStatus {
        running: state.processor.is_running(),
        last_report: state.processor.last_report(),
    }))
}

/// GET /receipts - All receipts, newest first
async fn list_receipts(_auth: Authenticated, State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let receipts = state.with_conn(db::get_all_receipts)?;
    Ok(Json(ApiResponse::ok(receipts)))
}

/// POST /api/receipts - Submit OCR text
async fn submit_receipt(
    _auth: Authenticated,
    State(state): State<AppState>,
    payload: Result<Json<SubmitReceiptRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    if request.extracted_text.trim().is_empty() {
        return Err(ApiError::BadRequest("extracted_text must not be empty".to_string()));
    }

    let user_id = request
        .user_id
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| DEMO_USER_ID.to_string());

    let outcome = state.with_conn(|conn| db::submit_receipt(conn, &user_id, &request.extracted_text, ACTOR))?;

    Ok(match outcome {
        SubmitOutcome::Created(receipt) => (
            StatusCode::CREATED,
            Json(ApiResponse::ok(SubmitReceiptResponse {
                receipt_id: receipt.id.clone(),
                duplicate: false,
                receipt: Some(receipt),
            })),
        ),
        SubmitOutcome::Duplicate(receipt_id) => (
            StatusCode::OK,
            Json(ApiResponse::ok(SubmitReceiptResponse {
                receipt_id,
                duplicate: true,
                receipt: None,
            })),
        ),
    })
}

/// GET /api/receipts/:id - Receipt with its items
async fn get_receipt(
    _auth: Authenticated,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let detail = state.with_conn(|conn| {
        let Some(receipt) = db::get_receipt(conn, &id)? else {
            return Ok(None);
        };
        let items = db::get_items_for_receipt(conn, &id)?;
        Ok(Some(ReceiptDetail { receipt, items }))
    })?;

    detail
        .map(|d| Json(ApiResponse::ok(d)))
        .ok_or_else(|| ApiError::NotFound(format!("Receipt {} not found", id)))
}

/// GET /api/dashboard - KPIs and breakdowns for a filter
async fn dashboard(
    _auth: Authenticated,
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> ApiResult<Json<ApiResponse<Dashboard>>> {
    let filter = query.into_filter()?;
    let rows = state.with_conn(db::get_analysis_rows)?;
    Ok(Json(ApiResponse::ok(analytics::build_dashboard(&rows, filter))))
}

/// GET /api/monthly - Current month against history
async fn monthly(_auth: Authenticated, State(state): State<AppState>) -> ApiResult<Json<ApiResponse<MonthlyAnalysis>>> {
    let rows = state.with_conn(db::get_analysis_rows)?;
    let today = chrono::Local::now().date_naive();
    Ok(Json(ApiResponse::ok(analytics::monthly_analysis(&rows, today))))
}

/// GET /api/receipts/failed - Failed queue
async fn failed_receipts(_dev: RequireDeveloper, State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let receipts = state.with_conn(|conn| db::get_receipts_by_status(conn, ReceiptStatus::Failed))?;
    Ok(Json(ApiResponse::ok(receipts)))
}

/// POST /api/receipts/retry-failed - Failed back to pending
async fn retry_failed(_dev: RequireDeveloper, State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let reset = state.with_conn(|conn| db::reset_failed_to_pending(conn, ACTOR))?;
    Ok(Json(ApiResponse::ok(RetryResponse { reset })))
}

/// GET /api/me - Role of the caller
async fn me(Authenticated(role): Authenticated) -> impl IntoResponse {
    Json(ApiResponse::ok(MeResponse { role }))
}

// ============================================================================
// Router
// ============================================================================

pub fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/receipts", post(submit_receipt))
        .route("/receipts/failed", get(failed_receipts))
        .route("/receipts/retry-failed", post(retry_failed))
        .route("/receipts/:id", get(get_receipt))
        .route("/dashboard", get(dashboard))
        .route("/monthly", get(monthly))
        .route("/me", get(me));

    Router::new()
        .route("/process-receipts", post(start_processing))
        .route("/process-receipts/status", get(processing_status))
        .route("/receipts", get(list_receipts))
        .nest("/api", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
