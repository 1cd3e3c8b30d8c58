// 🌐 REST API - axum routes over the estimating engine
//
// Every response uses the same envelope:
//   { "success": true,  "data": ... }
//   { "success": false, "error": "...", "kind": "missing_input" }

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::engine::EstimatingEngine;
use crate::error::{Error, ErrorKind};
use crate::estimate::{LineItem, PricingPolicy};
use crate::formula::{FormulaDraft, FormulaVersion, Value};

type AppState = Arc<EstimatingEngine>;

/// API Response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data)))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Engine(Error),
    BadRequest(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Engine(e)
    }
}

pub fn status_for(e: &Error) -> StatusCode {
    if let Error::PublishConflict { .. } = e {
        return StatusCode::CONFLICT;
    }
    match e.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::NoFormulaAssigned | ErrorKind::OrphanedFormula | ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::InvalidFormula
        | ErrorKind::MissingInput
        | ErrorKind::TypeMismatch
        | ErrorKind::DivisionByZero
        | ErrorKind::CyclicReference
        | ErrorKind::IncompleteOutput
        | ErrorKind::Evaluation
        | ErrorKind::InvalidLineTotal => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, kind) = match self {
            ApiError::Engine(e) => {
                let status = status_for(&e);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    error!(error = %e, "request failed");
                }
                (status, e.user_message(), e.kind().as_str())
            }
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message, "bad_request"),
        };

        let body = ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message),
            kind: Some(kind.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateEstimateRequest {
    pub organization_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LineItemRequest {
    /// Present when editing an existing line item
    #[serde(default)]
    pub id: Option<String>,
    pub position: u32,
    pub description: String,
    #[serde(default)]
    pub formula_key: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub manual_amount: Option<Decimal>,
    #[serde(default)]
    pub total_output: Option<String>,
}

impl LineItemRequest {
    fn into_line_item(self, estimate_id: &str) -> Result<LineItem, ApiError> {
        let mut item = match (self.formula_key, self.manual_amount) {
            (Some(key), None) => LineItem::formula(estimate_id, self.position, &self.description, &key),
            (None, Some(amount)) => LineItem::manual(estimate_id, self.position, &self.description, amount),
            _ => {
                return Err(ApiError::BadRequest(
                    "a line item needs exactly one of formula_key or manual_amount".to_string(),
                ))
            }
        };
        if let Some(id) = self.id {
            item.id = id;
        }
        item.inputs = self.inputs;
        item.total_output = self.total_output;
        Ok(item)
    }
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub triggered_by: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/health
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// POST /api/formulas
async fn publish_formula(State(engine): State<AppState>, Json(draft): Json<FormulaDraft>) -> ApiResult<FormulaVersion> {
    let version = engine.publish_formula_version(draft)?;
    ok(version.as_ref().clone())
}

/// GET /api/formulas
async fn formula_catalog(State(engine): State<AppState>) -> ApiResult<BTreeMap<String, u32>> {
    ok(engine.formula_catalog()?)
}

/// GET /api/formulas/:key/history
async fn formula_history(State(engine): State<AppState>, Path(key): Path<String>) -> ApiResult<Vec<FormulaVersion>> {
    let history = engine.formula_history(&key)?;
    ok(history.iter().map(|v| v.as_ref().clone()).collect())
}

/// GET /api/organizations/:org/pricing
async fn get_pricing(State(engine): State<AppState>, Path(org): Path<String>) -> ApiResult<PricingPolicy> {
    ok(engine.organization_pricing(&org)?)
}

/// PUT /api/organizations/:org/pricing
async fn put_pricing(
    State(engine): State<AppState>,
    Path(org): Path<String>,
    Json(policy): Json<PricingPolicy>,
) -> ApiResult<PricingPolicy> {
    policy.validate().map_err(ApiError::BadRequest)?;
    engine.set_organization_pricing(&org, &policy)?;
    ok(policy)
}

/// POST /api/estimates
async fn create_estimate(
    State(engine): State<AppState>,
    Json(request): Json<CreateEstimateRequest>,
) -> impl IntoResponse {
    match engine.create_estimate(&request.organization_id, &request.name) {
        Ok(estimate) => (StatusCode::CREATED, Json(ApiResponse::ok(estimate))).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /api/estimates/:id
async fn get_estimate(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<crate::estimate::Estimate> {
    ok(engine.estimate(&id)?)
}

/// GET /api/estimates/:id/line-items
async fn list_line_items(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<LineItem>> {
    ok(engine.line_items(&id)?)
}

/// POST /api/estimates/:id/line-items
async fn save_line_item(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<LineItemRequest>,
) -> ApiResult<LineItem> {
    let item = request.into_line_item(&id)?;
    engine.save_line_item(&item)?;
    ok(item)
}

/// POST /api/estimates/:id/recompute
async fn recompute_estimate(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<crate::engine::Recomputation> {
    ok(engine.recompute_estimate(&id, &request.triggered_by)?)
}

/// GET /api/estimates/:id/totals
async fn totals(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<crate::aggregation::AggregateTotals> {
    ok(engine.aggregate_totals(&id)?)
}

/// GET /api/estimates/:id/usage
async fn usage(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<crate::engine::FormulaUsage>> {
    ok(engine.formula_usage(&id)?)
}

/// POST /api/line-items/:id/compute
async fn compute_line_item(
    State(engine): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TriggerRequest>,
) -> ApiResult<crate::provenance::UsageSnapshot> {
    ok(engine.compute_line_item(&id, &request.triggered_by)?)
}

/// GET /api/line-items/:id/staleness
async fn staleness(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<crate::staleness::Staleness> {
    ok(engine.staleness(&id)?)
}

/// GET /api/line-items/:id/snapshots
async fn snapshots(
    State(engine): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<crate::provenance::UsageSnapshot>> {
    ok(engine.snapshot_history(&id)?)
}

/// GET /api/line-items/:id/verify
async fn verify(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<crate::engine::Verification> {
    ok(engine.verify_snapshot(&id)?)
}

/// GET /api/line-items/:id/events
async fn events(State(engine): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<crate::store::Event>> {
    ok(engine.line_item_events(&id)?)
}

// ============================================================================
// Router
// ============================================================================

/// All routes, nested under `/api`.
pub fn router(engine: Arc<EstimatingEngine>) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/formulas", get(formula_catalog).post(publish_formula))
        .route("/formulas/:key/history", get(formula_history))
        .route("/organizations/:org/pricing", get(get_pricing).put(put_pricing))
        .route("/estimates", post(create_estimate))
        .route("/estimates/:id", get(get_estimate))
        .route("/estimates/:id/line-items", get(list_line_items).post(save_line_item))
        .route("/estimates/:id/recompute", post(recompute_estimate))
        .route("/estimates/:id/totals", get(totals))
        .route("/estimates/:id/usage", get(usage))
        .route("/line-items/:id/compute", post(compute_line_item))
        .route("/line-items/:id/staleness", get(staleness))
        .route("/line-items/:id/snapshots", get(snapshots))
        .route("/line-items/:id/verify", get(verify))
        .route("/line-items/:id/events", get(events))
        .with_state(engine);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
