use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use shared::{ReservationInfo, ReserveRequest, ServiceError, SetStockRequest, StockInfo};

use crate::service::InventoryService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InventoryService>,
}

pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = self.0.to_body();
        let status = StatusCode::from_u16(body.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        (status, Json(body)).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/stocks/:product_id", put(set_stock).get(read_stock))
        .route("/reservations", post(reserve))
        .route("/reservations/:order_serial", get(reservation))
        .route("/reservations/:order_serial/release", post(release))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

pub async fn set_stock(
    State(state): State<AppState>,
    Path(product_id): Path<i32>,
    Json(request): Json<SetStockRequest>,
) -> Result<Json<StockInfo>, ApiError> {
    let stock = state.service.set_stock(product_id, request.quantity).await?;
    Ok(Json(StockInfo {
        product_id: stock.product_id,
        quantity: stock.quantity,
    }))
}

pub async fn read_stock(
    State(state): State<AppState>,
    Path(product_id): Path<i32>,
) -> Result<Json<StockInfo>, ApiError> {
    Ok(Json(state.service.read_stock(product_id).await?))
}

pub async fn reserve(
    State(state): State<AppState>,
    Json(request): Json<ReserveRequest>,
) -> Result<StatusCode, ApiError> {
    // Detached from the request: a caller hanging up must not stop the
    // decrement/undo sequence halfway. The caller's deadline bounds it instead.
    let service = state.service.clone();
    let task = tokio::spawn(async move {
        service
            .reserve_within(&request.order_serial, &request.lines, request.deadline)
            .await
    });

    task.await
        .map_err(|e| ServiceError::FatalDb(format!("reserve task failed: {}", e)))??;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reservation(
    State(state): State<AppState>,
    Path(order_serial): Path<String>,
) -> Result<Json<ReservationInfo>, ApiError> {
    let entry = state.service.reservation(&order_serial).await?;
    Ok(Json(entry.into()))
}

pub async fn release(
    State(state): State<AppState>,
    Path(order_serial): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.release(&order_serial).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health_check() -> &'static str {
    "OK"
}
