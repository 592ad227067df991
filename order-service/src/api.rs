use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post, put},
    Router,
};
use serde::Deserialize;
use shared::ServiceError;

use crate::models::{CartItem, OrderDetail, OrderPage};
use crate::service::{CreateOrderRequest, CreatedOrder, OrderService};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<OrderService>,
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

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub user_id: i32,
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DetailQuery {
    pub user_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct CartQuery {
    pub user_id: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    pub trade_no: Option<String>,
    pub pay_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCartItemRequest {
    pub user_id: i32,
    pub product_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCartItemRequest {
    pub quantity: Option<i32>,
    pub checked: Option<bool>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order).get(order_list))
        .route("/orders/:id", get(order_detail))
        // Keyed by order serial; the segment shares its name with the detail route.
        .route("/orders/:id/status", put(update_order_status))
        .route("/carts", get(cart_items).post(create_cart_item))
        .route("/carts/:id", patch(update_cart_item).delete(delete_cart_item))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreatedOrder>), ApiError> {
    // Detached so a dropped request cannot abandon the local transaction
    // between reservation and order insert.
    let service = state.service.clone();
    let task = tokio::spawn(async move { service.create_order(request).await });

    let created = task
        .await
        .map_err(|e| ServiceError::FatalDb(format!("create order task failed: {}", e)))??;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn order_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<OrderPage>, ApiError> {
    let page = state
        .service
        .order_list(query.user_id, query.page, query.per_page)
        .await?;
    Ok(Json(page))
}

pub async fn order_detail(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Query(query): Query<DetailQuery>,
) -> Result<Json<OrderDetail>, ApiError> {
    Ok(Json(state.service.order_detail(id, query.user_id).await?))
}

pub async fn update_order_status(
    State(state): State<AppState>,
    Path(order_serial): Path<String>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .update_order_status(&order_serial, &request.status, request.trade_no, request.pay_type)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cart_items(
    State(state): State<AppState>,
    Query(query): Query<CartQuery>,
) -> Result<Json<Vec<CartItem>>, ApiError> {
    Ok(Json(state.service.cart_items(query.user_id).await?))
}

pub async fn create_cart_item(
    State(state): State<AppState>,
    Json(request): Json<CreateCartItemRequest>,
) -> Result<(StatusCode, Json<CartItem>), ApiError> {
    let item = state
        .service
        .create_cart_item(request.user_id, request.product_id, request.quantity)
        .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn update_cart_item(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(request): Json<UpdateCartItemRequest>,
) -> Result<Json<CartItem>, ApiError> {
    let item = state
        .service
        .update_cart_item(id, request.quantity, request.checked)
        .await?;
    Ok(Json(item))
}

pub async fn delete_cart_item(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_cart_item(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health_check() -> &'static str {
    "OK"
}
