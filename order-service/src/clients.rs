//! Outbound collaborators of the order service: the inventory service and
//! the product catalog.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use shared::{ErrorBody, ReservationInfo, ReserveRequest, ServiceError, ServiceResult, StockLine};
use tracing::debug;

#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn reserve(&self, order_serial: &str, lines: &[StockLine]) -> ServiceResult<()>;

    /// Gives back the stock reserved for `order_serial`; a no-op when there
    /// is nothing to release.
    async fn release(&self, order_serial: &str) -> ServiceResult<()>;

    /// Sell-ledger entry for `order_serial`, if the inventory has one.
    async fn reservation(&self, order_serial: &str) -> ServiceResult<Option<ReservationInfo>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductInfo {
    pub id: i32,
    pub name: String,
    pub front_image: String,
    pub shop_price: BigDecimal,
}

#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// Products among `ids` that exist; unknown ids are simply absent.
    async fn batch_get(&self, ids: &[i32]) -> ServiceResult<Vec<ProductInfo>>;
}

fn http_client(timeout: Duration) -> ServiceResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ServiceError::FatalDb(format!("failed to build http client: {}", e)))
}

fn transport_error(service: &str, err: reqwest::Error) -> ServiceError {
    ServiceError::ServiceUnavailable(format!("{} unreachable: {}", service, err))
}

/// Rebuilds the remote `ServiceError` from a non-success response.
async fn remote_error(service: &str, response: reqwest::Response) -> ServiceError {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => ServiceError::from_body(body),
        Err(e) => {
            debug!(service, %status, "Error response without a body: {}", e);
            ServiceError::ServiceUnavailable(format!("{} answered {}", service, status))
        }
    }
}

pub struct HttpInventoryClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpInventoryClient {
    pub fn new(base_url: &str, timeout: Duration) -> ServiceResult<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl InventoryClient for HttpInventoryClient {
    async fn reserve(&self, order_serial: &str, lines: &[StockLine]) -> ServiceResult<()> {
        // The server abandons the reserve once we stop waiting for it.
        let deadline = Utc::now()
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let response = self
            .http
            .post(format!("{}/reservations", self.base_url))
            .json(&ReserveRequest {
                order_serial: order_serial.to_string(),
                lines: lines.to_vec(),
                deadline: Some(deadline),
            })
            .send()
            .await
            .map_err(|e| transport_error("inventory", e))?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(remote_error("inventory", response).await)
    }

    async fn release(&self, order_serial: &str) -> ServiceResult<()> {
        let response = self
            .http
            .post(format!("{}/reservations/{}/release", self.base_url, order_serial))
            .send()
            .await
            .map_err(|e| transport_error("inventory", e))?;

        if response.status().is_success() {
            return Ok(());
        }
        Err(remote_error("inventory", response).await)
    }

    async fn reservation(&self, order_serial: &str) -> ServiceResult<Option<ReservationInfo>> {
        let response = self
            .http
            .get(format!("{}/reservations/{}", self.base_url, order_serial))
            .send()
            .await
            .map_err(|e| transport_error("inventory", e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<ReservationInfo>()
                .await
                .map(Some)
                .map_err(|e| transport_error("inventory", e)),
            _ => Err(remote_error("inventory", response).await),
        }
    }
}

/// Product catalog reached over HTTP: `GET {base}/products?ids=1,2,3`.
pub struct HttpProductCatalog {
    http: reqwest::Client,
    base_url: String,
}

impl HttpProductCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> ServiceResult<Self> {
        Ok(Self {
            http: http_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProductCatalog for HttpProductCatalog {
    async fn batch_get(&self, ids: &[i32]) -> ServiceResult<Vec<ProductInfo>> {
        let ids = ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",");
        let response = self
            .http
            .get(format!("{}/products", self.base_url))
            .query(&[("ids", ids)])
            .send()
            .await
            .map_err(|e| transport_error("product catalog", e))?;

        if !response.status().is_success() {
            return Err(remote_error("product catalog", response).await);
        }
        response
            .json::<Vec<ProductInfo>>()
            .await
            .map_err(|e| transport_error("product catalog", e))
    }
}

/// Catalog held in memory, for tests and local runs.
#[derive(Default)]
pub struct MemoryCatalog {
    products: Mutex<HashMap<i32, ProductInfo>>,
    unavailable: AtomicBool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn products(&self) -> MutexGuard<'_, HashMap<i32, ProductInfo>> {
        self.products.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, product: ProductInfo) {
        self.products().insert(product.id, product);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProductCatalog for MemoryCatalog {
    async fn batch_get(&self, ids: &[i32]) -> ServiceResult<Vec<ProductInfo>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServiceError::ServiceUnavailable("product catalog unavailable".to_string()));
        }
        let products = self.products();
        Ok(ids.iter().filter_map(|id| products.get(id).cloned()).collect())
    }
}
