use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds shared by the inventory and order services.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of stock for products {products:?}")]
    OutOfStock { products: Vec<i32> },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("lock timeout: {0}")]
    LockTimeout(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("transient database error: {0}")]
    TransientDb(String),

    #[error("database error: {0}")]
    FatalDb(String),
}

/// Status codes exposed at service boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    InvalidArgument,
    ResourceExhausted,
    Aborted,
    Unavailable,
    Internal,
}

impl ErrorCode {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::NotFound => 404,
            ErrorCode::InvalidArgument => 400,
            ErrorCode::ResourceExhausted => 409,
            ErrorCode::Aborted => 409,
            ErrorCode::Unavailable => 503,
            ErrorCode::Internal => 500,
        }
    }
}

/// JSON error body carried over HTTP between services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<i32>,
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            ServiceError::OutOfStock { .. } => ErrorCode::ResourceExhausted,
            ServiceError::Conflict(_) => ErrorCode::Aborted,
            ServiceError::LockTimeout(_)
            | ServiceError::BrokerUnavailable(_)
            | ServiceError::ServiceUnavailable(_)
            | ServiceError::DeadlineExceeded(_)
            | ServiceError::TransientDb(_) => ErrorCode::Unavailable,
            ServiceError::FatalDb(_) => ErrorCode::Internal,
        }
    }

    /// Errors worth retrying later: the situation may clear on its own.
    pub fn is_transient(&self) -> bool {
        self.code() == ErrorCode::Unavailable
    }

    pub fn to_body(&self) -> ErrorBody {
        let products = match self {
            ServiceError::OutOfStock { products } => products.clone(),
            _ => Vec::new(),
        };
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            products,
        }
    }

    /// Rebuilds an error received from a remote service.
    pub fn from_body(body: ErrorBody) -> Self {
        match body.code {
            ErrorCode::NotFound => ServiceError::NotFound(body.message),
            ErrorCode::InvalidArgument => ServiceError::InvalidArgument(body.message),
            ErrorCode::ResourceExhausted => ServiceError::OutOfStock {
                products: body.products,
            },
            ErrorCode::Aborted => ServiceError::Conflict(body.message),
            ErrorCode::Unavailable => ServiceError::ServiceUnavailable(body.message),
            ErrorCode::Internal => ServiceError::FatalDb(body.message),
        }
    }
}

impl From<DieselError> for ServiceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => ServiceError::NotFound("record not found".to_string()),
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info)
            | DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, info) => {
                ServiceError::TransientDb(info.message().to_string())
            }
            DieselError::RollbackTransaction => {
                ServiceError::TransientDb("transaction rolled back".to_string())
            }
            other => ServiceError::FatalDb(other.to_string()),
        }
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for ServiceError {
    fn from(err: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        ServiceError::TransientDb(err.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_boundary_mapping() {
        assert_eq!(ServiceError::OutOfStock { products: vec![1] }.code(), ErrorCode::ResourceExhausted);
        assert_eq!(ServiceError::Conflict("cas".into()).code(), ErrorCode::Aborted);
        assert_eq!(ServiceError::LockTimeout("stock:1".into()).code(), ErrorCode::Unavailable);
        assert_eq!(ServiceError::FatalDb("boom".into()).code(), ErrorCode::Internal);
        assert_eq!(ServiceError::DeadlineExceeded("reserve".into()).code(), ErrorCode::Unavailable);
        assert!(ServiceError::TransientDb("gone".into()).is_transient());
        assert!(!ServiceError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn out_of_stock_survives_the_wire() {
        let body = ServiceError::OutOfStock { products: vec![421, 7] }.to_body();
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("RESOURCE_EXHAUSTED"));

        let decoded: ErrorBody = serde_json::from_str(&json).unwrap();
        match ServiceError::from_body(decoded) {
            ServiceError::OutOfStock { products } => assert_eq!(products, vec![421, 7]),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn diesel_not_found_maps_to_not_found() {
        let err: ServiceError = DieselError::NotFound.into();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }
}
