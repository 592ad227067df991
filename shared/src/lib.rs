pub mod broker;
pub mod db;
pub mod error;
pub mod messages;
pub mod telemetry;

pub use error::{ErrorBody, ErrorCode, ServiceError, ServiceResult};
pub use messages::*;
