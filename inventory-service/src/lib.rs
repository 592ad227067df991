pub mod api;
pub mod config;
pub mod handlers;
pub mod lock;
pub mod models;
pub mod schema;
pub mod service;
pub mod store;
