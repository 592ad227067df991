pub mod api;
pub mod clients;
pub mod config;
pub mod handlers;
pub mod models;
pub mod schema;
pub mod service;
pub mod store;
pub mod transaction;
