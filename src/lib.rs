pub mod auth;
pub mod config;
pub mod forms;
pub mod progress;
pub mod record_store;
pub mod upload;
