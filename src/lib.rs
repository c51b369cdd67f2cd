// ABOUTME: Library root for the CI database test helpers
// ABOUTME: Connection string building plus one address-count query per backend

pub mod config;
pub mod db;
pub mod models;

pub use config::{Backend, ConnectionSettings, ADVENTURE_WORKS_LT};
pub use db::{PostgresError, SqlServerError};
pub use models::CheckReport;
