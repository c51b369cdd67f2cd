// ABOUTME: Database module exports for the CI test helpers
// ABOUTME: One row-count module per backend, PostgreSQL and SQL Server

pub mod postgres;
pub mod sqlserver;

pub use postgres::{PostgresConnection, PostgresError};
pub use sqlserver::{SqlServerConnection, SqlServerError};
