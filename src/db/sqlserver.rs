// ABOUTME: SQL Server connection handling using tiberius
// ABOUTME: Opens a per-call connection and counts rows in SalesLT.Address

use thiserror::Error;
use tiberius::{AuthMethod, Client, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use crate::config::{Backend, ConfigError, ConnectionSettings};

pub const ADDRESS_COUNT_SQL: &str = "SELECT COUNT(*) FROM SalesLT.Address";

const VERSION_SQL: &str = "SELECT @@VERSION";

#[derive(Error, Debug)]
pub enum SqlServerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(#[from] ConfigError),
    #[error("Query failed: {0}")]
    QueryFailed(String),
    #[error("Tiberius error: {0}")]
    Tiberius(#[from] tiberius::error::Error),
    #[error("Conversion failed: {0}")]
    Conversion(String),
    #[error("Blocking call made from inside a tokio runtime")]
    RuntimeActive,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single connection owned by one call
pub struct SqlServerConnection {
    client: Client<Compat<TcpStream>>,
}

impl SqlServerConnection {
    /// Connect using an ADO.NET style connection string
    pub async fn connect(connection_string: &str) -> Result<Self, SqlServerError> {
        let settings = ConnectionSettings::parse(connection_string)?;
        log::debug!("Connecting to SQL Server at {}", settings);

        let mut config = Config::new();
        config.host(&settings.host);
        config.port(settings.port.unwrap_or(Backend::SqlServer.default_port()));
        config.authentication(AuthMethod::sql_server(&settings.username, &settings.password));
        if let Some(database) = &settings.database {
            config.database(database);
        }

        if settings.trust_certificate {
            config.trust_cert();
        }

        let tcp = TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| SqlServerError::ConnectionFailed(e.to_string()))?;

        tcp.set_nodelay(true)?;

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| SqlServerError::ConnectionFailed(e.to_string()))?;

        Ok(Self { client })
    }

    /// Server version string, used to confirm the session works
    pub async fn server_version(&mut self) -> Result<String, SqlServerError> {
        let row = self
            .client
            .simple_query(VERSION_SQL)
            .await?
            .into_row()
            .await?
            .ok_or_else(|| SqlServerError::QueryFailed("No version returned".to_string()))?;

        let version: Option<&str> = row
            .try_get(0)
            .map_err(|e| SqlServerError::Conversion(e.to_string()))?;
        Ok(version.unwrap_or("Unknown").to_string())
    }

    /// Number of rows in SalesLT.Address
    pub async fn address_count(&mut self) -> Result<i32, SqlServerError> {
        let row = self
            .client
            .simple_query(ADDRESS_COUNT_SQL)
            .await?
            .into_row()
            .await?
            .ok_or_else(|| SqlServerError::QueryFailed("COUNT(*) returned no rows".to_string()))?;

        let count: Option<i32> = row
            .try_get(0)
            .map_err(|e| SqlServerError::Conversion(e.to_string()))?;
        count_from(count)
    }

    /// Close the session with the server
    pub async fn close(self) {
        if let Err(e) = self.client.close().await {
            log::warn!("SQL Server close failed: {}", e);
        }
    }
}

/// COUNT(*) is an `int` on SQL Server; only NULL needs rejecting
pub fn count_from(value: Option<i32>) -> Result<i32, SqlServerError> {
    value.ok_or_else(|| SqlServerError::Conversion("COUNT(*) returned NULL".to_string()))
}

/// Address count for the database described by `connection_string`
pub async fn address_count(connection_string: &str) -> Result<i32, SqlServerError> {
    let mut conn = SqlServerConnection::connect(connection_string).await?;
    let result = conn.address_count().await;
    conn.close().await;

    let count = result?;
    log::info!("sqlserver address count: {}", count);
    Ok(count)
}

pub async fn server_version(connection_string: &str) -> Result<String, SqlServerError> {
    let mut conn = SqlServerConnection::connect(connection_string).await?;
    let result = conn.server_version().await;
    conn.close().await;
    result
}

/// Address count in AdventureWorksLT, configured from the environment
pub async fn get_address_count() -> Result<i32, SqlServerError> {
    address_count(&Backend::SqlServer.adventure_works_lt()).await
}

/// Blocking form of [`get_address_count`].
///
/// Runs on its own current-thread runtime, so it must not be called from
/// inside a tokio runtime; that returns [`SqlServerError::RuntimeActive`].
pub fn get_address_count_blocking() -> Result<i32, SqlServerError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(SqlServerError::RuntimeActive);
    }

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(get_address_count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_is_unquoted() {
        assert_eq!(ADDRESS_COUNT_SQL, "SELECT COUNT(*) FROM SalesLT.Address");
    }

    #[tokio::test]
    async fn test_malformed_connection_string() {
        let result = address_count("Server=localhost;User Id").await;
        assert!(matches!(
            result,
            Err(SqlServerError::InvalidConnectionString(
                ConfigError::MalformedSegment(_)
            ))
        ));
    }

    #[test]
    fn test_count_from() {
        assert_eq!(count_from(Some(10)).unwrap(), 10);
        assert!(matches!(count_from(None), Err(SqlServerError::Conversion(_))));
    }

    #[tokio::test]
    async fn test_blocking_inside_runtime_is_rejected() {
        assert!(matches!(
            get_address_count_blocking(),
            Err(SqlServerError::RuntimeActive)
        ));
    }
}
