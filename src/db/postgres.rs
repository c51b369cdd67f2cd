// ABOUTME: PostgreSQL connection handling using tokio-postgres
// ABOUTME: Opens a per-call connection and counts rows in "SalesLT"."Address"

use std::future::Future;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::config::{Backend, ConfigError, ConnectionSettings};

/// Identifiers are quoted so PostgreSQL keeps their case
pub const ADDRESS_COUNT_SQL: &str = r#"SELECT COUNT(*) FROM "SalesLT"."Address";"#;

const VERSION_SQL: &str = "SELECT version();";

#[derive(Error, Debug)]
pub enum PostgresError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(#[from] ConfigError),
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("TLS setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Conversion failed: {0}")]
    Conversion(String),
    #[error("Blocking call made from inside a tokio runtime")]
    RuntimeActive,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single connection owned by one call
pub struct PostgresConnection {
    client: Client,
    driver: JoinHandle<()>,
}

impl PostgresConnection {
    /// Connect using an ADO/Npgsql style connection string.
    ///
    /// With `TrustServerCertificate=true` TLS is attempted first and the
    /// server certificate is accepted unchecked; servers without TLS still
    /// get a plaintext session. Otherwise the session is plaintext.
    pub async fn connect(connection_string: &str) -> Result<Self, PostgresError> {
        let settings = ConnectionSettings::parse(connection_string)?;
        log::debug!("Connecting to postgres at {}", settings);

        let config = client_config(&settings);

        let (client, driver) = if settings.trust_certificate {
            let (client, connection) = config
                .connect(trusting_tls_connector()?)
                .await
                .map_err(|e| PostgresError::ConnectionFailed(e.to_string()))?;
            (client, spawn_driver(connection))
        } else {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| PostgresError::ConnectionFailed(e.to_string()))?;
            (client, spawn_driver(connection))
        };

        Ok(Self { client, driver })
    }

    /// Server version string, used to confirm the session works
    pub async fn server_version(&self) -> Result<String, PostgresError> {
        let row = self.client.query_one(VERSION_SQL, &[]).await?;
        row.try_get::<_, String>(0)
            .map_err(|e| PostgresError::Conversion(e.to_string()))
    }

    /// Number of rows in "SalesLT"."Address"
    pub async fn address_count(&self) -> Result<i32, PostgresError> {
        let row = self.client.query_one(ADDRESS_COUNT_SQL, &[]).await?;

        let count: Option<i64> = row
            .try_get(0)
            .map_err(|e| PostgresError::Conversion(e.to_string()))?;
        count_from(count)
    }

    /// Drop the client and wait for the driver to finish the session
    pub async fn close(self) {
        drop(self.client);
        if let Err(e) = self.driver.await {
            log::warn!("Postgres driver task failed: {}", e);
        }
    }
}

/// Client configuration for parsed settings, without connecting
pub fn client_config(settings: &ConnectionSettings) -> Config {
    let mut config = Config::new();
    config.host(&settings.host);
    config.port(settings.port.unwrap_or(Backend::Postgres.default_port()));
    config.user(&settings.username);
    config.password(&settings.password);
    if let Some(database) = &settings.database {
        config.dbname(database);
    }

    if settings.trust_certificate {
        config.ssl_mode(SslMode::Prefer);
    } else {
        config.ssl_mode(SslMode::Disable);
    }
    config
}

/// Narrow a `bigint` COUNT(*) to `i32`
pub fn count_from(value: Option<i64>) -> Result<i32, PostgresError> {
    let count =
        value.ok_or_else(|| PostgresError::Conversion("COUNT(*) returned NULL".to_string()))?;

    i32::try_from(count).map_err(|_| {
        PostgresError::Conversion(format!("{} does not fit in a 32-bit integer", count))
    })
}

fn spawn_driver<F>(connection: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    // Resolves once the client is dropped
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::warn!("Postgres connection error: {}", e);
        }
    })
}

fn trusting_tls_connector() -> Result<MakeRustlsConnect, PostgresError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls))
}

/// Accepts any server certificate but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Address count for the database described by `connection_string`
pub async fn address_count(connection_string: &str) -> Result<i32, PostgresError> {
    let conn = PostgresConnection::connect(connection_string).await?;
    let result = conn.address_count().await;
    conn.close().await;

    let count = result?;
    log::info!("postgres address count: {}", count);
    Ok(count)
}

pub async fn server_version(connection_string: &str) -> Result<String, PostgresError> {
    let conn = PostgresConnection::connect(connection_string).await?;
    let result = conn.server_version().await;
    conn.close().await;
    result
}

/// Address count in AdventureWorksLT, configured from the environment
pub async fn get_address_count() -> Result<i32, PostgresError> {
    address_count(&Backend::Postgres.adventure_works_lt()).await
}

/// Blocking form of [`get_address_count`].
///
/// Runs on its own current-thread runtime, so it must not be called from
/// inside a tokio runtime; that returns [`PostgresError::RuntimeActive`].
pub fn get_address_count_blocking() -> Result<i32, PostgresError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(PostgresError::RuntimeActive);
    }

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(get_address_count())
}
