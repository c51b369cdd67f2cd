// ABOUTME: Connection check for the CI test databases
// ABOUTME: Prints a JSON report with server version and address count per backend

use anyhow::{bail, Context};
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

use ci_test_db::config::{Backend, ConnectionSettings};
use ci_test_db::db::{postgres, sqlserver};
use ci_test_db::models::CheckReport;

/// Level named by `CITEST_LOG`, case-insensitive, defaulting to info
fn log_level(value: Option<&str>) -> LevelFilter {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(LevelFilter::Info)
}

fn setup_logging() -> anyhow::Result<()> {
    let level = log_level(std::env::var("CITEST_LOG").ok().as_deref());

    let colors = ColoredLevelConfig::new()
        .trace(Color::Cyan)
        .debug(Color::Magenta)
        .info(Color::Green)
        .warn(Color::Yellow)
        .error(Color::Red);

    // Logs go to stderr so stdout carries only the JSON reports
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{} [{:width$}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colors.color(record.level()),
                record.target(),
                message,
                width = 5
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()
        .context("failed to initialize logging")
}

fn parse_backends() -> anyhow::Result<Vec<Backend>> {
    let mut backends = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.to_ascii_lowercase().as_str() {
            "postgres" | "pg" => backends.push(Backend::Postgres),
            "sqlserver" | "mssql" => backends.push(Backend::SqlServer),
            other => bail!("unknown backend '{}', expected postgres or sqlserver", other),
        }
    }

    if backends.is_empty() {
        backends = vec![Backend::Postgres, Backend::SqlServer];
    }
    Ok(backends)
}

async fn check(backend: Backend) -> CheckReport {
    let connection_string = backend.adventure_works_lt();
    let settings = ConnectionSettings::parse(&connection_string).unwrap_or_default();
    let server = settings.address(backend.default_port());
    let database = settings.database.clone().unwrap_or_default();

    log::info!("Checking {} at {}", backend, settings);

    let result = match backend {
        Backend::Postgres => check_postgres(&connection_string).await,
        Backend::SqlServer => check_sql_server(&connection_string).await,
    };

    match result {
        Ok((version, count)) => {
            log::info!("{}: {} addresses ({})", backend, count, version);
            CheckReport::success(backend, server, database, version, count)
        }
        Err(e) => {
            log::error!("{}: {:#}", backend, e);
            CheckReport::failure(backend, server, database, format!("{:#}", e))
        }
    }
}

async fn check_postgres(connection_string: &str) -> anyhow::Result<(String, i32)> {
    let conn = postgres::PostgresConnection::connect(connection_string).await?;
    let result = async {
        let version = conn.server_version().await.context("version query failed")?;
        let count = conn.address_count().await.context("address count failed")?;
        anyhow::Ok((version, count))
    }
    .await;
    conn.close().await;
    result
}

async fn check_sql_server(connection_string: &str) -> anyhow::Result<(String, i32)> {
    let mut conn = sqlserver::SqlServerConnection::connect(connection_string).await?;
    let result = async {
        let version = conn.server_version().await.context("version query failed")?;
        let count = conn.address_count().await.context("address count failed")?;
        anyhow::Ok((version, count))
    }
    .await;
    conn.close().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging()?;
    let backends = parse_backends()?;

    let mut all_ok = true;
    for backend in backends {
        let report = check(backend).await;
        all_ok &= report.is_success();
        println!("{}", serde_json::to_string(&report)?);
    }

    if !all_ok {
        std::process::exit(1);
    }
    Ok(())
}
