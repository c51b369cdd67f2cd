// ABOUTME: Connection string construction for the CI test databases
// ABOUTME: Expands %VAR% placeholders from the environment and parses descriptors into settings

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Name of the sample database every backend is seeded with
pub const ADVENTURE_WORKS_LT: &str = "AdventureWorksLT";

const POSTGRES_LOCAL_SERVER: &str = "Server=%OpenEntity_Postgres_Server%;UserId=%OpenEntity_Postgres_User%;Password=%OpenEntity_Postgres_Password%;TrustServerCertificate=true";

const SQL_SERVER_LOCAL_SERVER: &str = "Server=%OpenEntity_MSSQL_Server%;User Id=sa;Password=%OpenEntity_MSSQL_Password%;TrustServerCertificate=true";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port in connection string: {0}")]
    InvalidPort(String),
    #[error("Invalid boolean for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("Malformed connection string segment: {0}")]
    MalformedSegment(String),
}

/// Database backend a connection string is meant for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Postgres,
    SqlServer,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Postgres => "postgres",
            Backend::SqlServer => "sqlserver",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Backend::Postgres => 5432,
            Backend::SqlServer => 1433,
        }
    }

    /// Unexpanded server/credential template for this backend
    pub fn template(self) -> &'static str {
        match self {
            Backend::Postgres => POSTGRES_LOCAL_SERVER,
            Backend::SqlServer => SQL_SERVER_LOCAL_SERVER,
        }
    }

    /// Server and credentials, expanded from the current process environment
    pub fn local_server(self) -> String {
        expand_environment_variables(self.template())
    }

    pub fn local_server_with<F>(self, lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        expand_with(self.template(), lookup)
    }

    /// Connection string for `db_name` on this backend's server
    pub fn of(self, db_name: &str) -> String {
        with_database(self.local_server(), db_name)
    }

    pub fn of_with<F>(self, db_name: &str, lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        with_database(self.local_server_with(lookup), db_name)
    }

    pub fn adventure_works_lt(self) -> String {
        self.of(ADVENTURE_WORKS_LT)
    }

    pub fn adventure_works_lt_with<F>(self, lookup: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        self.of_with(ADVENTURE_WORKS_LT, lookup)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn with_database(mut server: String, db_name: &str) -> String {
    server.push_str(";Database=");
    server.push_str(db_name);
    server
}

/// Replace every `%NAME%` with the value of the environment variable `NAME`.
///
/// Names that are not set are left in place together with their `%`
/// delimiters, so a missing variable never fails here; it shows up later when
/// the connection is attempted.
pub fn expand_environment_variables(template: &str) -> String {
    expand_with(template, |name| std::env::var(name).ok())
}

/// Same as [`expand_environment_variables`] with a caller-supplied lookup
pub fn expand_with<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        let Some(end) = after.find('%') else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };

        let name = &after[..end];
        let value = if name.is_empty() { None } else { lookup(name) };

        match value {
            Some(value) => {
                out.push_str(&value);
                rest = &after[end + 1..];
            }
            None => {
                // The closing '%' may open the next placeholder
                out.push('%');
                out.push_str(name);
                rest = &after[end..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// Structured form of a `Key=Value;...` connection descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSettings {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub trust_certificate: bool,
}

impl ConnectionSettings {
    /// Parse an ADO.NET / Npgsql style descriptor.
    ///
    /// Keys are matched case-insensitively with whitespace ignored, so
    /// `User Id` and `UserId` are the same key. The server value may carry a
    /// port as `host,port` or `host:port`. Unknown keys are skipped.
    pub fn parse(descriptor: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        let mut explicit_port = None;

        for segment in descriptor.split(';') {
            if segment.trim().is_empty() {
                continue;
            }

            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| ConfigError::MalformedSegment(segment.to_string()))?;
            let value = value.trim();
            let normalized: String = key
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_ascii_lowercase();

            match normalized.as_str() {
                "server" | "host" | "datasource" | "address" => {
                    let (host, port) = split_server(value)?;
                    settings.host = host;
                    if port.is_some() {
                        settings.port = port;
                    }
                }
                "port" => explicit_port = Some(parse_port(value)?),
                "userid" | "user" | "username" | "uid" => settings.username = value.to_string(),
                "password" | "pwd" => settings.password = value.to_string(),
                "database" | "initialcatalog" => settings.database = Some(value.to_string()),
                "trustservercertificate" => {
                    settings.trust_certificate = parse_bool(key.trim(), value)?;
                }
                _ => log::debug!("Ignoring connection string key '{}'", key.trim()),
            }
        }

        if explicit_port.is_some() {
            settings.port = explicit_port;
        }

        Ok(settings)
    }

    /// `host:port` using `default_port` when none was given
    pub fn address(&self, default_port: u16) -> String {
        format!("{}:{}", self.host, self.port.unwrap_or(default_port))
    }
}

impl fmt::Display for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(database) = &self.database {
            write!(f, "/{}", database)?;
        }
        write!(f, " as '{}'", self.username)
    }
}

fn split_server(value: &str) -> Result<(String, Option<u16>), ConfigError> {
    let value = value.strip_prefix("tcp:").unwrap_or(value);

    if let Some((host, port)) = value.split_once(',') {
        return Ok((host.trim().to_string(), Some(parse_port(port)?)));
    }

    // More than one ':' means a bare IPv6 address
    if value.matches(':').count() == 1 {
        if let Some((host, port)) = value.split_once(':') {
            return Ok((host.to_string(), Some(parse_port(port)?)));
        }
    }

    Ok((value.to_string(), None))
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidPort(value.to_string()))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_expand_replaces_known_variables() {
        let lookup = lookup_from(&[("HOST", "db.local"), ("PASS", "s3cret")]);
        assert_eq!(
            expand_with("Server=%HOST%;Password=%PASS%", lookup),
            "Server=db.local;Password=s3cret"
        );
    }

    #[test]
    fn test_expand_leaves_unknown_placeholder() {
        let lookup = lookup_from(&[("HOST", "db.local")]);
        assert_eq!(
            expand_with("Server=%HOST%;Password=%MISSING%", lookup),
            "Server=db.local;Password=%MISSING%"
        );
    }

    #[test]
    fn test_expand_unknown_name_closing_percent_starts_next() {
        let lookup = lookup_from(&[("B", "x")]);
        assert_eq!(expand_with("%A%B%", lookup), "%Ax");
    }

    #[test]
    fn test_expand_lone_and_empty_percent() {
        let lookup = lookup_from(&[]);
        assert_eq!(expand_with("100%", &lookup), "100%");
        assert_eq!(expand_with("a%%b", &lookup), "a%%b");
    }

    #[test]
    fn test_expand_is_single_pass() {
        let lookup = lookup_from(&[("OUTER", "%INNER%"), ("INNER", "nope")]);
        assert_eq!(expand_with("%OUTER%", lookup), "%INNER%");
    }

    #[test]
    fn test_expand_reads_process_environment() {
        std::env::set_var("CITEST_EXPAND_PROBE", "probe-value");
        assert_eq!(
            expand_environment_variables("x=%CITEST_EXPAND_PROBE%"),
            "x=probe-value"
        );
    }

    #[test]
    fn test_postgres_connection_string_all_set() {
        let lookup = lookup_from(&[
            ("OpenEntity_Postgres_Server", "localhost:5432"),
            ("OpenEntity_Postgres_User", "postgres"),
            ("OpenEntity_Postgres_Password", "pw"),
        ]);
        let conn = Backend::Postgres.adventure_works_lt_with(lookup);
        assert_eq!(
            conn,
            "Server=localhost:5432;UserId=postgres;Password=pw;TrustServerCertificate=true;Database=AdventureWorksLT"
        );
    }

    #[test]
    fn test_sql_server_connection_string_all_set() {
        let lookup = lookup_from(&[
            ("OpenEntity_MSSQL_Server", "localhost,1433"),
            ("OpenEntity_MSSQL_Password", "Passw0rd!"),
        ]);
        let conn = Backend::SqlServer.adventure_works_lt_with(lookup);
        assert_eq!(
            conn,
            "Server=localhost,1433;User Id=sa;Password=Passw0rd!;TrustServerCertificate=true;Database=AdventureWorksLT"
        );
    }

    #[test]
    fn test_missing_variable_keeps_placeholder() {
        let lookup = lookup_from(&[("OpenEntity_MSSQL_Server", "localhost")]);
        let conn = Backend::SqlServer.adventure_works_lt_with(lookup);
        assert!(conn.contains("Password=%OpenEntity_MSSQL_Password%"));
        assert!(conn.ends_with(";Database=AdventureWorksLT"));
    }

    #[test]
    fn test_of_appends_database() {
        let lookup = lookup_from(&[]);
        let conn = Backend::Postgres.of_with("Other", lookup);
        assert!(conn.starts_with("Server=%OpenEntity_Postgres_Server%;"));
        assert!(conn.ends_with(";Database=Other"));
    }

    #[test]
    fn test_parse_postgres_descriptor() {
        let settings = ConnectionSettings::parse(
            "Server=db.local:6543;UserId=app;Password=a=b;TrustServerCertificate=true;Database=AdventureWorksLT",
        )
        .unwrap();
        assert_eq!(settings.host, "db.local");
        assert_eq!(settings.port, Some(6543));
        assert_eq!(settings.username, "app");
        assert_eq!(settings.password, "a=b");
        assert_eq!(settings.database.as_deref(), Some("AdventureWorksLT"));
        assert!(settings.trust_certificate);
    }

    #[test]
    fn test_parse_sql_server_descriptor() {
        let settings = ConnectionSettings::parse(
            "Server=tcp:sql.local,14330;User Id=sa;Password=pw;TrustServerCertificate=false",
        )
        .unwrap();
        assert_eq!(settings.host, "sql.local");
        assert_eq!(settings.port, Some(14330));
        assert_eq!(settings.username, "sa");
        assert!(!settings.trust_certificate);
        assert_eq!(settings.address(1433), "sql.local:14330");
    }

    #[test]
    fn test_parse_host_without_port_and_ipv6() {
        let settings = ConnectionSettings::parse("Server=localhost;Port=5433").unwrap();
        assert_eq!(settings.address(5432), "localhost:5433");

        let settings = ConnectionSettings::parse("Server=::1").unwrap();
        assert_eq!(settings.host, "::1");
        assert_eq!(settings.port, None);
    }

    #[test]
    fn test_parse_unexpanded_server_is_kept_as_host() {
        let settings =
            ConnectionSettings::parse("Server=%OpenEntity_Postgres_Server%;UserId=u").unwrap();
        assert_eq!(settings.host, "%OpenEntity_Postgres_Server%");
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        let err = ConnectionSettings::parse("Server=localhost,abc").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort(_)));
    }

    #[test]
    fn test_parse_rejects_segment_without_equals() {
        let err = ConnectionSettings::parse("Server=localhost;garbage").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedSegment(_)));
    }

    #[test]
    fn test_serialization_skips_password() {
        let settings = ConnectionSettings::parse("Server=h;User=u;Password=secret").unwrap();
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("\"host\":\"h\""));
    }
}
