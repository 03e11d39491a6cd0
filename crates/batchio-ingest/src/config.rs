//! Job configuration
//!
//! Settings travel as a flat key/value map ([`JobProperties`]) so a job can be
//! described in one place and handed to every task unchanged. [`SinkConfig`]
//! is the typed view of the `batchio.sink.*` keys.

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::collections::BTreeMap;
use tracing::warn;

use crate::sink::{SinkError, SqlType};

// ============================================================================
// Configuration Keys
// ============================================================================

pub const SINK_HOST_KEY: &str = "batchio.sink.host";
pub const SINK_PORT_KEY: &str = "batchio.sink.port";
pub const SINK_DATABASE_KEY: &str = "batchio.sink.database";
pub const SINK_TABLE_KEY: &str = "batchio.sink.table";
pub const SINK_USER_KEY: &str = "batchio.sink.user";
pub const SINK_PASSWORD_KEY: &str = "batchio.sink.password";
pub const SINK_DELIMITER_KEY: &str = "batchio.sink.delimiter";
pub const SINK_TYPES_KEY: &str = "batchio.sink.types";
pub const SINK_ARITY_KEY: &str = "batchio.sink.on_arity_mismatch";
pub const SINK_HEALTH_CHECK_KEY: &str = "batchio.sink.health_check_interval";

/// Key naming the JSON property that marks a record
pub const JSON_RECORD_IDENTIFIER_KEY: &str = "batchio.json.record_identifier";

/// When `true`, JSON input holds one document per line and is read with the line framer
pub const JSON_ONE_RECORD_PER_LINE_KEY: &str = "batchio.json.one_record_per_line";

/// Largest file, in bytes, the whole-file reader accepts
pub const WHOLE_FILE_MAX_LEN_KEY: &str = "batchio.whole_file.max_len";

// ============================================================================
// Defaults
// ============================================================================

/// Default Postgres port.
pub const DEFAULT_SINK_PORT: u16 = 5432;

/// Default field delimiter.
pub const DEFAULT_SINK_DELIMITER: &str = "|";

/// Default number of writes between connection liveness checks (every write).
pub const DEFAULT_HEALTH_CHECK_INTERVAL: u64 = 1;

/// Flat job configuration, one value per key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProperties(BTreeMap<String, String>);

impl JobProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for JobProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// What the sink does with a row whose token count differs from the column count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArityPolicy {
    /// Drop the row and count it
    #[default]
    Skip,
    /// Fail the write
    Fail,
}

impl std::str::FromStr for ArityPolicy {
    type Err = SinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "skip" => Ok(ArityPolicy::Skip),
            "fail" => Ok(ArityPolicy::Fail),
            other => Err(SinkError::Config(format!(
                "Unknown arity policy '{}', expected 'skip' or 'fail'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ArityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArityPolicy::Skip => write!(f, "skip"),
            ArityPolicy::Fail => write!(f, "fail"),
        }
    }
}

/// Destination of a sink, loaded once per task
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub table: String,
    /// Left to the driver's defaults (`PGUSER`, the OS user) when unset
    pub user: Option<String>,
    pub password: Option<String>,
    pub delimiter: String,
    pub column_types: Vec<SqlType>,
    pub on_arity_mismatch: ArityPolicy,
    pub health_check_interval: u64,
}

impl std::fmt::Debug for SinkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("table", &self.table)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("delimiter", &self.delimiter)
            .field("column_types", &self.column_types)
            .field("on_arity_mismatch", &self.on_arity_mismatch)
            .field("health_check_interval", &self.health_check_interval)
            .finish()
    }
}

impl SinkConfig {
    /// Config with defaults for everything but the destination
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        table: impl Into<String>,
        column_types: Vec<SqlType>,
    ) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SINK_PORT,
            database: database.into(),
            table: table.into(),
            user: None,
            password: None,
            delimiter: DEFAULT_SINK_DELIMITER.to_string(),
            column_types,
            on_arity_mismatch: ArityPolicy::default(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Read and validate the `batchio.sink.*` keys
    pub fn from_properties(props: &JobProperties) -> Result<Self, SinkError> {
        let text = |key: &str| props.get(key).unwrap_or_default().trim().to_string();
        let optional = |key: &str| props.get(key).filter(|v| !v.trim().is_empty()).map(str::to_string);

        let port = match props.get(SINK_PORT_KEY).map(str::trim) {
            None | Some("") => DEFAULT_SINK_PORT,
            Some(raw) => raw
                .parse()
                .map_err(|_| SinkError::Config(format!("Invalid {}: '{}'", SINK_PORT_KEY, raw)))?,
        };

        let delimiter = match props.get(SINK_DELIMITER_KEY) {
            None | Some("") => DEFAULT_SINK_DELIMITER.to_string(),
            Some(raw) => raw.to_string(),
        };

        let column_types = match props.get(SINK_TYPES_KEY) {
            Some(raw) => SqlType::parse_list(raw)?,
            None => Vec::new(),
        };

        let on_arity_mismatch = match props.get(SINK_ARITY_KEY) {
            Some(raw) => raw.parse()?,
            None => ArityPolicy::default(),
        };

        let health_check_interval = match props.get(SINK_HEALTH_CHECK_KEY).map(str::trim) {
            None | Some("") => DEFAULT_HEALTH_CHECK_INTERVAL,
            Some(raw) => raw.parse().map_err(|_| {
                SinkError::Config(format!("Invalid {}: '{}'", SINK_HEALTH_CHECK_KEY, raw))
            })?,
        };

        let config = Self {
            host: text(SINK_HOST_KEY),
            port,
            database: text(SINK_DATABASE_KEY),
            table: text(SINK_TABLE_KEY),
            user: optional(SINK_USER_KEY).map(|user| user.trim().to_string()),
            password: optional(SINK_PASSWORD_KEY),
            delimiter,
            column_types,
            on_arity_mismatch,
            health_check_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Inverse of [`from_properties`](Self::from_properties)
    pub fn to_properties(&self) -> JobProperties {
        let mut props = JobProperties::new();
        props.set(SINK_HOST_KEY, &self.host);
        props.set(SINK_PORT_KEY, self.port.to_string());
        props.set(SINK_DATABASE_KEY, &self.database);
        props.set(SINK_TABLE_KEY, &self.table);
        if let Some(ref user) = self.user {
            props.set(SINK_USER_KEY, user);
        }
        if let Some(ref password) = self.password {
            props.set(SINK_PASSWORD_KEY, password);
        }
        props.set(SINK_DELIMITER_KEY, &self.delimiter);
        props.set(SINK_TYPES_KEY, SqlType::join_codes(&self.column_types));
        props.set(SINK_ARITY_KEY, self.on_arity_mismatch.to_string());
        props.set(SINK_HEALTH_CHECK_KEY, self.health_check_interval.to_string());
        props
    }

    /// Load from `BATCHIO_SINK_*` environment variables (and `.env`)
    pub fn from_env() -> Result<Self, SinkError> {
        dotenvy::dotenv().ok();

        let vars = [
            ("BATCHIO_SINK_HOST", SINK_HOST_KEY),
            ("BATCHIO_SINK_PORT", SINK_PORT_KEY),
            ("BATCHIO_SINK_DATABASE", SINK_DATABASE_KEY),
            ("BATCHIO_SINK_TABLE", SINK_TABLE_KEY),
            ("BATCHIO_SINK_USER", SINK_USER_KEY),
            ("BATCHIO_SINK_PASSWORD", SINK_PASSWORD_KEY),
            ("BATCHIO_SINK_DELIMITER", SINK_DELIMITER_KEY),
            ("BATCHIO_SINK_TYPES", SINK_TYPES_KEY),
            ("BATCHIO_SINK_ON_ARITY_MISMATCH", SINK_ARITY_KEY),
            ("BATCHIO_SINK_HEALTH_CHECK_INTERVAL", SINK_HEALTH_CHECK_KEY),
        ];

        let props: JobProperties = vars
            .iter()
            .filter_map(|(var, key)| std::env::var(var).ok().map(|v| (*key, v)))
            .collect();

        Self::from_properties(&props)
    }

    /// Check every required field. Runs before any connection is attempted.
    ///
    /// Credentials are optional; a user without a password or the reverse is
    /// allowed but logged.
    pub fn validate(&self) -> Result<(), SinkError> {
        let required = [
            ("host", &self.host),
            ("database", &self.database),
            ("table", &self.table),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(SinkError::Config(format!(
                "Missing required sink settings: {}",
                missing.join(", ")
            )));
        }

        if self.port == 0 {
            return Err(SinkError::Config("Sink port must be greater than 0".to_string()));
        }

        if self.delimiter.is_empty() {
            return Err(SinkError::Config("Sink delimiter cannot be empty".to_string()));
        }

        if self.column_types.is_empty() {
            return Err(SinkError::Config("Sink column types cannot be empty".to_string()));
        }

        if !is_table_name(&self.table) {
            return Err(SinkError::Config(format!("Invalid table name: '{}'", self.table)));
        }

        match (&self.user, &self.password) {
            (Some(user), None) => warn!(user = %user, "Sink user set without a password"),
            (None, Some(_)) => warn!("Sink password set without a user"),
            _ => {},
        }

        Ok(())
    }

    /// Connection options for sqlx
    pub fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database);
        if let Some(ref user) = self.user {
            options = options.username(user);
        }
        if let Some(ref password) = self.password {
            options = options.password(password);
        }
        options
    }
}

/// `name` or `schema.name`, each part an unquoted identifier
fn is_table_name(table: &str) -> bool {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    })
}
