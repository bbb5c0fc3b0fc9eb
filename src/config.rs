use crate::entity::{DeviceIdentity, Policy, Thermostat};
use crate::store::SqliteStore;
use rusqlite::OpenFlags;
use std::path::{Path, PathBuf};

/// Configuration problems the user has to fix before anything is polled.
#[derive(thiserror::Error, Debug, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ValidationError {
    #[error("database file {0:?} not found")]
    NotFound(PathBuf),
    #[error("database file {1:?} is not readable")]
    NotReadable(#[source] std::io::Error, PathBuf),
    #[error("database file {1:?} is not writable")]
    NotWritable(#[source] std::io::Error, PathBuf),
    #[error("could not connect to the database at {1:?}")]
    ConnectFailed(#[source] rusqlite::Error, PathBuf),
    #[error("thermostat `{0}` is not in the `<address>=<name>` form")]
    InvalidThermostat(String),
}

impl ValidationError {
    /// Stable reason code, e.g. `not_found`.
    pub fn reason(&self) -> &'static str {
        self.into()
    }
}

/// Check that `path` is an existing SQLite database we can read and write.
///
/// The trial connection is closed right away. Polls open their own connections.
pub fn validate_store(path: &Path) -> Result<(), ValidationError> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => {}
        _ => return Err(ValidationError::NotFound(path.to_path_buf())),
    }
    std::fs::File::open(path).map_err(|e| ValidationError::NotReadable(e, path.to_path_buf()))?;
    std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| ValidationError::NotWritable(e, path.to_path_buf()))?;
    tracing::debug!(?path, "trying to connect to the database");
    let connect_failed = |e: rusqlite::Error| ValidationError::ConnectFailed(e, path.to_path_buf());
    let connection =
        rusqlite::Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .map_err(connect_failed)?;
    // Opening is lazy. Reading the schema is what fails on files that are not databases.
    connection
        .query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0))
        .map_err(connect_failed)?;
    connection.close().map_err(|(_, e)| connect_failed(e))?;
    tracing::debug!(?path, "database connection successful");
    Ok(())
}

/// A configured thermostat: `<address>=<name>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThermostatSpec {
    pub address: String,
    pub name: String,
}

impl std::str::FromStr for ThermostatSpec {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ValidationError::InvalidThermostat(s.to_string());
        let (address, name) = s.split_once('=').ok_or_else(invalid)?;
        let (address, name) = (address.trim(), name.trim());
        if address.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            address: address.to_string(),
            name: name.to_string(),
        })
    }
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "config::Args")]
pub struct Args {
    /// Path to the SQLite database maintained by the OpenHR20 logging daemon.
    #[arg(long, short = 'd')]
    pub database: PathBuf,

    /// A thermostat to expose, as `<address>=<name>` (e.g. `10=bedroom`).
    ///
    /// May be given multiple times.
    #[arg(long = "thermostat", short = 't', required = true)]
    pub thermostats: Vec<ThermostatSpec>,

    /// How often the database is polled for new rows.
    ///
    /// Values are reported unavailable when the latest row is older than three intervals.
    #[arg(long, default_value = "1m")]
    pub poll_interval: humantime::Duration,

    /// Report values as available before the first fresh row has been read.
    #[arg(long)]
    pub initially_available: bool,
}

impl Args {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_store(&self.database)
    }

    pub fn store(&self) -> SqliteStore {
        SqliteStore::new(&self.database)
    }

    pub fn policy(&self) -> Policy {
        Policy {
            poll_interval: *self.poll_interval,
            initially_available: self.initially_available,
        }
    }

    pub fn thermostats(&self) -> Vec<Thermostat> {
        self.thermostats
            .iter()
            .map(|spec| {
                let identity = DeviceIdentity::new(spec.address.clone(), spec.name.clone());
                Thermostat::new(identity, self.policy())
            })
            .collect()
    }
}
