//! Access to the log table written by the OpenHR20 logging daemon.
//!
//! The daemon appends one row per thermostat report. We never write to the store, and we never
//! hold a connection across polls: every [`LogStore::latest`] call opens its own connection,
//! reads the most recent row for an address and closes the connection again.

use rusqlite::types::Value as SqlValue;
use rusqlite::{OpenFlags, OptionalExtension as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Most recent row for a given address. Column order is owned by the logging daemon.
///
/// `?1` is the address as text and `?2` as an integer when it is one, so the lookup matches
/// whatever affinity the `addr` column was declared with.
pub const LATEST_ROW_QUERY: &str =
    "SELECT * FROM log WHERE addr IN (?1, ?2) ORDER BY time DESC LIMIT 1";

/// Number of positional columns a log row must carry.
pub const COLUMNS: usize = 11;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the log database at {1:?}")]
    Open(#[source] rusqlite::Error, PathBuf),
    #[error("could not configure the connection to {1:?}")]
    Configure(#[source] rusqlite::Error, PathBuf),
    #[error("could not query the latest row for address `{1}`")]
    Query(#[source] rusqlite::Error, String),
    #[error("the blocking fetch task did not complete")]
    FetchTask(#[source] tokio::task::JoinError),
    #[error("the log table has {0} columns, at least 11 are required")]
    MissingColumns(usize),
    #[error("column {index} ({name}) holds {found}, expected {expected}")]
    ColumnType {
        index: usize,
        name: &'static str,
        found: &'static str,
        expected: &'static str,
    },
    #[error("row timestamp {0} is out of range")]
    Timestamp(i64, #[source] jiff::Error),
}

impl Error {
    /// The store could not be reached: missing, locked, corrupt or not permitted.
    pub fn is_storage_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Open(..) | Error::Configure(..) | Error::Query(..) | Error::FetchTask(..)
        )
    }

    /// A row was read, but it does not have the shape of a thermostat log row.
    pub fn is_malformed_row(&self) -> bool {
        !self.is_storage_unavailable()
    }
}

/// One row of the `log` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRow {
    pub address: String,
    pub id: i64,
    pub time: jiff::Timestamp,
    pub mode: String,
    pub valve_percent_open: i64,
    /// Hundredths of a degree Celsius.
    pub current_temp_centi: i64,
    /// Hundredths of a degree Celsius.
    pub target_temp_centi: i64,
    pub battery_millivolts: i64,
    pub error_flag_raw: i64,
    pub window_open_raw: i64,
    pub force_raw: i64,
}

const COLUMN_NAMES: [&str; COLUMNS] = [
    "addr", "id", "time", "mode", "valve", "real_temp", "wanted_temp", "battery", "error",
    "window_open", "force_flag",
];

impl TryFrom<Vec<SqlValue>> for LogRow {
    type Error = Error;

    fn try_from(columns: Vec<SqlValue>) -> Result<Self, Self::Error> {
        if columns.len() < COLUMNS {
            return Err(Error::MissingColumns(columns.len()));
        }
        let int = |index: usize| integer_column(index, &columns[index]);
        let time = int(2)?;
        Ok(LogRow {
            address: text_column(0, &columns[0])?,
            id: int(1)?,
            time: jiff::Timestamp::from_second(time).map_err(|e| Error::Timestamp(time, e))?,
            mode: text_column(3, &columns[3])?,
            valve_percent_open: int(4)?,
            current_temp_centi: int(5)?,
            target_temp_centi: int(6)?,
            battery_millivolts: int(7)?,
            error_flag_raw: int(8)?,
            window_open_raw: int(9)?,
            force_raw: int(10)?,
        })
    }
}

fn type_name(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Null => "null",
        SqlValue::Integer(_) => "an integer",
        SqlValue::Real(_) => "a real",
        SqlValue::Text(_) => "text",
        SqlValue::Blob(_) => "a blob",
    }
}

fn integer_column(index: usize, value: &SqlValue) -> Result<i64, Error> {
    match value {
        SqlValue::Integer(v) => return Ok(*v),
        SqlValue::Real(v)
            if v.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(v) =>
        {
            return Ok(*v as i64);
        }
        SqlValue::Text(t) => {
            if let Ok(v) = t.trim().parse() {
                return Ok(v);
            }
        }
        _ => {}
    }
    Err(Error::ColumnType {
        index,
        name: COLUMN_NAMES[index],
        found: type_name(value),
        expected: "an integer",
    })
}

// The daemon stores addresses as integers and modes as single characters, but either may
// appear as the other depending on how the table was created.
fn text_column(index: usize, value: &SqlValue) -> Result<String, Error> {
    match value {
        SqlValue::Text(t) => Ok(t.clone()),
        SqlValue::Integer(v) => Ok(v.to_string()),
        _ => Err(Error::ColumnType {
            index,
            name: COLUMN_NAMES[index],
            found: type_name(value),
            expected: "text",
        }),
    }
}

/// Source of the most recent log row for a thermostat.
pub trait LogStore: Send + Sync {
    fn latest(&self, address: &str) -> Result<Option<LogRow>, Error>;
}

/// The SQLite database maintained by the logging daemon.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<rusqlite::Connection, Error> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = rusqlite::Connection::open_with_flags(&self.path, flags)
            .map_err(|e| Error::Open(e, self.path.clone()))?;
        // The daemon may be mid-write. Report that as a failed poll instead of waiting.
        connection
            .busy_timeout(Duration::ZERO)
            .map_err(|e| Error::Configure(e, self.path.clone()))?;
        Ok(connection)
    }
}

impl LogStore for SqliteStore {
    fn latest(&self, address: &str) -> Result<Option<LogRow>, Error> {
        let connection = self.connect()?;
        let columns = read_latest(&connection, address);
        if let Err((_, e)) = connection.close() {
            tracing::warn!(
                path = ?self.path,
                error = (&e as &dyn std::error::Error),
                "could not cleanly close the log database"
            );
        }
        columns?.map(LogRow::try_from).transpose()
    }
}

fn read_latest(
    connection: &rusqlite::Connection,
    address: &str,
) -> Result<Option<Vec<SqlValue>>, Error> {
    let query_error = |e: rusqlite::Error| Error::Query(e, address.to_string());
    let mut statement = connection.prepare(LATEST_ROW_QUERY).map_err(query_error)?;
    let column_count = statement.column_count();
    if column_count < COLUMNS {
        return Err(Error::MissingColumns(column_count));
    }
    let numeric = match address.trim().parse::<i64>() {
        Ok(v) => SqlValue::Integer(v),
        Err(_) => SqlValue::Text(address.to_string()),
    };
    statement
        .query_row(rusqlite::params![address, numeric], |row| {
            (0..COLUMNS)
                .map(|idx| row.get::<_, SqlValue>(idx))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .optional()
        .map_err(query_error)
}

/// [`LogStore::latest`] on the blocking thread pool.
pub async fn fetch_latest<S: LogStore + ?Sized + 'static>(
    store: Arc<S>,
    address: String,
) -> Result<Option<LogRow>, Error> {
    tokio::task::spawn_blocking(move || store.latest(&address))
        .await
        .map_err(Error::FetchTask)?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CREATE_LOG_TABLE: &str = "CREATE TABLE log (
        addr INTEGER NOT NULL,
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        time INTEGER NOT NULL,
        mode TEXT,
        valve INTEGER,
        real_temp INTEGER,
        wanted_temp INTEGER,
        battery INTEGER,
        error INTEGER,
        window_open INTEGER,
        force_flag INTEGER
    )";

    pub(crate) fn create_store(dir: &tempfile::TempDir) -> (SqliteStore, rusqlite::Connection) {
        let path = dir.path().join("openhr20.sqlite");
        let connection = rusqlite::Connection::open(&path).unwrap();
        connection.execute_batch(CREATE_LOG_TABLE).unwrap();
        (SqliteStore::new(path), connection)
    }

    pub(crate) fn insert(connection: &rusqlite::Connection, addr: i64, time: i64, battery: i64) {
        connection
            .execute(
                "INSERT INTO log (addr, time, mode, valve, real_temp, wanted_temp, battery, error,
                                  window_open, force_flag)
                 VALUES (?1, ?2, 'I', 42, 2150, 2200, ?3, 0, 0, 1)",
                [addr, time, battery],
            )
            .unwrap();
    }

    #[test]
    fn latest_row_is_the_most_recent_for_the_address() {
        let dir = tempfile::tempdir().unwrap();
        let (store, connection) = create_store(&dir);
        insert(&connection, 10, 1000, 2950);
        insert(&connection, 10, 1200, 2300);
        insert(&connection, 10, 1100, 2100);
        insert(&connection, 11, 5000, 2000);

        let row = store.latest("10").unwrap().unwrap();
        assert_eq!(row.address, "10");
        assert_eq!(row.time, jiff::Timestamp::from_second(1200).unwrap());
        assert_eq!(row.battery_millivolts, 2300);
        assert_eq!(row.mode, "I");
        assert_eq!(row.valve_percent_open, 42);
        assert_eq!(row.current_temp_centi, 2150);
        assert_eq!(row.target_temp_centi, 2200);
        assert_eq!(row.force_raw, 1);
    }

    #[test]
    fn unknown_address_has_no_row() {
        let dir = tempfile::tempdir().unwrap();
        let (store, connection) = create_store(&dir);
        insert(&connection, 10, 1000, 2950);
        assert_eq!(store.latest("12").unwrap(), None);
    }

    #[test]
    fn missing_file_is_storage_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("does-not-exist.sqlite"));
        let err = store.latest("10").unwrap_err();
        assert!(err.is_storage_unavailable(), "{err:?}");
        assert!(!dir.path().join("does-not-exist.sqlite").exists());
    }

    #[test]
    fn missing_table_is_storage_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sqlite");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE other (x INTEGER)")
            .unwrap();
        let err = SqliteStore::new(path).latest("10").unwrap_err();
        assert!(err.is_storage_unavailable(), "{err:?}");
    }

    #[test]
    fn locked_store_is_storage_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let (store, connection) = create_store(&dir);
        insert(&connection, 10, 1000, 2950);
        connection.execute_batch("BEGIN EXCLUSIVE").unwrap();
        let err = store.latest("10").unwrap_err();
        assert!(err.is_storage_unavailable(), "{err:?}");
        connection.execute_batch("COMMIT").unwrap();
        assert!(store.latest("10").unwrap().is_some());
    }

    #[test]
    fn short_table_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.sqlite");
        let connection = rusqlite::Connection::open(&path).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE log (addr INTEGER, id INTEGER, time INTEGER, mode TEXT);
                 INSERT INTO log VALUES (10, 1, 1000, 'I');",
            )
            .unwrap();
        let err = SqliteStore::new(path).latest("10").unwrap_err();
        assert!(matches!(err, Error::MissingColumns(4)), "{err:?}");
        assert!(err.is_malformed_row());
    }

    #[test]
    fn non_numeric_column_is_malformed() {
        let mut columns = vec![
            SqlValue::Text("10".into()),
            SqlValue::Integer(1),
            SqlValue::Integer(1000),
            SqlValue::Text("I".into()),
            SqlValue::Integer(42),
            SqlValue::Text("warm".into()),
            SqlValue::Integer(2200),
            SqlValue::Integer(2950),
            SqlValue::Integer(0),
            SqlValue::Integer(0),
            SqlValue::Integer(1),
        ];
        let err = LogRow::try_from(columns.clone()).unwrap_err();
        assert!(matches!(err, Error::ColumnType { index: 5, .. }), "{err:?}");
        assert!(err.is_malformed_row());

        columns[5] = SqlValue::Real(2150.5);
        let err = LogRow::try_from(columns.clone()).unwrap_err();
        assert!(matches!(err, Error::ColumnType { index: 5, .. }), "{err:?}");

        columns[5] = SqlValue::Text("2150".into());
        let row = LogRow::try_from(columns.clone()).unwrap();
        assert_eq!(row.current_temp_centi, 2150);

        columns[4] = SqlValue::Real(42.0);
        columns[5] = SqlValue::Real(2150.0);
        let row = LogRow::try_from(columns).unwrap();
        assert_eq!(row.valve_percent_open, 42);
        assert_eq!(row.current_temp_centi, 2150);
    }

    #[test]
    fn real_columns_are_read_from_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let (store, connection) = create_store(&dir);
        connection
            .execute_batch(
                "INSERT INTO log (addr, time, mode, valve, real_temp, wanted_temp, battery, error,
                                  window_open, force_flag)
                 VALUES (10, 1000, 'I', 42.0, 2150.0, 2200.0, 2950.0, 0, 0, 1)",
            )
            .unwrap();
        let row = store.latest("10").unwrap().unwrap();
        assert_eq!(row.valve_percent_open, 42);
        assert_eq!(row.target_temp_centi, 2200);
        assert_eq!(row.battery_millivolts, 2950);
    }

    #[test]
    fn untyped_address_column_matches_either_storage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("untyped.sqlite");
        let connection = rusqlite::Connection::open(&path).unwrap();
        connection
            .execute_batch(
                "CREATE TABLE log (addr, id, time, mode, valve, real_temp, wanted_temp, battery,
                                   error, window_open, force_flag);
                 INSERT INTO log VALUES (10, 1, 1000, 'I', 42, 2150, 2200, 2950, 0, 0, 1);
                 INSERT INTO log VALUES ('11', 2, 1000, 'M', 10, 1900, 2000, 2700, 0, 1, 0);
                 INSERT INTO log VALUES ('hall', 3, 1000, 'A', 0, 1800, 1700, 2500, 1, 0, 0);",
            )
            .unwrap();
        let store = SqliteStore::new(path);
        assert_eq!(store.latest("10").unwrap().map(|r| r.id), Some(1));
        assert_eq!(store.latest("11").unwrap().map(|r| r.id), Some(2));
        assert_eq!(store.latest("hall").unwrap().map(|r| r.id), Some(3));
        assert_eq!(store.latest("12").unwrap(), None);
    }

    #[tokio::test]
    async fn fetch_latest_runs_off_the_executor() {
        let dir = tempfile::tempdir().unwrap();
        let (store, connection) = create_store(&dir);
        insert(&connection, 10, 1000, 2950);
        let row = fetch_latest(Arc::new(store), "10".to_string()).await.unwrap();
        assert_eq!(row.map(|r| r.battery_millivolts), Some(2950));
    }
}
