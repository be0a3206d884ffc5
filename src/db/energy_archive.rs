use std::{
    thread,
    time::{Duration, Instant},
};

use duckdb::{params_from_iter, types::Value, Connection};
use itertools::Itertools;
use jiff::Timestamp;
use log::{debug, info, warn};

use crate::{
    error::SyncError,
    reading::{dedup, ConflictPolicy, Reading, Series},
};

/// A DuckDB file is locked by whichever process has it open.
const OPEN_ATTEMPTS: u32 = 8;
const OPEN_BACKOFF: Duration = Duration::from_millis(25);

/// Consumption, production and spot prices, one table each.
/// Times are stored as UTC `TIMESTAMP`s with millisecond precision.
pub struct EnergyArchive {
    conn: Connection,
}

impl EnergyArchive {
    /// Open (or create) the archive file.  While another process holds the
    /// file lock, retry with a doubling backoff.
    pub fn open(duckdb_path: &str) -> Result<EnergyArchive, SyncError> {
        EnergyArchive::open_with_backoff(duckdb_path, OPEN_ATTEMPTS, OPEN_BACKOFF)
    }

    fn open_with_backoff(
        duckdb_path: &str,
        attempts: u32,
        backoff: Duration,
    ) -> Result<EnergyArchive, SyncError> {
        info!("Opening energy archive at [{}]", duckdb_path);
        let mut wait = backoff;
        for attempt in 1..=attempts {
            match Connection::open(duckdb_path) {
                Ok(conn) => return EnergyArchive::from_connection(conn),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Energy archive [{}] unavailable ({}), retry {} of {} in {:?}",
                        duckdb_path,
                        e,
                        attempt,
                        attempts - 1,
                        wait
                    );
                    thread::sleep(wait);
                    wait *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(SyncError::Persistence(format!(
            "energy archive [{}] not opened",
            duckdb_path
        )))
    }

    pub fn open_in_memory() -> Result<EnergyArchive, SyncError> {
        EnergyArchive::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<EnergyArchive, SyncError> {
        let archive = EnergyArchive { conn };
        archive.create_tables()?;
        Ok(archive)
    }

    pub fn create_tables(&self) -> Result<(), SyncError> {
        let sql = format!(
            r#"
CREATE TABLE IF NOT EXISTS {} (
    "time" TIMESTAMP PRIMARY KEY,
    value DOUBLE NOT NULL,
);
CREATE TABLE IF NOT EXISTS {} (
    "time" TIMESTAMP PRIMARY KEY,
    value DOUBLE NOT NULL,
);
CREATE TABLE IF NOT EXISTS {} (
    "time" TIMESTAMP PRIMARY KEY,
    price DOUBLE NOT NULL,
);
"#,
            Series::Consumption.table_name(),
            Series::Production.table_name(),
            Series::SpotPrice.table_name(),
        );
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    /// The latest timestamp stored for the series, `None` if it is empty.
    pub fn watermark(&self, series: Series) -> Result<Option<Timestamp>, SyncError> {
        let query = format!(
            r#"SELECT epoch_ms(max("time")) FROM {};"#,
            series.table_name()
        );
        debug!("Executing query: {}", query);
        let ms: Option<i64> = self.conn.query_row(&query, [], |row| row.get(0))?;
        ms.map(to_timestamp).transpose()
    }

    /// Upsert readings into the series table.
    ///
    /// Readings sharing a timestamp are aggregated first (see
    /// [`Series::aggregation`]).  Existing rows are then either overwritten
    /// or kept, depending on [`Series::conflict_policy`].  All rows go in
    /// with one statement in one transaction.  Returns the number of rows
    /// submitted after de-duplication.
    pub fn merge(&mut self, series: Series, readings: &[Reading]) -> Result<usize, SyncError> {
        if readings.is_empty() {
            return Ok(0);
        }
        let rows = dedup(readings, series.aggregation());
        let conflict = match series.conflict_policy() {
            ConflictPolicy::Overwrite => format!(
                "DO UPDATE SET {col} = excluded.{col}",
                col = series.value_column()
            ),
            ConflictPolicy::KeepExisting => "DO NOTHING".to_string(),
        };
        let sql = format!(
            r#"
INSERT INTO {table} ("time", {col})
SELECT epoch_ms(v.ms), v.x
FROM (VALUES {values}) AS v(ms, x)
ON CONFLICT ("time") {conflict};"#,
            table = series.table_name(),
            col = series.value_column(),
            values = rows.iter().map(|_| "(?::BIGINT, ?::DOUBLE)").join(", "),
            conflict = conflict,
        );
        let values = rows
            .iter()
            .flat_map(|r| [Value::BigInt(r.timestamp.as_millisecond()), Value::Double(r.value)]);

        info!("Inserting {} {} records", rows.len(), series);
        let start = Instant::now();
        let tx = self.conn.transaction()?;
        tx.execute(&sql, params_from_iter(values))?;
        tx.commit()?;
        info!(
            "Inserting {} {} records took {:?}",
            rows.len(),
            series,
            start.elapsed()
        );
        Ok(rows.len())
    }

    /// Stored readings strictly after `after`, sorted by time.
    pub fn readings(
        &self,
        series: Series,
        after: Option<Timestamp>,
    ) -> Result<Vec<Reading>, SyncError> {
        let mut query = format!(
            r#"
SELECT epoch_ms("time"), {col}
FROM {table}"#,
            col = series.value_column(),
            table = series.table_name(),
        );
        if let Some(after) = after {
            query.push_str(&format!(
                r#"
WHERE "time" > epoch_ms({})"#,
                after.as_millisecond()
            ));
        }
        query.push_str(
            r#"
ORDER BY "time";"#,
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<usize, i64>(0)?, row.get::<usize, f64>(1)?))
        })?;
        let mut readings = Vec::new();
        for row in rows {
            let (ms, value) = row?;
            readings.push(Reading::new(to_timestamp(ms)?, value));
        }
        Ok(readings)
    }

    pub fn count(&self, series: Series) -> Result<usize, SyncError> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT count(*) FROM {};", series.table_name()),
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn to_timestamp(ms: i64) -> Result<Timestamp, SyncError> {
    Timestamp::from_millisecond(ms)
        .map_err(|e| SyncError::Persistence(format!("stored time {} out of range: {}", ms, e)))
}
