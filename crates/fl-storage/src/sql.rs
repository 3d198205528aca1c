//! SQL construction for the readings table
//!
//! The table name is the only piece of user input that is ever interpolated
//! into SQL. It is validated at construction, before any statement is built
//! or executed, and always emitted as a quoted identifier. Every value
//! travels through bind parameters.

use fl_config::validate_table_name;

use crate::writer::StorageError;

const COLUMNS: &str =
    "timestamp, device_id, channel, raw_value, processed_value, rate, quality, unit";

const UPSERT_CLAUSE: &str = "ON CONFLICT (timestamp, device_id, channel) DO UPDATE SET \
     raw_value = EXCLUDED.raw_value, \
     processed_value = EXCLUDED.processed_value, \
     rate = EXCLUDED.rate, \
     quality = EXCLUDED.quality, \
     unit = EXCLUDED.unit";

/// Statement factory bound to one validated table name.
#[derive(Debug, Clone)]
pub struct ReadingsSql {
    table: String,
}

impl ReadingsSql {
    /// Fails before any SQL exists when the table name is not a clean
    /// identifier or shadows a reserved keyword.
    pub fn new(table_name: &str) -> Result<Self, StorageError> {
        validate_table_name(table_name).map_err(StorageError::TableName)?;
        Ok(Self {
            table: table_name.to_string(),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.table)
    }

    pub fn create_table(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                 timestamp TIMESTAMPTZ NOT NULL, \
                 device_id TEXT NOT NULL, \
                 channel INTEGER NOT NULL, \
                 raw_value BIGINT NOT NULL, \
                 processed_value DOUBLE PRECISION NOT NULL, \
                 rate DOUBLE PRECISION, \
                 quality TEXT NOT NULL, \
                 unit TEXT NOT NULL DEFAULT 'counts', \
                 PRIMARY KEY (timestamp, device_id, channel)\
             )",
            self.quoted()
        )
    }

    /// Chunked by the hour; `if_not_exists` makes re-registration a no-op.
    pub fn create_hypertable(&self) -> String {
        format!(
            "SELECT create_hypertable('{}', 'timestamp', \
             chunk_time_interval => INTERVAL '1 hour', if_not_exists => TRUE)",
            self.table
        )
    }

    pub fn timescaledb_installed() -> &'static str {
        "SELECT COUNT(*) FROM pg_extension WHERE extname = 'timescaledb'"
    }

    /// Parameterized multi-row upsert for small batches (8 binds per row).
    pub fn multi_row_insert(&self, rows: usize) -> String {
        debug_assert!(rows > 0);
        let mut values = String::new();
        for row in 0..rows {
            if row > 0 {
                values.push_str(", ");
            }
            let base = row * 8;
            values.push_str(&format!(
                "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6,
                base + 7,
                base + 8
            ));
        }
        format!(
            "INSERT INTO {} ({COLUMNS}) VALUES {values} {UPSERT_CLAUSE}",
            self.quoted()
        )
    }

    /// Bulk path: one statement, eight array binds, rows expanded by UNNEST.
    /// The extended protocol ships the arrays in binary; NULL is permitted
    /// only in `rate`.
    pub fn bulk_unnest_insert(&self) -> String {
        format!(
            "INSERT INTO {} ({COLUMNS}) \
             SELECT * FROM UNNEST(\
                 $1::timestamptz[], $2::text[], $3::int4[], $4::int8[], \
                 $5::float8[], $6::float8[], $7::text[], $8::text[]\
             ) {UPSERT_CLAUSE}",
            self.quoted()
        )
    }
}
