use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::actuator::ActuatorState;
use crate::bus::Quantity;
use crate::error::Fault;
use crate::settings::{Param, ParamValue, Settings};

/// Rows per INSERT statement; keeps bound parameters under SQLite's limit.
const INSERT_CHUNK: usize = 40;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One tick's sensor and actuator values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRow {
    pub ts: i64,
    pub values: [u8; Quantity::COUNT],
    pub status: u8,
    pub actuators: ActuatorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Information,
    Status,
    Warning,
    Error,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LogKind::Information => "Information",
            LogKind::Status => "Status",
            LogKind::Warning => "Warning",
            LogKind::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    pub ts: i64,
    /// Subsystem tag, e.g. `WAT` for watering or `NET` for remote commands.
    pub instance: String,
    pub kind: LogKind,
    pub name: String,
    pub details: String,
}

impl LogRow {
    pub fn new(instance: &str, kind: LogKind, name: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            ts: OffsetDateTime::now_utc().unix_timestamp(),
            instance: instance.to_string(),
            kind,
            name: name.into(),
            details: details.into(),
        }
    }

    pub fn from_fault(instance: &str, fault: &Fault) -> Self {
        let kind = if fault.is_error() {
            LogKind::Error
        } else {
            LogKind::Warning
        };
        Self::new(instance, kind, fault.category(), fault.to_string())
    }
}

/// Result of [`Db::load_settings`].
#[derive(Debug)]
pub struct LoadedSettings {
    pub settings: Settings,
    /// One per key that fell back to its default.
    pub faults: Vec<Fault>,
    /// Rows present in the store, usable or not.
    pub stored: usize,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/watering/watering.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to ":memory:" is its own database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Settings store
    // ----------------------------

    /// Load every setting. Missing or unusable keys fall back to their
    /// defaults and are reported as faults rather than failing the load.
    pub async fn load_settings(&self) -> Result<LoadedSettings> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await
            .context("load_settings failed")?;

        // A value column holding something other than an integer is a bad
        // setting, not a failed load.
        let mut stored: HashMap<String, Result<i64, String>> = HashMap::new();
        for row in &rows {
            match row.try_get::<String, _>("key") {
                Ok(key) => {
                    let value = row
                        .try_get::<i64, _>("value")
                        .map_err(|e| format!("unreadable stored value ({e})"));
                    stored.insert(key, value);
                }
                Err(e) => warn!(error = %e, "skipping settings row with unreadable key"),
            }
        }

        let mut settings = Settings::default();
        let mut faults = Vec::new();
        for (ch, param) in Settings::keys() {
            let key = param.store_key(ch);
            let value = match stored.get(&key) {
                Some(Ok(raw)) => param.from_stored(*raw).map_err(|e| e.to_string()),
                Some(Err(reason)) => Err(reason.clone()),
                None => Err("not stored".to_string()),
            };
            match value {
                // from_stored already validated the value against the param.
                Ok(v) => {
                    let _ = settings.set(ch, param, v);
                }
                Err(reason) => faults.push(Fault::ConfigLoad { key, reason }),
            }
        }

        info!(
            stored = rows.len(),
            defaulted = faults.len(),
            "settings loaded"
        );
        Ok(LoadedSettings {
            settings,
            faults,
            stored: rows.len(),
        })
    }

    pub async fn put_setting(&self, key: &str, value: ParamValue) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.as_i64())
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("put_setting {key} failed"))?;
        Ok(())
    }

    /// Write every setting, e.g. to seed a fresh store with defaults.
    pub async fn put_all_settings(&self, settings: &Settings) -> Result<()> {
        for (ch, param) in Settings::keys() {
            self.put_setting(&param.store_key(ch), settings.get(ch, param))
                .await?;
        }
        Ok(())
    }

    // ----------------------------
    // Metrics sink
    // ----------------------------

    /// Insert a batch of signal and log rows in one transaction.
    pub async fn insert_rows(&self, signals: &[SignalRow], logs: &[LogRow]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("insert_rows: begin failed")?;

        for chunk in signals.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO signals (ts, flow1, flow2, flow3, flow4, flow5, rain, ground, \
                 tank_level, pressure, cpu_temp, ambient_temp, exposed_temp, status, \
                 pump, valve1, valve2, valve3, valve4, valve5) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ts);
                for v in row.values {
                    b.push_bind(i64::from(v));
                }
                b.push_bind(i64::from(row.status));
                b.push_bind(row.actuators.pump);
                for open in row.actuators.valves {
                    b.push_bind(open);
                }
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .context("insert signals failed")?;
        }

        for chunk in logs.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<Sqlite> =
                QueryBuilder::new("INSERT INTO log (ts, instance, kind, name, details) ");
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.ts)
                    .push_bind(row.instance.as_str())
                    .push_bind(row.kind.as_str())
                    .push_bind(row.name.as_str())
                    .push_bind(row.details.as_str());
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .context("insert log failed")?;
        }

        tx.commit().await.context("insert_rows: commit failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
