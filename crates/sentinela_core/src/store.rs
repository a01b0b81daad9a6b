//! Persistência de eventos e settings em SQLite.
//!
//! `sensor_data` é append-only; a ordem de leitura é `timestamp DESC, id DESC`,
//! então eventos com o mesmo instante saem na ordem inversa de inserção.
//! `settings` guarda linhas nomeadas com upsert (hoje só `temp_threshold`).

use crate::types::{MessageKind, SensorEvent, ThresholdSetting, DEFAULT_THRESHOLD, THRESHOLD_SETTING};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Erros de persistência.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Erro SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Registro inválido no banco: {0}")]
    Corrupt(String),

    #[error("Conexão com o banco indisponível (lock envenenado)")]
    Poisoned,
}

/// Interface do armazenamento usada pelo pipeline e pela API.
pub trait EventStore: Send + Sync {
    /// Grava um evento no log.
    fn append_event(&self, event: &SensorEvent) -> Result<(), StoreError>;

    /// Threshold atual; o padrão documentado se nunca foi gravado.
    fn get_threshold(&self) -> Result<f64, StoreError>;

    /// Upsert do threshold.
    fn set_threshold(&self, value: f64) -> Result<(), StoreError>;

    /// Linha completa do setting, se existir.
    fn threshold_setting(&self) -> Result<Option<ThresholdSetting>, StoreError>;

    /// Último evento STATUS gravado.
    fn latest_status(&self) -> Result<Option<SensorEvent>, StoreError>;

    /// Até `limit` eventos, do mais recente para o mais antigo.
    fn recent_events(&self, limit: usize) -> Result<Vec<SensorEvent>, StoreError>;

    /// Descarrega o que estiver pendente antes de fechar.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Implementação SQLite com uma única conexão serializada por mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    default_threshold: f64,
}

impl SqliteStore {
    pub fn open(path: &Path, default_threshold: f64) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        // WAL permite leitores externos (ex.: sqlite3 CLI) enquanto o loop grava
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::with_connection(conn, default_threshold)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, DEFAULT_THRESHOLD)
    }

    fn with_connection(conn: Connection, default_threshold: f64) -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(conn),
            default_threshold,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sensor_data (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                message_type TEXT NOT NULL,
                message TEXT NOT NULL,
                temperature REAL,
                parse_failed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS settings (
                setting_name TEXT PRIMARY KEY,
                setting_value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sensor_data_ts
                ON sensor_data(timestamp DESC, id DESC);

            CREATE INDEX IF NOT EXISTS idx_sensor_data_type_ts
                ON sensor_data(message_type, timestamp DESC, id DESC);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn default_threshold(&self) -> f64 {
        self.default_threshold
    }
}

impl EventStore for SqliteStore {
    fn append_event(&self, event: &SensorEvent) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sensor_data (timestamp, message_type, message, temperature, parse_failed)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                format_ts(&event.timestamp),
                event.kind.as_str(),
                event.raw_message,
                event.reading,
                event.parse_failed,
            ],
        )?;
        Ok(())
    }

    fn get_threshold(&self) -> Result<f64, StoreError> {
        Ok(self
            .threshold_setting()?
            .map(|s| s.value)
            .unwrap_or(self.default_threshold))
    }

    fn set_threshold(&self, value: f64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (setting_name, setting_value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(setting_name) DO UPDATE
                SET setting_value = excluded.setting_value, updated_at = excluded.updated_at",
            params![THRESHOLD_SETTING, value.to_string(), format_ts(&Utc::now())],
        )?;
        Ok(())
    }

    fn threshold_setting(&self) -> Result<Option<ThresholdSetting>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT setting_value, updated_at FROM settings WHERE setting_name = ?1",
                params![THRESHOLD_SETTING],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        let Some((value, updated_at)) = row else {
            return Ok(None);
        };
        let value = value
            .trim()
            .parse::<f64>()
            .map_err(|_| StoreError::Corrupt(format!("threshold não numérico: {value:?}")))?;
        Ok(Some(ThresholdSetting {
            name: THRESHOLD_SETTING.to_string(),
            value,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    fn latest_status(&self) -> Result<Option<SensorEvent>, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT timestamp, message_type, message, temperature, parse_failed
                 FROM sensor_data WHERE message_type = ?1
                 ORDER BY timestamp DESC, id DESC LIMIT 1",
                params![MessageKind::Status.as_str()],
                RawEvent::from_row,
            )
            .optional()?;
        raw.map(RawEvent::into_event).transpose()
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<SensorEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, message_type, message, temperature, parse_failed
             FROM sensor_data ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], RawEvent::from_row)?;

        let mut events = Vec::new();
        for raw in rows {
            events.push(raw?.into_event()?);
        }
        Ok(events)
    }

    fn flush(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        // Em banco em memória o checkpoint é no-op
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Linha de `sensor_data` antes da validação.
struct RawEvent {
    timestamp: String,
    kind: String,
    message: String,
    temperature: Option<f64>,
    parse_failed: bool,
}

impl RawEvent {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            timestamp: row.get(0)?,
            kind: row.get(1)?,
            message: row.get(2)?,
            temperature: row.get(3)?,
            parse_failed: row.get(4)?,
        })
    }

    fn into_event(self) -> Result<SensorEvent, StoreError> {
        Ok(SensorEvent {
            timestamp: parse_ts(&self.timestamp)?,
            kind: self.kind.parse().map_err(StoreError::Corrupt)?,
            raw_message: self.message,
            reading: self.temperature,
            parse_failed: self.parse_failed,
        })
    }
}

/// Largura fixa (microssegundos, `Z`) para que a ordem textual seja a temporal.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {text:?}: {e}")))
}
