//! # Sentinela Core
//!
//! Crate compartilhada com o pipeline de ingestão e alertas do Sentinela:
//! leitura do link serial, classificação das linhas do dispositivo,
//! persistência em SQLite, debounce de alertas de temperatura e despacho
//! do comando `RESET_SYSTEM`.
//!
//! ## Módulos
//! - [`types`] – Eventos, tipos de mensagem e setting de threshold
//! - [`protocol`] – Parser de linhas, framing serial e comandos do dispositivo
//! - [`alerts`] – Debounce de alertas (cooldown)
//! - [`config`] – Configuração unificada via TOML
//! - [`store`] – Persistência de eventos e settings (SQLite)
//! - [`dispatcher`] – Acesso exclusivo ao link serial para escrita
//! - [`ingest`] – Loop de ingestão (orquestrador)
//! - [`health`] – Contadores de saúde do pipeline
//! - [`query`] – Operações de consulta usadas pela API

pub mod types;
pub mod protocol;
pub mod alerts;
pub mod config;
pub mod store;
pub mod dispatcher;
pub mod ingest;
pub mod health;
pub mod query;

// Re-exports convenientes
pub use types::{MessageKind, SensorEvent, ThresholdSetting, DEFAULT_THRESHOLD};
pub use protocol::{parse, DeviceCommand, ParsedLine, ParseError};
pub use alerts::{AlertDebounceState, AlertDecision, Debouncer};
pub use config::AppConfig;
pub use store::{EventStore, SqliteStore, StoreError};
pub use dispatcher::{CommandDispatcher, DispatchError, RetryPolicy};
pub use ingest::{IngestLoop, LoopExit};
pub use health::{HealthCounters, HealthSnapshot};
pub use query::{QueryError, QueryService};
