//! Operações de consulta e controle expostas pela API.
//!
//! Só lê o armazenamento; o link serial é tocado apenas pedindo um despacho
//! ao [`CommandDispatcher`] compartilhado com o loop de ingestão.

use crate::dispatcher::{CommandDispatcher, DispatchError};
use crate::store::{EventStore, StoreError};
use crate::types::{MessageKind, SensorEvent};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Mensagem do evento de auditoria do reset manual.
pub const MANUAL_RESET_MESSAGE: &str = "Reset do sistema acionado pela interface web";

/// Texto de `latest_status` quando ainda não há leituras.
pub const NO_DATA: &str = "No data";

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Erros das operações de consulta.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("Payload inválido: {0}")]
    Validation(String),
}

impl QueryError {
    /// Classe do erro exposta ao cliente.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Store(_) => "StoreError",
            Self::Dispatch(DispatchError::DeviceBusy { .. }) => "DeviceBusy",
            Self::Dispatch(DispatchError::LinkLost(_)) => "LinkLost",
            Self::Validation(_) => "ValidationError",
        }
    }

    /// Mensagem genérica, sem detalhes internos.
    pub fn public_message(&self) -> String {
        match self {
            Self::Store(_) => "Falha ao acessar o armazenamento".into(),
            Self::Dispatch(DispatchError::DeviceBusy { .. }) => {
                "Dispositivo ocupado, tente novamente".into()
            }
            Self::Dispatch(DispatchError::LinkLost(_)) => "Dispositivo indisponível".into(),
            // Erros de validação descrevem só o payload do próprio cliente
            Self::Validation(msg) => msg.clone(),
        }
    }
}

// ──────────────────────────────────────────────
// Respostas
// ──────────────────────────────────────────────

/// Estado atual derivado do último STATUS.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub latest_status: String,
    pub temperature: f64,
    pub system_armed: bool,
    pub alarm_active: bool,
    pub timestamp: String,
}

/// Item do histórico.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryItem {
    pub timestamp: String,
    pub message_type: MessageKind,
    pub message: String,
    pub temperature: Option<f64>,
}

impl From<SensorEvent> for HistoryItem {
    fn from(event: SensorEvent) -> Self {
        Self {
            timestamp: format_local(&event.timestamp),
            message_type: event.kind,
            message: event.raw_message,
            temperature: event.reading,
        }
    }
}

/// Threshold atual.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdView {
    pub threshold: f64,
    pub updated_at: Option<String>,
}

fn format_local(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format(TS_FORMAT).to_string()
}

// ──────────────────────────────────────────────
// Serviço
// ──────────────────────────────────────────────

/// Fachada usada pelos handlers HTTP.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<CommandDispatcher>,
    default_limit: usize,
    max_limit: usize,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Arc<CommandDispatcher>,
        default_limit: usize,
        max_limit: usize,
    ) -> Self {
        Self {
            store,
            dispatcher,
            default_limit,
            max_limit,
        }
    }

    /// Último STATUS com flags de armado/alarme.
    pub fn status(&self) -> Result<StatusView, QueryError> {
        let latest = self.store.latest_status()?;
        let now = format_local(&Utc::now());
        Ok(match latest {
            Some(event) => StatusView {
                system_armed: event.system_armed(),
                alarm_active: event.alarm_active(),
                temperature: event.reading.unwrap_or(0.0),
                latest_status: event.raw_message,
                timestamp: now,
            },
            None => StatusView {
                latest_status: NO_DATA.into(),
                temperature: 0.0,
                system_armed: false,
                alarm_active: false,
                timestamp: now,
            },
        })
    }

    /// Eventos mais recentes primeiro; `limit` é limitado a `max_limit`.
    pub fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryItem>, QueryError> {
        let limit = limit.unwrap_or(self.default_limit).min(self.max_limit);
        let events = self.store.recent_events(limit)?;
        Ok(events.into_iter().map(HistoryItem::from).collect())
    }

    /// Reset manual: envia o comando e grava o evento de auditoria.
    ///
    /// Com o comando entregue, falha na auditoria só é logada.
    pub fn reset(&self) -> Result<(), QueryError> {
        self.dispatcher.send_reset()?;
        info!("Reset manual enviado");
        let audit = SensorEvent::new(MessageKind::Event, MANUAL_RESET_MESSAGE, Utc::now());
        if let Err(e) = self.store.append_event(&audit) {
            error!("Reset entregue, mas a auditoria não foi gravada: {e}");
        }
        Ok(())
    }

    pub fn threshold(&self) -> Result<ThresholdView, QueryError> {
        let setting = self.store.threshold_setting()?;
        Ok(match setting {
            Some(s) => ThresholdView {
                threshold: s.value,
                updated_at: Some(format_local(&s.updated_at)),
            },
            None => ThresholdView {
                threshold: self.store.get_threshold()?,
                updated_at: None,
            },
        })
    }

    /// Valida o corpo JSON e faz o upsert. Retorna o novo valor.
    pub fn update_threshold(&self, body: &[u8]) -> Result<f64, QueryError> {
        let value = parse_threshold_payload(body)?;
        self.store.set_threshold(value)?;
        info!("Threshold atualizado para {value}°C");
        Ok(value)
    }
}

/// Exige um objeto JSON com campo numérico e finito `threshold`.
pub fn parse_threshold_payload(body: &[u8]) -> Result<f64, QueryError> {
    let payload: serde_json::Value = serde_json::from_slice(body).map_err(|e| {
        warn!("Corpo de threshold não é JSON: {e}");
        QueryError::Validation("Corpo precisa ser JSON".into())
    })?;

    match payload.get("threshold") {
        None | Some(serde_json::Value::Null) => {
            Err(QueryError::Validation("Nenhum threshold informado".into()))
        }
        Some(value) => value
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| QueryError::Validation("threshold precisa ser numérico".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RetryPolicy;
    use crate::store::SqliteStore;
    use std::io::{self, Write};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Wire(Arc<Mutex<Vec<u8>>>);

    impl Write for Wire {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BusyWire;

    impl Write for BusyWire {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "ocupado"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn service_with(link: impl Write + Send + 'static) -> (QueryService, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: std::time::Duration::from_millis(1),
        };
        let dispatcher = Arc::new(CommandDispatcher::new(link, policy));
        (QueryService::new(store.clone(), dispatcher, 50, 500), store)
    }

    #[test]
    fn status_without_data() {
        let (service, _) = service_with(Wire::default());
        let status = service.status().unwrap();
        assert_eq!(status.latest_status, NO_DATA);
        assert_eq!(status.temperature, 0.0);
        assert!(!status.system_armed && !status.alarm_active);
    }

    #[test]
    fn status_reads_markers() {
        let (service, store) = service_with(Wire::default());
        store
            .append_event(&SensorEvent::status(
                "[STATUS] Temp:4.5°C System:ARMED Alarm:TRIGGERED",
                4.5,
                Utc::now(),
            ))
            .unwrap();
        let status = service.status().unwrap();
        assert_eq!(status.temperature, 4.5);
        assert!(status.system_armed);
        assert!(status.alarm_active);
    }

    #[test]
    fn history_respects_limits() {
        let (service, store) = service_with(Wire::default());
        for i in 0..5 {
            store
                .append_event(&SensorEvent::new(MessageKind::System, format!("linha {i}"), Utc::now()))
                .unwrap();
        }
        let all = service.history(None).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].message, "linha 4");
        assert_eq!(service.history(Some(2)).unwrap().len(), 2);

        let dispatcher = Arc::new(CommandDispatcher::new(Wire::default(), RetryPolicy::default()));
        let capped = QueryService::new(store.clone(), dispatcher, 50, 3);
        assert_eq!(capped.history(Some(100)).unwrap().len(), 3);
    }

    #[test]
    fn reset_sends_command_and_audits() {
        let wire = Wire::default();
        let (service, store) = service_with(wire.clone());
        service.reset().unwrap();
        assert_eq!(wire.0.lock().unwrap().as_slice(), b"RESET_SYSTEM\n");
        let events = store.recent_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MessageKind::Event);
        assert_eq!(events[0].raw_message, MANUAL_RESET_MESSAGE);
    }

    #[test]
    fn busy_reset_reports_class_and_skips_audit() {
        let (service, store) = service_with(BusyWire);
        let err = service.reset().unwrap_err();
        assert_eq!(err.class(), "DeviceBusy");
        assert!(store.recent_events(10).unwrap().is_empty());
    }

    /// Banco que aceita leituras mas recusa gravar eventos.
    struct ReadOnlyStore(SqliteStore);

    impl EventStore for ReadOnlyStore {
        fn append_event(&self, _: &SensorEvent) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("somente leitura".into()))
        }
        fn get_threshold(&self) -> Result<f64, StoreError> {
            self.0.get_threshold()
        }
        fn set_threshold(&self, value: f64) -> Result<(), StoreError> {
            self.0.set_threshold(value)
        }
        fn threshold_setting(&self) -> Result<Option<crate::types::ThresholdSetting>, StoreError> {
            self.0.threshold_setting()
        }
        fn latest_status(&self) -> Result<Option<SensorEvent>, StoreError> {
            self.0.latest_status()
        }
        fn recent_events(&self, limit: usize) -> Result<Vec<SensorEvent>, StoreError> {
            self.0.recent_events(limit)
        }
    }

    #[test]
    fn delivered_reset_succeeds_even_if_audit_fails() {
        let wire = Wire::default();
        let store = Arc::new(ReadOnlyStore(SqliteStore::open_in_memory().unwrap()));
        let dispatcher = Arc::new(CommandDispatcher::new(wire.clone(), RetryPolicy::default()));
        let service = QueryService::new(store, dispatcher, 50, 500);

        service.reset().unwrap();
        assert_eq!(wire.0.lock().unwrap().as_slice(), b"RESET_SYSTEM\n");
    }

    #[test]
    fn threshold_get_and_update() {
        let (service, _) = service_with(Wire::default());
        let initial = service.threshold().unwrap();
        assert_eq!(initial.threshold, 27.0);
        assert!(initial.updated_at.is_none());

        assert_eq!(service.update_threshold(br#"{"threshold": 24.5}"#).unwrap(), 24.5);
        let updated = service.threshold().unwrap();
        assert_eq!(updated.threshold, 24.5);
        assert!(updated.updated_at.is_some());
    }

    #[test]
    fn threshold_payload_validation() {
        assert_eq!(parse_threshold_payload(br#"{"threshold": 30}"#).unwrap(), 30.0);
        let bodies: [&[u8]; 6] = [
            b"{}",
            br#"{"threshold": null}"#,
            br#"{"threshold": "30"}"#,
            br#"{"threshold": [30]}"#,
            b"not json",
            b"",
        ];
        for body in bodies {
            let err = parse_threshold_payload(body).unwrap_err();
            assert_eq!(err.class(), "ValidationError", "corpo: {:?}", String::from_utf8_lossy(body));
        }
    }
}
