//! Loop de ingestão – lê linhas do link, classifica, persiste, avalia o
//! threshold e dispara o reset automático.
//!
//! Por linha: `Idle → Classifying → Persisting → [Evaluating → Dispatching] → Idle`.
//!
//! - Linha malformada: descartada (nunca fatal).
//! - Falha de escrita no banco: logada, contabilizada, o loop segue.
//! - Falha de leitura do link: fatal, o loop sai com [`LoopExit::LinkLost`].
//!
//! A liberação de recursos (flush do banco, fechamento do link) fica no
//! `Drop` do [`IngestLoop`], então acontece em qualquer caminho de saída.

use crate::alerts::{breach_message, AlertDebounceState, AlertDecision, Debouncer};
use crate::config::AppConfig;
use crate::dispatcher::CommandDispatcher;
use crate::health::HealthCounters;
use crate::protocol::{parse, LineReader, ParsedLine};
use crate::store::EventStore;
use crate::types::{MessageKind, SensorEvent};
use chrono::Utc;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Motivo de saída do loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Pedido de desligamento (sinal do processo).
    Shutdown,
    /// Leitura do link falhou; o supervisor decide o restart.
    LinkLost(String),
}

/// Ajustes do loop derivados do [`AppConfig`].
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub default_threshold: f64,
    pub cooldown: Duration,
    pub store_unparsed_status: bool,
    pub stats_interval: Duration,
}

impl From<&AppConfig> for IngestSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            default_threshold: config.alerts.default_threshold,
            cooldown: config.alerts.cooldown(),
            store_unparsed_status: config.alerts.store_unparsed_status,
            stats_interval: config.alerts.stats_interval(),
        }
    }
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// O que aconteceu com uma linha.
#[derive(Debug, Clone, PartialEq)]
pub enum LineOutcome {
    /// Linha vazia.
    Ignored,
    /// Falha de parse; nada foi gravado.
    Dropped,
    /// Linha classificada.
    Recorded {
        kind: MessageKind,
        persisted: bool,
        alert: Option<AlertOutcome>,
    },
}

/// Resultado de um alerta disparado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertOutcome {
    pub dispatched: bool,
    pub alarm_persisted: bool,
}

/// Contexto do loop: dono do lado de leitura do link e do estado de debounce.
pub struct IngestLoop<R: Read> {
    reader: LineReader<R>,
    store: Arc<dyn EventStore>,
    dispatcher: Arc<CommandDispatcher>,
    health: Arc<HealthCounters>,
    shutdown: Arc<AtomicBool>,
    settings: IngestSettings,
    debouncer: Debouncer,
    debounce: AlertDebounceState,
    /// Último threshold lido com sucesso (fallback se o banco falhar)
    last_threshold: f64,
    last_stats: Instant,
}

impl<R: Read> IngestLoop<R> {
    pub fn new(
        link: R,
        store: Arc<dyn EventStore>,
        dispatcher: Arc<CommandDispatcher>,
        health: Arc<HealthCounters>,
        shutdown: Arc<AtomicBool>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            reader: LineReader::new(link),
            store,
            dispatcher,
            health,
            shutdown,
            debouncer: Debouncer::new(settings.cooldown),
            debounce: AlertDebounceState::new(),
            last_threshold: settings.default_threshold,
            last_stats: Instant::now(),
            settings,
        }
    }

    /// Roda até desligamento ou perda do link.
    pub fn run(mut self) -> LoopExit {
        self.health.set_ingest_running(true);
        info!("Loop de ingestão iniciado");

        let exit = loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break LoopExit::Shutdown;
            }

            let read = self.reader.next_line();
            for _ in 0..self.reader.take_discarded() {
                self.health.parse_failed();
            }

            match read {
                Ok(Some(line)) => {
                    self.handle_line(&line, Instant::now());
                }
                Ok(None) => {
                    // Timeout de leitura: housekeeping
                }
                Err(e) => {
                    error!("Leitura do link serial falhou: {e}");
                    break LoopExit::LinkLost(e.to_string());
                }
            }

            self.maybe_log_stats();
        };

        info!("Loop de ingestão encerrado: {exit:?}");
        exit
    }

    /// Processa uma linha recebida em `now`.
    pub fn handle_line(&mut self, raw: &str, now: Instant) -> LineOutcome {
        let raw = raw.trim();
        if raw.is_empty() {
            return LineOutcome::Ignored;
        }
        self.health.line_received();
        debug!("Recebido: {raw}");

        // ── Classifying ──
        let parsed = match parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.health.parse_failed();
                warn!("Linha descartada ({e}): {raw}");
                if self.settings.store_unparsed_status {
                    let persisted = self.persist(&SensorEvent::unparsed_status(raw, Utc::now()));
                    return LineOutcome::Recorded {
                        kind: MessageKind::Status,
                        persisted,
                        alert: None,
                    };
                }
                return LineOutcome::Dropped;
            }
        };

        // ── Persisting ──
        let timestamp = Utc::now();
        let event = match parsed {
            ParsedLine::Status { reading } => SensorEvent::status(raw, reading, timestamp),
            other => SensorEvent::new(other.kind(), raw, timestamp),
        };
        let persisted = self.persist(&event);

        // ── Evaluating ──
        let alert = parsed.reading().and_then(|reading| self.evaluate(reading, now));

        LineOutcome::Recorded {
            kind: parsed.kind(),
            persisted,
            alert,
        }
    }

    fn evaluate(&mut self, reading: f64, now: Instant) -> Option<AlertOutcome> {
        let threshold = self.current_threshold();
        if self.debouncer.evaluate(reading, threshold, now, &self.debounce) != AlertDecision::Fire {
            return None;
        }
        self.debounce.commit(now);
        self.health.alert_fired();
        warn!("ALERTA: temperatura {reading}°C acima do limite {threshold}°C");

        // ── Dispatching ──
        let dispatched = match self.dispatcher.send_reset() {
            Ok(()) => true,
            Err(e) => {
                error!("Reset automático não entregue: {e}");
                false
            }
        };

        // O alarme é gravado mesmo se o comando não chegou
        let alarm = SensorEvent::new(MessageKind::Alarm, breach_message(reading, threshold), Utc::now());
        let alarm_persisted = self.persist(&alarm);

        Some(AlertOutcome {
            dispatched,
            alarm_persisted,
        })
    }

    /// Threshold lido do banco a cada avaliação.
    fn current_threshold(&mut self) -> f64 {
        match self.store.get_threshold() {
            Ok(value) => {
                self.last_threshold = value;
                value
            }
            Err(e) => {
                warn!("Falha ao ler threshold, usando {}°C: {e}", self.last_threshold);
                self.last_threshold
            }
        }
    }

    fn persist(&self, event: &SensorEvent) -> bool {
        match self.store.append_event(event) {
            Ok(()) => {
                self.health.store_ok();
                true
            }
            Err(e) => {
                self.health.store_failed();
                error!("Falha ao gravar evento {}: {e}", event.kind);
                false
            }
        }
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stats.elapsed() < self.settings.stats_interval {
            return;
        }
        self.last_stats = Instant::now();
        let s = self.health.snapshot();
        info!(
            "Linhas {} | gravados {} | descartadas {} | falhas banco {} | alertas {} | resets {}",
            s.lines_received, s.events_stored, s.parse_failures, s.store_failures, s.alerts_fired, s.commands_sent
        );
    }
}

impl<R: Read> Drop for IngestLoop<R> {
    fn drop(&mut self) {
        self.health.set_ingest_running(false);
        if let Err(e) = self.store.flush() {
            warn!("Falha ao descarregar o banco: {e}");
        }
        info!("Link serial liberado");
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::RetryPolicy;
    use crate::store::{SqliteStore, StoreError};
    use crate::types::ThresholdSetting;
    use std::io::{self, Cursor, Write};
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

    struct BrokenWire;

    impl Write for BrokenWire {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "desconectado"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Banco que recusa toda escrita.
    struct FailingStore;

    impl EventStore for FailingStore {
        fn append_event(&self, _: &SensorEvent) -> Result<(), StoreError> {
            Err(StoreError::Corrupt("disco cheio".into()))
        }
        fn get_threshold(&self) -> Result<f64, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn set_threshold(&self, _: f64) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn threshold_setting(&self) -> Result<Option<ThresholdSetting>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn latest_status(&self) -> Result<Option<SensorEvent>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn recent_events(&self, _: usize) -> Result<Vec<SensorEvent>, StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    struct Harness {
        store: Arc<SqliteStore>,
        wire: Wire,
        health: Arc<HealthCounters>,
    }

    fn harness() -> Harness {
        Harness {
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            wire: Wire::default(),
            health: Arc::new(HealthCounters::new()),
        }
    }

    fn ingest_loop<R: Read>(h: &Harness, link: R, settings: IngestSettings) -> IngestLoop<R> {
        let dispatcher = Arc::new(
            CommandDispatcher::new(h.wire.clone(), RetryPolicy::default())
                .with_health(Arc::clone(&h.health)),
        );
        IngestLoop::new(
            link,
            h.store.clone(),
            dispatcher,
            Arc::clone(&h.health),
            Arc::new(AtomicBool::new(false)),
            settings,
        )
    }

    fn idle_loop(h: &Harness) -> IngestLoop<io::Empty> {
        ingest_loop(h, io::empty(), IngestSettings::default())
    }

    fn sent(h: &Harness) -> Vec<u8> {
        h.wire.0.lock().unwrap().clone()
    }

    #[test]
    fn mixed_lines_are_all_persisted() {
        let h = harness();
        let mut lp = idle_loop(&h);
        let t = Instant::now();
        for line in [
            "[STATUS] Temp:20.0°C System:ARMED",
            "[EVENT] Door opened",
            "[STATUS] Temp:21.0°C System:ARMED",
            "[ALARM] Motion detected",
            "[STATUS] Temp:22.0°C System:ARMED",
        ] {
            assert!(matches!(
                lp.handle_line(line, t),
                LineOutcome::Recorded { persisted: true, alert: None, .. }
            ));
        }

        let events = h.store.recent_events(50).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].raw_message, "[STATUS] Temp:22.0°C System:ARMED");
        assert_eq!(events[4].raw_message, "[STATUS] Temp:20.0°C System:ARMED");
        assert!(events.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert!(sent(&h).is_empty());
    }

    #[test]
    fn malformed_status_is_dropped() {
        let h = harness();
        let mut lp = idle_loop(&h);
        assert_eq!(lp.handle_line("[STATUS] Temp:??°C", Instant::now()), LineOutcome::Dropped);
        assert_eq!(lp.handle_line("   ", Instant::now()), LineOutcome::Ignored);
        assert!(h.store.recent_events(10).unwrap().is_empty());
        assert_eq!(h.health.snapshot().parse_failures, 1);
    }

    #[test]
    fn malformed_status_can_be_kept_for_audit() {
        let h = harness();
        let settings = IngestSettings {
            store_unparsed_status: true,
            ..IngestSettings::default()
        };
        let mut lp = ingest_loop(&h, io::empty(), settings);
        let outcome = lp.handle_line("[STATUS] Temp:??°C", Instant::now());
        assert_eq!(
            outcome,
            LineOutcome::Recorded {
                kind: MessageKind::Status,
                persisted: true,
                alert: None
            }
        );
        let events = h.store.recent_events(10).unwrap();
        assert!(events[0].parse_failed);
        assert_eq!(events[0].reading, None);
    }

    #[test]
    fn breach_sends_reset_and_records_alarm() {
        let h = harness();
        let mut lp = idle_loop(&h);
        let t = Instant::now();

        let outcome = lp.handle_line("[STATUS] Temp:28.0°C System:ARMED", t);
        assert_eq!(
            outcome,
            LineOutcome::Recorded {
                kind: MessageKind::Status,
                persisted: true,
                alert: Some(AlertOutcome {
                    dispatched: true,
                    alarm_persisted: true
                })
            }
        );
        assert_eq!(sent(&h), b"RESET_SYSTEM\n");

        let events = h.store.recent_events(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, MessageKind::Alarm);
        assert!(events[0].raw_message.contains("28°C"));

        // Dentro do cooldown: grava STATUS, sem novo reset
        let again = lp.handle_line("[STATUS] Temp:29.0°C", t + Duration::from_secs(10));
        assert!(matches!(again, LineOutcome::Recorded { alert: None, .. }));
        assert_eq!(sent(&h), b"RESET_SYSTEM\n");

        // Cooldown expirado
        let later = lp.handle_line("[STATUS] Temp:29.0°C", t + Duration::from_secs(31));
        assert!(matches!(later, LineOutcome::Recorded { alert: Some(_), .. }));
        assert_eq!(sent(&h), b"RESET_SYSTEM\nRESET_SYSTEM\n");
        assert_eq!(h.health.snapshot().alerts_fired, 2);
    }

    #[test]
    fn threshold_update_is_seen_by_next_evaluation() {
        let h = harness();
        let mut lp = idle_loop(&h);
        let t = Instant::now();

        assert!(matches!(
            lp.handle_line("[STATUS] Temp:25.0°C", t),
            LineOutcome::Recorded { alert: None, .. }
        ));
        h.store.set_threshold(24.0).unwrap();
        assert!(matches!(
            lp.handle_line("[STATUS] Temp:25.0°C", t),
            LineOutcome::Recorded { alert: Some(_), .. }
        ));
    }

    #[test]
    fn failed_dispatch_still_records_alarm() {
        let h = harness();
        let dispatcher = Arc::new(CommandDispatcher::new(BrokenWire, RetryPolicy::default()));
        let mut lp = IngestLoop::new(
            io::empty(),
            h.store.clone(),
            dispatcher,
            Arc::clone(&h.health),
            Arc::new(AtomicBool::new(false)),
            IngestSettings::default(),
        );
        let outcome = lp.handle_line("[STATUS] Temp:35.0°C", Instant::now());
        assert_eq!(
            outcome,
            LineOutcome::Recorded {
                kind: MessageKind::Status,
                persisted: true,
                alert: Some(AlertOutcome {
                    dispatched: false,
                    alarm_persisted: true
                })
            }
        );
        assert_eq!(h.store.recent_events(10).unwrap()[0].kind, MessageKind::Alarm);
    }

    #[test]
    fn store_failures_do_not_stop_alerting() {
        let wire = Wire::default();
        let health = Arc::new(HealthCounters::new());
        let mut lp = IngestLoop::new(
            io::empty(),
            Arc::new(FailingStore),
            Arc::new(CommandDispatcher::new(wire.clone(), RetryPolicy::default())),
            Arc::clone(&health),
            Arc::new(AtomicBool::new(false)),
            IngestSettings::default(),
        );

        // Threshold cai no padrão (27.0) quando o banco não responde
        let outcome = lp.handle_line("[STATUS] Temp:30.0°C", Instant::now());
        assert_eq!(
            outcome,
            LineOutcome::Recorded {
                kind: MessageKind::Status,
                persisted: false,
                alert: Some(AlertOutcome {
                    dispatched: true,
                    alarm_persisted: false
                })
            }
        );
        assert_eq!(wire.0.lock().unwrap().as_slice(), b"RESET_SYSTEM\n");
        let snap = health.snapshot();
        assert_eq!(snap.store_failures, 2);
        assert!(snap.store_degraded);
    }

    #[test]
    fn run_consumes_link_until_eof() {
        let h = harness();
        let data = "boot banner\n[STATUS] Temp:20.5°C\n[STATUS] bad\n[EVENT] ok\n";
        let lp = ingest_loop(&h, Cursor::new(data.as_bytes().to_vec()), IngestSettings::default());

        let exit = lp.run();
        assert!(matches!(exit, LoopExit::LinkLost(_)));

        let kinds: Vec<_> = h.store.recent_events(10).unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [MessageKind::Event, MessageKind::Status, MessageKind::System]);
        assert!(!h.health.snapshot().ingest_running);
    }

    #[test]
    fn settings_survive_unbounded_intervals() {
        let mut config = AppConfig::default();
        config.alerts.cooldown_secs = 1e20;
        config.alerts.stats_interval_secs = f64::INFINITY;
        let settings = IngestSettings::from(&config);
        assert_eq!(settings.cooldown, crate::alerts::DEFAULT_COOLDOWN);
        assert_eq!(settings.stats_interval, Duration::from_secs(60));
    }

    #[test]
    fn oversized_line_counts_as_parse_failure() {
        let h = harness();
        let mut data = vec![b'9'; crate::protocol::MAX_LINE_LEN + 1];
        data.extend_from_slice(b"\n[EVENT] depois\n");
        let lp = ingest_loop(&h, Cursor::new(data), IngestSettings::default());

        assert!(matches!(lp.run(), LoopExit::LinkLost(_)));
        let events = h.store.recent_events(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].raw_message, "[EVENT] depois");
        assert_eq!(h.health.snapshot().parse_failures, 1);
    }

    /// Link que só devolve timeouts.
    struct SilentLink;

    impl Read for SilentLink {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(5));
            Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"))
        }
    }

    #[test]
    fn shutdown_flag_stops_idle_loop() {
        let h = harness();
        let shutdown = Arc::new(AtomicBool::new(false));
        let lp = IngestLoop::new(
            SilentLink,
            h.store.clone(),
            Arc::new(CommandDispatcher::new(h.wire.clone(), RetryPolicy::default())),
            Arc::clone(&h.health),
            Arc::clone(&shutdown),
            IngestSettings::default(),
        );

        let handle = std::thread::spawn(move || lp.run());
        std::thread::sleep(Duration::from_millis(30));
        shutdown.store(true, Ordering::Relaxed);
        assert_eq!(handle.join().unwrap(), LoopExit::Shutdown);
    }
}
