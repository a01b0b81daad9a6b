//! Contadores de saúde do pipeline, compartilhados entre o loop e a API.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Contadores monotônicos + flag de degradação do armazenamento.
#[derive(Debug, Default)]
pub struct HealthCounters {
    lines_received: AtomicU64,
    events_stored: AtomicU64,
    parse_failures: AtomicU64,
    store_failures: AtomicU64,
    alerts_fired: AtomicU64,
    commands_sent: AtomicU64,
    dispatch_failures: AtomicU64,
    /// Última escrita no banco falhou
    store_degraded: AtomicBool,
    /// Loop de ingestão ativo
    ingest_running: AtomicBool,
}

/// Cópia serializável dos contadores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub ingest_running: bool,
    pub store_degraded: bool,
    pub lines_received: u64,
    pub events_stored: u64,
    pub parse_failures: u64,
    pub store_failures: u64,
    pub alerts_fired: u64,
    pub commands_sent: u64,
    pub dispatch_failures: u64,
}

impl HealthCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_failed(&self) {
        self.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_ok(&self) {
        self.events_stored.fetch_add(1, Ordering::Relaxed);
        self.store_degraded.store(false, Ordering::Relaxed);
    }

    pub fn store_failed(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
        self.store_degraded.store(true, Ordering::Relaxed);
    }

    pub fn alert_fired(&self) {
        self.alerts_fired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_failed(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_ingest_running(&self, running: bool) {
        self.ingest_running.store(running, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let store_degraded = self.store_degraded.load(Ordering::Relaxed);
        let ingest_running = self.ingest_running.load(Ordering::Relaxed);
        HealthSnapshot {
            status: if store_degraded || !ingest_running { "degraded" } else { "ok" },
            ingest_running,
            store_degraded,
            lines_received: self.lines_received.load(Ordering::Relaxed),
            events_stored: self.events_stored.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            alerts_fired: self.alerts_fired.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}
