//! Sistema de alertas – debounce de threshold de temperatura.
//!
//! A decisão é pura: [`Debouncer::evaluate`] não altera o estado. Quem
//! consome um [`AlertDecision::Fire`] chama [`AlertDebounceState::commit`].

use std::time::{Duration, Instant};

/// Cooldown padrão entre dois alertas.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

/// Decisão para uma leitura.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    Fire,
    Suppressed,
}

/// Estado de debounce, vive no contexto do loop de ingestão.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertDebounceState {
    last_alert_at: Option<Instant>,
}

impl AlertDebounceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_alert_at(&self) -> Option<Instant> {
        self.last_alert_at
    }

    /// Registra um alerta consumido.
    pub fn commit(&mut self, now: Instant) {
        self.last_alert_at = Some(now);
    }
}

/// Avaliador de threshold com janela de cooldown.
#[derive(Debug, Clone, Copy)]
pub struct Debouncer {
    cooldown: Duration,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl Debouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self { cooldown }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// `Fire` se a leitura passou do threshold e o cooldown expirou.
    ///
    /// Sem histerese: leitura contínua acima do threshold dispara de novo a
    /// cada cooldown.
    pub fn evaluate(
        &self,
        reading: f64,
        threshold: f64,
        now: Instant,
        state: &AlertDebounceState,
    ) -> AlertDecision {
        if reading <= threshold {
            return AlertDecision::Suppressed;
        }
        match state.last_alert_at {
            Some(last) if now.saturating_duration_since(last) <= self.cooldown => {
                AlertDecision::Suppressed
            }
            _ => AlertDecision::Fire,
        }
    }
}

/// Mensagem do evento ALARM sintético gravado quando um alerta dispara.
pub fn breach_message(reading: f64, threshold: f64) -> String {
    format!("Temperatura ({reading}°C) excedeu o limite ({threshold}°C)")
}
