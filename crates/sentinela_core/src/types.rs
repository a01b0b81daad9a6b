//! Definição dos tipos persistidos e trocados entre ingestão e consulta.
//!
//! Os nomes de wire (`STATUS`, `EVENT`, `ALARM`, `SYSTEM`) são os mesmos
//! gravados na coluna `message_type` e expostos pela API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Threshold de temperatura usado quando nenhum valor foi gravado (°C).
pub const DEFAULT_THRESHOLD: f64 = 27.0;

/// Nome da linha de setting que guarda o threshold.
pub const THRESHOLD_SETTING: &str = "temp_threshold";

/// Marcador de sistema armado dentro de uma linha STATUS.
pub const ARMED_MARKER: &str = "System:ARMED";

/// Marcador de alarme disparado dentro de uma linha STATUS.
pub const ALARM_MARKER: &str = "Alarm:TRIGGERED";

// ──────────────────────────────────────────────
// Tipo de mensagem
// ──────────────────────────────────────────────

/// Classificação de uma linha recebida do dispositivo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Status,
    Event,
    Alarm,
    System,
}

impl MessageKind {
    /// Nome de wire, igual ao gravado no banco.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "STATUS",
            Self::Event => "EVENT",
            Self::Alarm => "ALARM",
            Self::System => "SYSTEM",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STATUS" => Ok(Self::Status),
            "EVENT" => Ok(Self::Event),
            "ALARM" => Ok(Self::Alarm),
            "SYSTEM" => Ok(Self::System),
            other => Err(format!("tipo de mensagem desconhecido: {other}")),
        }
    }
}

// ──────────────────────────────────────────────
// Evento
// ──────────────────────────────────────────────

/// Um evento classificado, imutável depois de criado.
///
/// `reading` só existe para `Status` com temperatura válida. `parse_failed`
/// marca linhas STATUS gravadas sem leitura (opcional, ver
/// `alerts.store_unparsed_status`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
    pub raw_message: String,
    pub reading: Option<f64>,
    #[serde(default)]
    pub parse_failed: bool,
}

impl SensorEvent {
    /// Evento sem leitura numérica (EVENT, ALARM, SYSTEM).
    pub fn new(kind: MessageKind, raw_message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind,
            raw_message: raw_message.into(),
            reading: None,
            parse_failed: false,
        }
    }

    /// Linha STATUS com temperatura extraída.
    pub fn status(raw_message: impl Into<String>, reading: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind: MessageKind::Status,
            raw_message: raw_message.into(),
            reading: Some(reading),
            parse_failed: false,
        }
    }

    /// Linha STATUS cuja temperatura não pôde ser lida.
    pub fn unparsed_status(raw_message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            kind: MessageKind::Status,
            raw_message: raw_message.into(),
            reading: None,
            parse_failed: true,
        }
    }

    /// Sistema armado segundo a linha STATUS.
    pub fn system_armed(&self) -> bool {
        self.raw_message.contains(ARMED_MARKER)
    }

    /// Alarme disparado segundo a linha STATUS.
    pub fn alarm_active(&self) -> bool {
        self.raw_message.contains(ALARM_MARKER)
    }
}

// ──────────────────────────────────────────────
// Threshold
// ──────────────────────────────────────────────

/// Linha única de setting do threshold (upsert por nome).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSetting {
    pub name: String,
    pub value: f64,
    pub updated_at: DateTime<Utc>,
}
