//! Protocolo de linha do dispositivo.
//!
//! O dispositivo envia linhas ASCII terminadas em `\n`, marcadas com tags
//! entre colchetes:
//!
//! ```text
//! [STATUS] Temp:23.5°C System:ARMED Alarm:OK
//! [EVENT] Door opened
//! [ALARM] Motion detected while armed
//! ```
//!
//! O único comando de saída é a linha literal `RESET_SYSTEM`.

use crate::types::MessageKind;
use std::io::{self, BufRead, BufReader, Read};
use tracing::warn;

const STATUS_TAG: &str = "[STATUS]";
const EVENT_TAG: &str = "[EVENT]";
const ALARM_TAG: &str = "[ALARM]";

/// Marcador que precede a temperatura numa linha STATUS.
pub const TEMP_MARKER: &str = "Temp:";
/// Marcador que encerra a temperatura numa linha STATUS.
pub const UNIT_MARKER: &str = "°C";

/// Comando de reset enviado ao dispositivo (sem terminador).
pub const RESET_COMMAND: &str = "RESET_SYSTEM";

/// Erros de parse de uma linha.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Marcador ausente na linha STATUS: {0}")]
    MissingMarker(&'static str),

    #[error("Temperatura inválida: {0:?}")]
    InvalidNumber(String),
}

/// Resultado da classificação de uma linha.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParsedLine {
    Status { reading: f64 },
    Event,
    Alarm,
    System,
}

impl ParsedLine {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Status { .. } => MessageKind::Status,
            Self::Event => MessageKind::Event,
            Self::Alarm => MessageKind::Alarm,
            Self::System => MessageKind::System,
        }
    }

    pub fn reading(&self) -> Option<f64> {
        match self {
            Self::Status { reading } => Some(*reading),
            _ => None,
        }
    }
}

/// Classifica uma linha crua. Regras na ordem: STATUS, EVENT, ALARM, SYSTEM.
///
/// Uma linha STATUS sem temperatura válida é erro; as demais nunca falham.
pub fn parse(raw: &str) -> Result<ParsedLine, ParseError> {
    if raw.contains(STATUS_TAG) {
        return extract_temperature(raw).map(|reading| ParsedLine::Status { reading });
    }
    if raw.contains(EVENT_TAG) {
        Ok(ParsedLine::Event)
    } else if raw.contains(ALARM_TAG) {
        Ok(ParsedLine::Alarm)
    } else {
        Ok(ParsedLine::System)
    }
}

/// Extrai o número entre o último `Temp:` e o `°C` seguinte.
fn extract_temperature(raw: &str) -> Result<f64, ParseError> {
    let start = raw
        .rfind(TEMP_MARKER)
        .ok_or(ParseError::MissingMarker(TEMP_MARKER))?
        + TEMP_MARKER.len();
    let rest = &raw[start..];
    let end = rest.find(UNIT_MARKER).ok_or(ParseError::MissingMarker(UNIT_MARKER))?;
    let text = rest[..end].trim();

    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ParseError::InvalidNumber(text.to_string())),
    }
}

// ──────────────────────────────────────────────
// Comandos de saída
// ──────────────────────────────────────────────

/// Comandos aceitos pelo firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Reset,
}

impl DeviceCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reset => RESET_COMMAND,
        }
    }

    /// Frame completo, com terminador de linha.
    pub fn encode(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.as_str().len() + 1);
        frame.extend_from_slice(self.as_str().as_bytes());
        frame.push(b'\n');
        frame
    }
}

// ──────────────────────────────────────────────
// Framing serial
// ──────────────────────────────────────────────

/// Tamanho máximo de uma linha do dispositivo (bytes, sem o `\n`).
pub const MAX_LINE_LEN: usize = 1024;

/// Quebra o fluxo de bytes do link em linhas.
///
/// Bytes de uma linha incompleta ficam guardados entre timeouts de leitura.
/// Linhas acima de [`MAX_LINE_LEN`] são descartadas até o próximo `\n` e
/// contadas em [`LineReader::take_discarded`].
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    overflowed: bool,
    discarded: u64,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pending: Vec::with_capacity(128),
            overflowed: false,
            discarded: 0,
        }
    }

    /// Próxima linha, já sem espaços nas pontas.
    ///
    /// - `Ok(Some(line))` – linha completa
    /// - `Ok(None)` – timeout de leitura ou linha longa descartada
    /// - `Err(_)` – fim do fluxo ou falha de I/O (link perdido)
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let available = match self.inner.fill_buf() {
                Ok(buf) => buf,
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(e),
            };

            if available.is_empty() {
                if self.overflowed {
                    self.discard_line();
                }
                if self.pending.is_empty() {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "link serial encerrado"));
                }
                return Ok(Some(self.take_line()));
            }

            let (used, complete) = match available.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            };
            let room = MAX_LINE_LEN.saturating_sub(self.pending.len());
            let payload = if complete { used - 1 } else { used };
            if payload > room {
                self.overflowed = true;
            } else if !self.overflowed {
                self.pending.extend_from_slice(&available[..payload]);
            }
            self.inner.consume(used);

            if complete {
                if self.overflowed {
                    self.discard_line();
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }
        }
    }

    /// Linhas longas descartadas desde a última chamada.
    pub fn take_discarded(&mut self) -> u64 {
        std::mem::take(&mut self.discarded)
    }

    fn discard_line(&mut self) {
        warn!("Linha acima de {MAX_LINE_LEN} bytes descartada");
        self.pending.clear();
        self.overflowed = false;
        self.discarded += 1;
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        line
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
