//! Despacho de comandos para o dispositivo.
//!
//! O firmware não tem framing contra escritas intercaladas, então no máximo
//! um escritor pode usar o link por vez. Dentro do processo isso é garantido
//! pelo mutex em volta da escrita de um frame completo; contenda (lock ocupado,
//! dispositivo aberto por outro processo, `WouldBlock`) vira retry com backoff
//! fixo e, esgotadas as tentativas, [`DispatchError::DeviceBusy`].

use crate::config::SerialConfig;
use crate::health::HealthCounters;
use crate::protocol::DeviceCommand;
use serialport::SerialPort;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Erros de despacho.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Dispositivo ocupado após {attempts} tentativas")]
    DeviceBusy { attempts: u32 },

    #[error("Link serial perdido: {0}")]
    LinkLost(String),
}

/// Tentativas e intervalo entre elas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Dono do lado de escrita do link serial.
pub struct CommandDispatcher {
    link: Mutex<Box<dyn Write + Send>>,
    policy: RetryPolicy,
    health: Option<Arc<HealthCounters>>,
}

impl CommandDispatcher {
    pub fn new(link: impl Write + Send + 'static, policy: RetryPolicy) -> Self {
        Self {
            link: Mutex::new(Box::new(link)),
            policy,
            health: None,
        }
    }

    /// Contabiliza envios e falhas nos contadores de saúde.
    pub fn with_health(mut self, health: Arc<HealthCounters>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Envia `RESET_SYSTEM`.
    pub fn send_reset(&self) -> Result<(), DispatchError> {
        self.send(DeviceCommand::Reset)
    }

    /// Envia um comando como frame único.
    pub fn send(&self, command: DeviceCommand) -> Result<(), DispatchError> {
        let result = self.send_frame(&command.encode());
        if let Some(health) = &self.health {
            match &result {
                Ok(()) => health.command_sent(),
                Err(_) => health.dispatch_failed(),
            }
        }
        match &result {
            Ok(()) => info!("Comando {} enviado ao dispositivo", command.as_str()),
            Err(e) => warn!("Falha ao enviar {}: {e}", command.as_str()),
        }
        result
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), DispatchError> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            let outcome = match self.link.try_lock() {
                Ok(mut link) => write_frame(&mut **link, frame, &self.policy),
                // Um escritor morreu no meio de um frame; o link continua utilizável
                Err(TryLockError::Poisoned(poisoned)) => {
                    let mut link = poisoned.into_inner();
                    write_frame(&mut **link, frame, &self.policy)
                }
                Err(TryLockError::WouldBlock) => Err(WriteOutcome::Contended),
            };

            match outcome {
                Ok(()) => return Ok(()),
                Err(WriteOutcome::Lost(e)) => return Err(DispatchError::LinkLost(e.to_string())),
                Err(WriteOutcome::Contended) => {
                    debug!("Link ocupado (tentativa {attempt}/{attempts})");
                    if attempt < attempts {
                        std::thread::sleep(self.policy.backoff);
                    }
                }
            }
        }
        Err(DispatchError::DeviceBusy { attempts })
    }
}

enum WriteOutcome {
    Contended,
    Lost(io::Error),
}

/// Escreve o frame inteiro acompanhando o offset.
///
/// Contenda antes do primeiro byte permite repetir o frame. Depois que parte
/// dele saiu, só o restante pode ser enviado; se o link não voltar dentro da
/// política, o frame ficou truncado no fio e o link é dado como perdido.
fn write_frame(
    link: &mut (dyn Write + Send),
    frame: &[u8],
    policy: &RetryPolicy,
) -> Result<(), WriteOutcome> {
    let mut written = 0;
    let mut stalls = 0;
    while written < frame.len() {
        match link.write(&frame[written..]) {
            Ok(0) => {
                return Err(WriteOutcome::Lost(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("link recusou bytes ({written}/{} enviados)", frame.len()),
                )));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_contention(e.kind()) => {
                if written == 0 {
                    return Err(WriteOutcome::Contended);
                }
                stalls += 1;
                if stalls >= policy.max_attempts.max(1) {
                    return Err(WriteOutcome::Lost(io::Error::new(
                        e.kind(),
                        format!("frame truncado ({written}/{} bytes): {e}", frame.len()),
                    )));
                }
                debug!("Link travou no meio do frame ({written}/{} bytes)", frame.len());
                std::thread::sleep(policy.backoff);
            }
            Err(e) => return Err(WriteOutcome::Lost(e)),
        }
    }
    // Bytes já estão no fio: falha aqui não pode virar reenvio
    link.flush().map_err(WriteOutcome::Lost)
}

fn is_contention(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::WouldBlock | io::ErrorKind::ResourceBusy | io::ErrorKind::TimedOut
    )
}

// ──────────────────────────────────────────────
// Abertura exclusiva do dispositivo
// ──────────────────────────────────────────────

/// Abre o dispositivo serial; `EBUSY` (aberto por outro processo) é retentado.
pub fn open_exclusive(
    config: &SerialConfig,
    policy: &RetryPolicy,
) -> Result<Box<dyn SerialPort>, DispatchError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        let opened = serialport::new(&config.port, config.baud_rate)
            .timeout(config.read_timeout())
            .flow_control(serialport::FlowControl::None)
            .open();

        match opened {
            Ok(port) => {
                info!("Link serial aberto em {} @ {} baud", config.port, config.baud_rate);
                return Ok(port);
            }
            Err(e) if is_busy(&e) => {
                warn!("{} ocupado (tentativa {attempt}/{attempts}): {e}", config.port);
                if attempt < attempts {
                    std::thread::sleep(policy.backoff);
                }
            }
            Err(e) => return Err(DispatchError::LinkLost(format!("{}: {e}", config.port))),
        }
    }
    Err(DispatchError::DeviceBusy { attempts })
}

fn is_busy(e: &serialport::Error) -> bool {
    match e.kind() {
        serialport::ErrorKind::Io(kind) if is_contention(kind) => true,
        // No Linux o EBUSY chega como Io(Other) com a descrição do errno
        _ => e.description.to_ascii_lowercase().contains("busy"),
    }
}
