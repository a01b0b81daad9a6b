//! Configuração unificada via TOML.
//!
//! Um único `config.toml` ao lado do executável; todas as seções aceitam
//! arquivos parciais (`#[serde(default)]`).

use crate::alerts::DEFAULT_COOLDOWN;
use crate::dispatcher::RetryPolicy;
use crate::types::DEFAULT_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Erros ao salvar a configuração.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro de serialização TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Erro de escrita: {0}")]
    Io(#[from] std::io::Error),
}

/// Link serial com o dispositivo.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Caminho do dispositivo (`/dev/ttyACM0`, `COM3`…)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Timeout de leitura (ms); também é o período de housekeeping
    pub read_timeout_ms: u64,
    /// Espera após abrir o link enquanto a placa reinicia (ms)
    pub settle_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".into(),
            baud_rate: 9600,
            read_timeout_ms: 1000,
            settle_ms: 2000,
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Persistência.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Arquivo SQLite
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("sentinela.db"),
        }
    }
}

/// Threshold e debounce de alertas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Threshold usado enquanto nenhum valor foi gravado (°C)
    pub default_threshold: f64,
    /// Intervalo mínimo entre dois alertas (segundos)
    pub cooldown_secs: f64,
    /// Grava linhas STATUS sem temperatura válida (com `parse_failed`)
    pub store_unparsed_status: bool,
    /// Intervalo do log de estatísticas do loop (segundos)
    pub stats_interval_secs: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            default_threshold: DEFAULT_THRESHOLD,
            cooldown_secs: DEFAULT_COOLDOWN.as_secs_f64(),
            store_unparsed_status: false,
            stats_interval_secs: 60.0,
        }
    }
}

/// Teto para intervalos em segundos (um dia).
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        secs_or(self.cooldown_secs, 0.0, DEFAULT_COOLDOWN, "alerts.cooldown_secs")
    }

    pub fn stats_interval(&self) -> Duration {
        secs_or(self.stats_interval_secs, 1.0, Duration::from_secs(60), "alerts.stats_interval_secs")
    }
}

/// Converte segundos em `Duration`; fora de `min..=MAX_INTERVAL_SECS` usa o padrão.
fn secs_or(secs: f64, min: f64, fallback: Duration, field: &str) -> Duration {
    if (min..=MAX_INTERVAL_SECS).contains(&secs) {
        if let Ok(d) = Duration::try_from_secs_f64(secs) {
            return d;
        }
    }
    warn!("{field} inválido ({secs}), usando {:.0}s", fallback.as_secs_f64());
    fallback
}

/// Política de retry do despacho de comandos.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            backoff_ms: policy.backoff.as_millis() as u64,
        }
    }
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

/// API HTTP de consulta.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// IP local para bind
    pub bind_ip: String,
    /// Porta TCP
    pub port: u16,
    /// Itens do histórico quando `limit` não é informado
    pub history_default_limit: usize,
    /// Teto para `limit`
    pub history_max_limit: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_ip: "0.0.0.0".into(),
            port: 5000,
            history_default_limit: 50,
            history_max_limit: 500,
        }
    }
}

/// Configuração raiz.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub storage: StorageConfig,
    pub alerts: AlertConfig,
    pub dispatch: DispatchConfig,
    pub api: ApiConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Configuração carregada de {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!("Erro ao parsear {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Erro ao ler {}: {}", path.display(), e);
                }
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.serial.port.trim().is_empty() {
            errors.push("Porta serial não configurada".into());
        }
        if self.serial.baud_rate == 0 {
            errors.push("Baud rate não pode ser 0".into());
        }
        if self.serial.read_timeout_ms == 0 || self.serial.read_timeout_ms > 10_000 {
            errors.push(format!(
                "Timeout de leitura inválido: {} ms (1–10000)",
                self.serial.read_timeout_ms
            ));
        }
        if !self.alerts.default_threshold.is_finite() {
            errors.push("Threshold padrão precisa ser finito".into());
        }
        if !(0.0..=MAX_INTERVAL_SECS).contains(&self.alerts.cooldown_secs) {
            errors.push(format!(
                "Cooldown inválido: {} s (0–{MAX_INTERVAL_SECS})",
                self.alerts.cooldown_secs
            ));
        }
        if !(1.0..=MAX_INTERVAL_SECS).contains(&self.alerts.stats_interval_secs) {
            errors.push(format!(
                "Intervalo de estatísticas inválido: {} s (1–{MAX_INTERVAL_SECS})",
                self.alerts.stats_interval_secs
            ));
        }
        if self.dispatch.max_attempts == 0 {
            errors.push("dispatch.max_attempts precisa ser pelo menos 1".into());
        }
        if self.api.port == 0 {
            errors.push("Porta da API não pode ser 0".into());
        }
        if self.api.history_default_limit > self.api.history_max_limit {
            errors.push(format!(
                "history_default_limit ({}) maior que history_max_limit ({})",
                self.api.history_default_limit, self.api.history_max_limit
            ));
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        let errors = config.validate();
        assert!(errors.is_empty(), "Erros: {:?}", errors);
    }

    #[test]
    fn defaults_match_device_contract() {
        let config = AppConfig::default();
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.alerts.default_threshold, 27.0);
        assert_eq!(config.alerts.cooldown(), Duration::from_secs(30));
        assert_eq!(config.dispatch.retry_policy().max_attempts, 3);
        assert_eq!(config.dispatch.retry_policy().backoff, Duration::from_millis(100));
        assert_eq!(config.api.history_default_limit, 50);
    }

    #[test]
    fn roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.serial.port, parsed.serial.port);
        assert_eq!(config.api.port, parsed.api.port);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let partial = r#"
[serial]
port = "/dev/ttyUSB1"

[alerts]
cooldown_secs = 5.0
"#;
        let config: AppConfig = toml::from_str(partial).unwrap();
        assert_eq!(config.serial.port, "/dev/ttyUSB1");
        assert_eq!(config.alerts.cooldown(), Duration::from_secs(5));
        // Outros campos devem ter valor padrão
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.api.port, 5000);
    }

    #[test]
    fn invalid_values_are_reported() {
        let mut config = AppConfig::default();
        config.serial.port = " ".into();
        config.dispatch.max_attempts = 0;
        config.api.history_default_limit = 1000;
        let errors = config.validate();
        assert_eq!(errors.len(), 3, "Erros: {:?}", errors);
    }

    #[test]
    fn out_of_range_intervals_are_rejected_without_panicking() {
        for bad in [1e20, f64::INFINITY, f64::NAN, -1.0] {
            let mut config = AppConfig::default();
            config.alerts.cooldown_secs = bad;
            config.alerts.stats_interval_secs = bad;
            let errors = config.validate();
            assert_eq!(errors.len(), 2, "valor {bad}: {:?}", errors);
            assert_eq!(config.alerts.cooldown(), DEFAULT_COOLDOWN);
            assert_eq!(config.alerts.stats_interval(), Duration::from_secs(60));
        }
    }

    #[test]
    fn zero_cooldown_is_allowed() {
        let mut config = AppConfig::default();
        config.alerts.cooldown_secs = 0.0;
        assert!(config.validate().is_empty());
        assert_eq!(config.alerts.cooldown(), Duration::ZERO);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.api.port = 8080;
        config.save(&path).unwrap();
        let loaded = AppConfig::load(&path);
        assert_eq!(loaded.api.port, 8080);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load(&dir.path().join("nao_existe.toml"));
        assert_eq!(loaded.api.port, 5000);
    }
}
