//! # Sentinela
//!
//! Ingestão serial de um controlador de segurança de câmara fria: grava as
//! linhas do dispositivo em SQLite, dispara `RESET_SYSTEM` quando a
//! temperatura passa do limite e expõe estado/histórico via API HTTP.
//!
//! Um único processo é dono do link serial; o reset manual da API usa o
//! mesmo despachante em processo que o loop de ingestão.
//!
//! ## Uso
//! ```bash
//! sentinela                          # Daemon (ingestão + API)
//! sentinela --config /etc/sentinela.toml
//! sentinela --reset                  # Envia RESET_SYSTEM uma vez e sai
//! sentinela --list-ports             # Lista portas seriais
//! ```

mod api;
mod serial_thread;

use crossbeam_channel::Receiver;
use sentinela_core::config::AppConfig;
use sentinela_core::dispatcher::{self, CommandDispatcher};
use sentinela_core::health::HealthCounters;
use sentinela_core::ingest::{IngestLoop, IngestSettings, LoopExit};
use sentinela_core::query::QueryService;
use sentinela_core::store::{EventStore, SqliteStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--list-ports") {
        list_ports();
        return ExitCode::SUCCESS;
    }

    // ── Carregar config ──
    let config_path = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("Config inválida: {e}");
        }
        return ExitCode::FAILURE;
    }

    // ── Banco ──
    let store = match SqliteStore::open(&config.storage.db_path, config.alerts.default_threshold) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Falha ao abrir {}: {e}", config.storage.db_path.display());
            return ExitCode::FAILURE;
        }
    };
    info!("Banco: {}", config.storage.db_path.display());

    if args.iter().any(|a| a == "--reset") {
        return one_shot_reset(&config, store);
    }

    run_daemon(config, store).await
}

/// Ingestão + API até Ctrl-C/SIGTERM ou perda do link.
async fn run_daemon(config: AppConfig, store: Arc<SqliteStore>) -> ExitCode {
    let policy = config.dispatch.retry_policy();
    let health = Arc::new(HealthCounters::new());

    // ── Link serial ──
    let port = match dispatcher::open_exclusive(&config.serial, &policy) {
        Ok(port) => port,
        Err(e) => {
            error!("Não foi possível abrir {}: {e}", config.serial.port);
            return ExitCode::FAILURE;
        }
    };
    let writer = match port.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            error!("Falha ao duplicar handle do link serial: {e}");
            return ExitCode::FAILURE;
        }
    };

    // A placa reinicia ao abrir a porta
    info!("Aguardando {} ms pela inicialização do dispositivo...", config.serial.settle_ms);
    tokio::time::sleep(Duration::from_millis(config.serial.settle_ms)).await;

    let dispatcher =
        Arc::new(CommandDispatcher::new(writer, policy).with_health(Arc::clone(&health)));
    let shutdown = Arc::new(AtomicBool::new(false));

    // ── Thread de ingestão ──
    let ingest = IngestLoop::new(
        port,
        store.clone(),
        Arc::clone(&dispatcher),
        Arc::clone(&health),
        Arc::clone(&shutdown),
        IngestSettings::from(&config),
    );
    let (ingest_handle, exit_rx) = match serial_thread::spawn_ingest_thread(ingest) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("Falha ao criar thread de ingestão: {e}");
            return ExitCode::FAILURE;
        }
    };

    // ── API ──
    let state = api::ApiState {
        service: QueryService::new(
            store.clone(),
            dispatcher,
            config.api.history_default_limit,
            config.api.history_max_limit,
        ),
        health,
    };
    let addr = format!("{}:{}", config.api.bind_ip, config.api.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Falha ao bind {addr}: {e}");
            shutdown.store(true, Ordering::Relaxed);
            let _ = ingest_handle.join();
            return ExitCode::FAILURE;
        }
    };

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   🧊 SENTINELA – ATIVO");
    println!("══════════════════════════════════════════════");
    println!("  Serial:    {} @ {} baud", config.serial.port, config.serial.baud_rate);
    println!("  API:       http://{addr}");
    println!(
        "  Threshold: {:.1}°C (cooldown {:.0}s)",
        threshold_or_default(store.as_ref(), &config),
        config.alerts.cooldown_secs
    );
    println!("══════════════════════════════════════════════");
    println!();

    // Supervisor: sinal de parada ou fim do loop derrubam a API
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let supervisor = {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let exit = supervise(exit_rx, shutdown, shutdown_signal()).await;
            let _ = stop_tx.send(());
            exit
        })
    };

    let served = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = stop_rx.await;
        })
        .await;
    if let Err(e) = served {
        error!("Servidor HTTP falhou: {e}");
        shutdown.store(true, Ordering::Relaxed);
    }

    let exit = supervisor.await.ok().flatten();
    if ingest_handle.join().is_err() {
        error!("Thread de ingestão terminou em pânico");
    }
    if let Err(e) = store.flush() {
        warn!("Falha ao descarregar o banco: {e}");
    }

    match exit {
        Some(LoopExit::Shutdown) => {
            info!("Encerrado");
            ExitCode::SUCCESS
        }
        Some(LoopExit::LinkLost(reason)) => {
            error!("Link serial perdido ({reason}); saindo para o supervisor reiniciar");
            ExitCode::FAILURE
        }
        None => ExitCode::FAILURE,
    }
}

/// Espera o loop de ingestão terminar. Se `signal` completar antes, levanta a
/// flag de desligamento e aguarda o loop liberar o link.
async fn supervise<S>(
    exit_rx: Receiver<LoopExit>,
    shutdown: Arc<AtomicBool>,
    signal: S,
) -> Option<LoopExit>
where
    S: Future<Output = ()>,
{
    let mut waiter = tokio::task::spawn_blocking(move || exit_rx.recv().ok());
    tokio::select! {
        exit = &mut waiter => exit.ok().flatten(),
        () = signal => {
            shutdown.store(true, Ordering::Relaxed);
            waiter.await.ok().flatten()
        }
    }
}

/// Completa no primeiro Ctrl-C ou SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C recebido, encerrando..."),
            Err(e) => {
                warn!("Não foi possível escutar Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM recebido, encerrando...");
            }
            Err(e) => {
                warn!("Não foi possível escutar SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

fn threshold_or_default(store: &SqliteStore, config: &AppConfig) -> f64 {
    store.get_threshold().unwrap_or(config.alerts.default_threshold)
}

/// Abre o dispositivo por conta própria, envia um reset e grava a auditoria.
///
/// Se o daemon estiver rodando, o dispositivo está ocupado e o comando falha
/// com `DeviceBusy` depois das tentativas configuradas.
fn one_shot_reset(config: &AppConfig, store: Arc<SqliteStore>) -> ExitCode {
    let policy = config.dispatch.retry_policy();
    let port = match dispatcher::open_exclusive(&config.serial, &policy) {
        Ok(port) => port,
        Err(e) => {
            error!("Reset não enviado: {e}");
            return ExitCode::FAILURE;
        }
    };

    let dispatcher = CommandDispatcher::new(port, policy);
    let service = QueryService::new(
        store,
        Arc::new(dispatcher),
        config.api.history_default_limit,
        config.api.history_max_limit,
    );
    match service.reset() {
        Ok(()) => {
            println!("Comando RESET_SYSTEM enviado");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Reset falhou ({}): {e}", e.class());
            ExitCode::FAILURE
        }
    }
}

fn list_ports() {
    match serialport::available_ports() {
        Ok(ports) if ports.is_empty() => println!("Nenhuma porta serial encontrada"),
        Ok(ports) => {
            for p in ports {
                println!("{}  ({:?})", p.port_name, p.port_type);
            }
        }
        Err(e) => eprintln!("Não foi possível listar portas: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[tokio::test]
    async fn stop_signal_raises_flag_and_waits_for_loop() {
        let (tx, rx) = bounded(1);
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let ingest = std::thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(5));
            }
            tx.send(LoopExit::Shutdown).unwrap();
        });

        let exit = supervise(rx, Arc::clone(&shutdown), async {}).await;
        assert_eq!(exit, Some(LoopExit::Shutdown));
        assert!(shutdown.load(Ordering::Relaxed));
        ingest.join().unwrap();
    }

    #[tokio::test]
    async fn loop_exit_is_reported_without_signal() {
        let (tx, rx) = bounded(1);
        tx.send(LoopExit::LinkLost("eof".into())).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));

        let exit = supervise(rx, Arc::clone(&shutdown), std::future::pending()).await;
        assert_eq!(exit, Some(LoopExit::LinkLost("eof".into())));
        assert!(!shutdown.load(Ordering::Relaxed));
    }
}
