//! Thread de ingestão que roda o loop serial e avisa a saída via channel.

use crossbeam_channel::{Receiver, bounded};
use sentinela_core::ingest::{IngestLoop, LoopExit};
use std::io::Read;
use std::thread::JoinHandle;
use tracing::error;

/// Inicia a thread de ingestão. Retorna o handle e o receiver do motivo de saída.
pub fn spawn_ingest_thread<R>(ingest: IngestLoop<R>) -> std::io::Result<(JoinHandle<()>, Receiver<LoopExit>)>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded::<LoopExit>(1);

    let handle = std::thread::Builder::new()
        .name("serial-ingest".into())
        .spawn(move || {
            let exit = ingest.run();
            if tx.send(exit).is_err() {
                error!("Ninguém aguardando a saída do loop de ingestão");
            }
        })?;

    Ok((handle, rx))
}
