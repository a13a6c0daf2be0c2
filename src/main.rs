mod backend;
mod bike;
mod bluez;
mod broadcaster;
mod control;
mod debug_server;
mod protocol;
mod status;

use std::sync::Arc;

use futures::pin_mut;
use tokio::sync::{mpsc, Mutex};

use backend::Backend;
use bike::BikeState;
use bluez::BluezBackend;
use broadcaster::Broadcaster;
use debug_server::TcpBackend;
use status::Emitter;

const DEFAULT_TCP_PORT: u16 = 8830;
// Keep the name short so the service UUID still fits in the advertisement
const DEFAULT_DEVICE_NAME: &str = "TD Bike";

#[tokio::main]
async fn main() {
    env_logger::init();

    let (backend_kind, port, device_name) = parse_args();
    log::info!(
        "FTMS bike daemon starting, backend: {}, device name: '{}'",
        backend_kind,
        device_name
    );

    let state = Arc::new(Mutex::new(BikeState::default()));
    let emitter = Emitter::stdout();
    let broadcaster = Arc::new(Broadcaster::new(state.clone(), emitter.clone(), device_name));
    let (stop_tx, stop_rx) = mpsc::channel(1);

    tokio::spawn(bike::run(state, stop_tx.clone(), emitter));

    let result = match backend_kind.as_str() {
        "bluez" => serve(broadcaster, BluezBackend::new(), stop_tx, stop_rx).await,
        "tcp" => serve(broadcaster, TcpBackend::new(port), stop_tx, stop_rx).await,
        other => {
            log::error!("Unknown backend '{}', expected 'bluez' or 'tcp'", other);
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        log::error!("Broadcaster exited with error: {}", e);
        std::process::exit(1);
    }

    log::info!("FTMS bike daemon shut down");
}

/// Drive the broadcaster on the chosen transport until it finishes. SIGINT
/// feeds the same stop channel as an ingest `stop` command, so both paths
/// share one orderly shutdown.
async fn serve<B: Backend>(
    broadcaster: Arc<Broadcaster>,
    backend: B,
    stop_tx: mpsc::Sender<()>,
    stop_rx: mpsc::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let run = broadcaster.run(backend, stop_rx);
    pin_mut!(run);

    tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received shutdown signal");
            // A stop may already be queued from stdin; one is enough
            let _ = stop_tx.try_send(());
            (&mut run).await
        }
    }
}

fn parse_args() -> (String, u16, String) {
    let args: Vec<String> = std::env::args().collect();
    let mut backend = "bluez".to_string();
    let mut port = DEFAULT_TCP_PORT;
    let mut device_name = DEFAULT_DEVICE_NAME.to_string();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--backend" => {
                if let Some(kind) = args.get(i + 1) {
                    backend = kind.clone();
                    i += 1;
                }
            }
            "--port" => {
                if let Some(port_arg) = args.get(i + 1) {
                    port = port_arg.parse().unwrap_or(DEFAULT_TCP_PORT);
                    i += 1;
                }
            }
            "--device-name" => {
                if let Some(name) = args.get(i + 1) {
                    device_name = name.clone();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    (backend, port, device_name)
}
