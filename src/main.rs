use anyhow::Context;
use tokio::io::{AsyncRead, BufReader};
use tracing::{info, warn};

use faderd::audio::{backend, DefaultDeviceWatcher};
use faderd::config::ConfigStore;
use faderd::telemetry::LineReader;
use faderd::Engine;

fn print_usage() {
    println!("USAGE: faderd [TELEMETRY_PATH]");
    println!();
    println!("Reads controller telemetry from TELEMETRY_PATH (e.g. a serial device),");
    println!("or from stdin when no path is given.");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    if let Ok(env_filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("info")
            .compact()
            .init();
    }

    let arg = ::std::env::args().nth(1);
    let input: Box<dyn AsyncRead + Unpin> = match arg.as_deref() {
        Some("-h") | Some("--help") => {
            print_usage();
            return Ok(());
        }
        Some(path) => {
            info!(path, "Reading telemetry");
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {path}"))?;
            Box::new(file)
        }
        None => {
            info!("Reading telemetry from stdin");
            Box::new(tokio::io::stdin())
        }
    };

    let mut store = ConfigStore::open();
    let updates = store.subscribe();
    let config = store.current();

    let mut engine = Engine::new(backend::create(config.backend), &config);
    let watcher = DefaultDeviceWatcher::spawn(engine.registry().clone(), config.watch_interval())
        .context("failed to start the default device watcher")?;

    let mut lines = LineReader::new(BufReader::new(input));
    let mut reload = tokio::time::interval(config.reload_interval());
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => engine.handle_line(&line),
                Ok(None) => {
                    info!("Telemetry input closed");
                    break Ok(());
                }
                Err(e) => break Err(anyhow::Error::new(e).context("failed to read telemetry")),
            },
            _ = reload.tick() => {
                store.reload_if_changed();
                while let Ok(config) = updates.try_recv() {
                    engine.apply_config(&config);
                }
            }
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                info!("Shutting down");
                break Ok(());
            }
        }
    };

    watcher.stop();
    engine.shutdown();
    result
}
