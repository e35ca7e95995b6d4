//! Standalone floeterm server binary. Run with --port and --history, or use
//! defaults (optionally overridden by settings.json).

use std::net::SocketAddr;
use std::path::PathBuf;

use floeterm_server::{build_state, run_server, Settings};

const DEFAULT_PORT: u16 = 5183;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut port: Option<u16> = None;
    let mut history: Option<usize> = None;
    let mut settings_path = PathBuf::from("settings.json");

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            port = args[i + 1].parse().ok();
            i += 2;
            continue;
        }
        if args[i] == "--history" && i + 1 < args.len() {
            history = args[i + 1].parse().ok();
            i += 2;
            continue;
        }
        if args[i] == "--settings" && i + 1 < args.len() {
            settings_path = PathBuf::from(&args[i + 1]);
            i += 2;
            continue;
        }
        i += 1;
    }

    let settings = Settings::load(&settings_path);
    let port = port.or(settings.port).unwrap_or(DEFAULT_PORT);

    let mut config = floeterm_core::Config::default();
    if let Some(capacity) = history.or(settings.history_capacity) {
        config.history_capacity = capacity;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let manager = floeterm_core::SessionManager::new(config);
        let state = build_state(manager);
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        run_server(state, addr).await?;
        Ok(())
    })
}
