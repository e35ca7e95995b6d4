//! floeterm server: Axum HTTP + WebSocket surface over the core engine.

pub mod attach;
pub mod settings;
pub mod web_server;
pub mod wire;

pub use attach::AttachHub;
pub use settings::Settings;
pub use web_server::{build_router, build_state, run_server, AppState};
