//! Optional `settings.json` overrides, read once at startup. Missing file or
//! malformed JSON silently falls back to defaults; CLI flags win over both.

use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct Settings {
    pub port: Option<u16>,
    pub history_capacity: Option<usize>,
}

impl Settings {
    pub fn load(path: &Path) -> Self {
        let Ok(data) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) else {
            return Self::default();
        };

        let port = root
            .get("port")
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok());
        let history_capacity = root
            .get("history")
            .and_then(|h| h.get("capacity"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .filter(|&v| v > 0);

        Self {
            port,
            history_capacity,
        }
    }
}
