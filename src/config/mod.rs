//! Application configuration
//!
//! Configuration is read once at startup from an optional JSON file. Missing
//! sections and fields fall back to their defaults; command line flags are
//! applied on top by the binary.

mod schema;

pub use schema::*;

use std::path::Path;

use tracing::{info, warn};

use crate::error::{AppError, Result};

impl AppConfig {
    /// Load configuration from `path`, or defaults if the file does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.web.http_port == 0 {
            return Err(AppError::Config("web.http_port must not be 0".to_string()));
        }
        if self.webrtc.max_buffered_amount == 0 {
            return Err(AppError::Config(
                "webrtc.max_buffered_amount must not be 0".to_string(),
            ));
        }
        for server in &self.webrtc.turn_servers {
            if server.urls.is_empty() {
                return Err(AppError::Config(
                    "webrtc.turn_servers entries need at least one url".to_string(),
                ));
            }
        }
        Ok(())
    }
}
