//! Persistent configuration for printloop.
//!
//! Stores settings in `~/.printloop/config.json`. Every field has a default, so
//! a partial or missing file is fine.
//!
//! # Example
//!
//! ```no_run
//! use printloop_core::config::PrintloopConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = PrintloopConfig::load();
//! println!("queue capacity: {}", config.queue.capacity);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.json";

/// Returns `~/.printloop`, creating it if needed.
pub fn printloop_dir() -> PathBuf {
    let dir = dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".printloop");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// What `enqueue` does when the motion queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Suspend the caller until a slot frees up.
    #[default]
    Block,
    /// Return `QueueFull` immediately.
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub capacity: usize,
    pub backpressure: Backpressure,
    /// Bound on one command's round-trip, including motion completion.
    pub ack_timeout_ms: u64,
    /// Printer primitives wait for their command to complete before returning.
    pub await_completion: bool,
    /// Physical moves wait for the device's motion-complete signal.
    pub wait_for_motion: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            backpressure: Backpressure::Block,
            ack_timeout_ms: 30_000,
            await_completion: true,
            wait_for_motion: true,
        }
    }
}

impl QueueConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long the loop sleeps when no task is registered.
    pub idle_poll_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { idle_poll_ms: 1000 }
    }
}

/// Machine geometry and motion defaults, in millimetres and mm/s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    pub bed_x: f64,
    pub bed_y: f64,
    pub max_z: f64,
    pub travel_speed: f64,
    pub print_speed: f64,
    pub layer_height: f64,
    pub nozzle_diameter: f64,
    pub filament_diameter: f64,
    pub retract_length: f64,
    pub retract_speed: f64,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            bed_x: 200.0,
            bed_y: 200.0,
            max_z: 200.0,
            travel_speed: 50.0,
            print_speed: 30.0,
            layer_height: 0.2,
            nozzle_diameter: 0.4,
            filament_diameter: 1.75,
            retract_length: 4.0,
            retract_speed: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            read_timeout_ms: 30_000,
        }
    }
}

/// Persistent printloop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PrintloopConfig {
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub printer: PrinterConfig,
    pub transport: TransportConfig,
}

impl PrintloopConfig {
    /// Load config from `~/.printloop/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        Self::load_from(&printloop_dir().join(CONFIG_FILENAME))
    }

    pub fn load_from(path: &std::path::Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.printloop/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let path = printloop_dir().join(CONFIG_FILENAME);
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
