//! Motion command types.
//!
//! A [`MotionCommand`] is created when script code invokes an actuator
//! primitive, consumed exactly once by the queue's drain loop, and never
//! mutated in between.
//!
//! # Rendering
//!
//! Commands that reach the device render to a single G-code line:
//!
//! ```
//! use std::collections::BTreeMap;
//! use printloop_core::motion::{MotionCommand, MotionKind, Source};
//! use printloop_core::value::Value;
//!
//! let mut params = BTreeMap::new();
//! params.insert("x".to_string(), Value::Number(20.0));
//! params.insert("speed".to_string(), Value::Number(80.0));
//! let cmd = MotionCommand::new(1, MotionKind::Move, params, Source::Main);
//! assert_eq!(cmd.to_gcode().as_deref(), Some("G0 X20 F4800"));
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::{format_number, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionKind {
    /// Travel without extruding (`G0`).
    Move,
    /// Heading change; bookkeeping only, nothing is sent.
    Turn,
    /// Printing move (`G1` with `E`).
    Extrude,
    /// Local pause of `ms` milliseconds inside the queue.
    Wait,
    /// Verbatim G-code in the `code` param.
    RawGcode,
}

impl MotionKind {
    /// Physical kinds wait for the device's motion-complete signal before the
    /// queue releases the next command.
    pub fn is_physical(self) -> bool {
        matches!(self, MotionKind::Move | MotionKind::Extrude)
    }
}

impl fmt::Display for MotionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MotionKind::Move => "move",
            MotionKind::Turn => "turn",
            MotionKind::Extrude => "extrude",
            MotionKind::Wait => "wait",
            MotionKind::RawGcode => "raw_gcode",
        };
        f.write_str(s)
    }
}

/// Who enqueued a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name")]
pub enum Source {
    /// The main performance flow (typed or loaded code).
    Main,
    /// A scheduled task, by name.
    Task(String),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Main => f.write_str("main"),
            Source::Task(name) => write!(f, "task:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionCommand {
    /// Monotonic sequence number; equal to the command's position in the queue.
    pub id: u64,
    pub kind: MotionKind,
    pub params: BTreeMap<String, Value>,
    pub submitted_by: Source,
    pub queued_at: DateTime<Utc>,
}

impl MotionCommand {
    pub fn new(id: u64, kind: MotionKind, params: BTreeMap<String, Value>, submitted_by: Source) -> Self {
        Self {
            id,
            kind,
            params,
            submitted_by,
            queued_at: Utc::now(),
        }
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.params.get(name).and_then(Value::as_number)
    }

    /// The G-code line sent to the device, or `None` for kinds the queue
    /// handles itself.
    pub fn to_gcode(&self) -> Option<String> {
        match self.kind {
            MotionKind::Move => Some(self.axis_line("G0", &["x", "y", "z"])),
            MotionKind::Extrude => Some(self.axis_line("G1", &["x", "y", "z", "e"])),
            MotionKind::RawGcode => self.params.get("code").map(|v| v.to_string()),
            MotionKind::Wait | MotionKind::Turn => None,
        }
    }

    fn axis_line(&self, code: &str, axes: &[&str]) -> String {
        let mut line = code.to_string();
        for axis in axes {
            if let Some(v) = self.number(axis) {
                line.push_str(&format!(" {}{}", axis.to_ascii_uppercase(), format_number(v)));
            }
        }
        if let Some(speed) = self.number("speed") {
            // mm/s to mm/min
            line.push_str(&format!(" F{}", format_number(speed * 60.0)));
        }
        line
    }

    /// Duration of a `Wait` command.
    pub fn wait_duration(&self) -> Duration {
        let ms = self.number("ms").unwrap_or(0.0).max(0.0);
        Duration::from_millis(ms.round() as u64)
    }
}

/// Acknowledgment delivered to the enqueuer once a command completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub id: u64,
    /// Reply lines from the device, excluding the final `ok`.
    pub replies: Vec<String>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_move_renders_g0() {
        let cmd = MotionCommand::new(
            1,
            MotionKind::Move,
            params(&[
                ("x", Value::Number(10.0)),
                ("y", Value::Number(20.5)),
                ("z", Value::Number(0.2)),
                ("speed", Value::Number(50.0)),
            ]),
            Source::Main,
        );
        assert_eq!(cmd.to_gcode().unwrap(), "G0 X10 Y20.5 Z0.2 F3000");
    }

    #[test]
    fn test_extrude_renders_g1_with_e() {
        let cmd = MotionCommand::new(
            2,
            MotionKind::Extrude,
            params(&[
                ("x", Value::Number(30.0)),
                ("e", Value::Number(0.12345)),
                ("speed", Value::Number(30.0)),
            ]),
            Source::Task("zbump".into()),
        );
        assert_eq!(cmd.to_gcode().unwrap(), "G1 X30 E0.1235 F1800");
    }

    #[test]
    fn test_raw_and_local_kinds() {
        let raw = MotionCommand::new(3, MotionKind::RawGcode, params(&[("code", "M105".into())]), Source::Main);
        assert_eq!(raw.to_gcode().as_deref(), Some("M105"));

        let wait = MotionCommand::new(4, MotionKind::Wait, params(&[("ms", Value::Number(250.0))]), Source::Main);
        assert_eq!(wait.to_gcode(), None);
        assert_eq!(wait.wait_duration(), Duration::from_millis(250));

        let turn = MotionCommand::new(5, MotionKind::Turn, params(&[("angle", Value::Number(90.0))]), Source::Main);
        assert_eq!(turn.to_gcode(), None);
    }

    #[test]
    fn test_physical_kinds() {
        assert!(MotionKind::Move.is_physical());
        assert!(MotionKind::Extrude.is_physical());
        assert!(!MotionKind::Wait.is_physical());
        assert!(!MotionKind::RawGcode.is_physical());
    }

    #[test]
    fn test_source_serialization() {
        let json = serde_json::to_string(&Source::Task("zbump".into())).unwrap();
        assert_eq!(json, r#"{"type":"Task","name":"zbump"}"#);
        assert_eq!(Source::Main.to_string(), "main");
    }
}
