//! Printer front-end: the capability interface compiled statements call.
//!
//! [`Printer`] tracks the head position, heading and speeds, turns actuator
//! primitives (`move`, `extrude`, `turn`, `up`, `wait`, ...) into
//! [`MotionCommand`](crate::motion::MotionCommand)s, and enqueues them. The
//! set of methods is closed: [`Op`] names every one, and anything else is
//! rejected with [`LiveError::UnknownReceiver`].
//!
//! State is shared by the main flow and every task behind one async mutex that
//! is held for the duration of a call step, so positions are computed and
//! commands enqueued by one caller at a time.

use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::ast::{Args, ROOT_RECEIVER};
use crate::config::PrinterConfig;
use crate::error::LiveError;
use crate::motion::{MotionKind, Source};
use crate::queue::{MotionQueue, Ticket};
use crate::value::{CallArgs, Scope, Value};

/// Moves shorter than this are dropped.
const MIN_MOVE: f64 = 1e-4;

/// Every method a statement can call on the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Move,
    MoveTo,
    Extrude,
    ExtrudeTo,
    Turn,
    Distance,
    Go,
    Draw,
    Travel,
    Up,
    Down,
    UpTo,
    DownTo,
    TravelSpeed,
    PrintSpeed,
    Retract,
    Unretract,
    Wait,
    Gcode,
    Start,
    Temp,
    Bed,
    Fan,
    Sync,
    Get,
}

impl Op {
    pub fn from_method(method: &str) -> Option<Self> {
        let op = match method {
            "move" => Op::Move,
            "moveto" | "mov2" => Op::MoveTo,
            "extrude" => Op::Extrude,
            "extrudeto" | "ext2" => Op::ExtrudeTo,
            "turn" => Op::Turn,
            "dist" | "distance" => Op::Distance,
            "go" => Op::Go,
            "draw" => Op::Draw,
            "travel" => Op::Travel,
            "up" => Op::Up,
            "down" => Op::Down,
            "upto" => Op::UpTo,
            "downto" => Op::DownTo,
            "speed" | "travelspeed" => Op::TravelSpeed,
            "printspeed" => Op::PrintSpeed,
            "retract" => Op::Retract,
            "unretract" => Op::Unretract,
            "wait" => Op::Wait,
            "gcode" => Op::Gcode,
            "start" => Op::Start,
            "temp" => Op::Temp,
            "bed" => Op::Bed,
            "fan" => Op::Fan,
            "sync" => Op::Sync,
            "get" => Op::Get,
            _ => return None,
        };
        Some(op)
    }
}

/// What a call step hands to the next step in its chain.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The printer itself; the chain continues.
    Chain,
    /// A plain value; nothing can be called on it.
    Value(Value),
}

/// Head position and motion settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrinterState {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Absolute extruder position.
    pub e: f64,
    /// Heading in degrees, counter-clockwise from +X.
    pub heading: f64,
    /// Stored distance for `go`, `draw` and `travel`.
    pub distance: f64,
    pub travel_speed: f64,
    pub print_speed: f64,
    pub layer_height: f64,
    /// Filament currently pulled back by `retract`.
    pub retraction: f64,
}

impl PrinterState {
    fn new(config: &PrinterConfig) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            e: 0.0,
            heading: 0.0,
            distance: 0.0,
            travel_speed: config.travel_speed,
            print_speed: config.print_speed,
            layer_height: config.layer_height,
            retraction: 0.0,
        }
    }

    fn position(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Identifier lookup while a step's arguments are evaluated: `lp.*` names
/// read printer properties, bare names read runtime variables.
struct PrinterScope<'a> {
    state: &'a PrinterState,
    config: &'a PrinterConfig,
    vars: &'a HashMap<String, Value>,
}

impl Scope for PrinterScope<'_> {
    fn resolve(&self, path: &str) -> Option<Value> {
        match path.strip_prefix(ROOT_RECEIVER).and_then(|p| p.strip_prefix('.')) {
            Some(property) => property_value(self.state, self.config, property),
            None => self.vars.get(path).cloned(),
        }
    }
}

fn property_value(state: &PrinterState, config: &PrinterConfig, name: &str) -> Option<Value> {
    let n = match name {
        "x" => state.x,
        "y" => state.y,
        "z" => state.z,
        "e" => state.e,
        "cx" => config.bed_x / 2.0,
        "cy" => config.bed_y / 2.0,
        "minx" | "miny" | "minz" => 0.0,
        "maxx" => config.bed_x,
        "maxy" => config.bed_y,
        "maxz" => config.max_z,
        "lh" | "layerheight" => state.layer_height,
        "heading" | "angle" => state.heading,
        "d" | "distance" => state.distance,
        "tsp" | "travelspeed" => state.travel_speed,
        "psp" | "printspeed" => state.print_speed,
        "retraction" => state.retraction,
        _ => return None,
    };
    Some(Value::Number(n))
}

fn round4(n: f64) -> f64 {
    (n * 10_000.0).round() / 10_000.0
}

/// The live-coding context every statement starts from.
#[derive(Clone)]
pub struct Printer {
    state: Arc<Mutex<PrinterState>>,
    config: Arc<PrinterConfig>,
    queue: MotionQueue,
    await_completion: bool,
}

impl Printer {
    pub fn new(config: PrinterConfig, queue: MotionQueue, await_completion: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(PrinterState::new(&config))),
            config: Arc::new(config),
            queue,
            await_completion,
        }
    }

    pub fn queue(&self) -> &MotionQueue {
        &self.queue
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> PrinterState {
        self.state.lock().await.clone()
    }

    /// Execute one call step.
    ///
    /// Arguments are evaluated against the current printer state and `vars`,
    /// the resulting commands are enqueued in order, and, when configured,
    /// the call waits for all of them to complete.
    ///
    /// The step works on a copy of the state, committed once every command
    /// it produced is queued. A step that fails to queue leaves the state as
    /// it was.
    pub async fn call(
        &self,
        method: &str,
        args: &Args,
        vars: &HashMap<String, Value>,
        source: &Source,
        line: usize,
    ) -> Result<StepOutcome, LiveError> {
        let op = Op::from_method(method).ok_or_else(|| LiveError::UnknownReceiver {
            receiver: ROOT_RECEIVER.to_string(),
            method: method.to_string(),
            line,
        })?;

        let mut state = self.state.lock().await;
        let args = {
            let scope = PrinterScope {
                state: &state,
                config: &self.config,
                vars,
            };
            CallArgs::evaluate(method, args, &scope)?
        };
        debug!(%method, ?op, %source, "printer call");

        let mut tickets = Vec::new();
        let mut next = state.clone();
        let outcome = self.apply(op, &args, &mut next, source, &mut tickets).await?;
        *state = next;

        if self.await_completion {
            for ticket in tickets {
                ticket.completion().await?;
            }
        }
        drop(state);
        Ok(outcome)
    }

    async fn apply(
        &self,
        op: Op,
        args: &CallArgs,
        st: &mut PrinterState,
        source: &Source,
        tickets: &mut Vec<Ticket>,
    ) -> Result<StepOutcome, LiveError> {
        match op {
            Op::Move | Op::MoveTo => {
                args.check(&["x", "y", "z", "speed"])?;
                let relative = op == Op::Move;
                let target = self.target(st, args, relative)?;
                if let Some(speed) = args.number("speed", 3)? {
                    st.travel_speed = positive(args, "speed", speed)?;
                }
                let speed = st.travel_speed;
                tickets.extend(self.travel_to(st, target, speed, source).await?);
            }
            Op::Extrude | Op::ExtrudeTo => {
                args.check(&["x", "y", "z", "e", "speed"])?;
                let relative = op == Op::Extrude;
                let target = self.target(st, args, relative)?;
                let e = args
                    .number("e", 3)?
                    .map(|e| if relative { st.e + e } else { e });
                let speed = match args.number("speed", 4)? {
                    Some(s) => positive(args, "speed", s)?,
                    None => st.print_speed,
                };
                tickets.extend(self.extrude_to(st, target, e, speed, source).await?);
            }
            Op::Turn => {
                args.check(&["angle"])?;
                let angle = args.require_number("angle", 0)?;
                st.heading = (st.heading + angle).rem_euclid(360.0);
                let params = [("angle", Value::Number(angle))];
                tickets.push(self.enqueue(MotionKind::Turn, &params, source).await?);
            }
            Op::Distance => {
                args.check(&["d"])?;
                st.distance = args.require_number("d", 0)?;
            }
            Op::Go => {
                args.check(&["extrude"])?;
                let extrude = match args.get("extrude", 0) {
                    None => false,
                    Some(Value::Number(n)) => *n != 0.0,
                    Some(Value::Bool(b)) => *b,
                    Some(Value::Str(_)) => {
                        return Err(LiveError::InvalidArgument {
                            method: "go".to_string(),
                            message: "`extrude` must be a number or bool".to_string(),
                        })
                    }
                };
                tickets.extend(self.along_heading(st, extrude, source).await?);
            }
            Op::Draw | Op::Travel => {
                args.check(&["d"])?;
                if let Some(d) = args.number("d", 0)? {
                    st.distance = d;
                }
                tickets.extend(self.along_heading(st, op == Op::Draw, source).await?);
            }
            Op::Up | Op::Down => {
                args.check(&["d"])?;
                let d = args.require_number("d", 0)?;
                let dz = if op == Op::Up { d } else { -d };
                let target = [st.x, st.y, st.z + dz];
                let speed = st.travel_speed;
                tickets.extend(self.travel_to(st, target, speed, source).await?);
            }
            Op::UpTo | Op::DownTo => {
                args.check(&["z"])?;
                let z = args.require_number("z", 0)?;
                let target = [st.x, st.y, z];
                let speed = st.travel_speed;
                tickets.extend(self.travel_to(st, target, speed, source).await?);
            }
            Op::TravelSpeed => {
                args.check(&["speed"])?;
                st.travel_speed = positive(args, "speed", args.require_number("speed", 0)?)?;
            }
            Op::PrintSpeed => {
                args.check(&["speed"])?;
                st.print_speed = positive(args, "speed", args.require_number("speed", 0)?)?;
            }
            Op::Retract => {
                args.check(&["len", "speed"])?;
                if st.retraction > 0.0 {
                    return Ok(StepOutcome::Chain);
                }
                let len = args.number("len", 0)?.unwrap_or(self.config.retract_length);
                if len < 0.0 {
                    return Err(invalid(args, "retract length can't be less than 0"));
                }
                let speed = match args.number("speed", 1)? {
                    Some(s) => positive(args, "speed", s)?,
                    None => self.config.retract_speed,
                };
                st.retraction = len;
                st.e = round4(st.e - len);
                let params = [("e", Value::Number(st.e)), ("speed", Value::Number(speed))];
                tickets.push(self.enqueue(MotionKind::Extrude, &params, source).await?);
            }
            Op::Unretract => {
                args.check(&[])?;
                if st.retraction < 0.01 {
                    return Ok(StepOutcome::Chain);
                }
                st.e = round4(st.e + st.retraction);
                st.retraction = 0.0;
                let params = [
                    ("e", Value::Number(st.e)),
                    ("speed", Value::Number(self.config.retract_speed)),
                ];
                tickets.push(self.enqueue(MotionKind::Extrude, &params, source).await?);
            }
            Op::Wait => {
                args.check(&["ms"])?;
                let ms = args.require_number("ms", 0)?;
                if ms < 0.0 {
                    return Err(invalid(args, "wait time can't be negative"));
                }
                let params = [("ms", Value::Number(ms))];
                tickets.push(self.enqueue(MotionKind::Wait, &params, source).await?);
            }
            Op::Gcode => {
                args.check(&["code"])?;
                let code = args.require_string("code", 0)?;
                tickets.push(self.raw(&code, source).await?);
            }
            Op::Start => {
                args.check(&["temp"])?;
                let temp = args.number("temp", 0)?.unwrap_or(190.0);
                for code in ["G28", "G92 E0", "M106 S0"] {
                    tickets.push(self.raw(code, source).await?);
                }
                tickets.push(self.raw(&format!("M104 S{}", Value::Number(temp)), source).await?);
                *st = PrinterState {
                    travel_speed: st.travel_speed,
                    print_speed: st.print_speed,
                    layer_height: st.layer_height,
                    ..PrinterState::new(&self.config)
                };
            }
            Op::Temp | Op::Bed => {
                args.check(&["temp"])?;
                let temp = args.require_number("temp", 0)?;
                let code = if op == Op::Temp { "M104" } else { "M140" };
                tickets.push(self.raw(&format!("{} S{}", code, Value::Number(temp)), source).await?);
            }
            Op::Fan => {
                args.check(&["speed"])?;
                let speed = args.number("speed", 0)?.unwrap_or(100.0);
                tickets.push(self.raw(&format!("M106 S{}", Value::Number(speed)), source).await?);
            }
            Op::Sync => {
                args.check(&[])?;
                tickets.push(self.raw("M105", source).await?);
                tickets.push(self.raw("M114", source).await?);
            }
            Op::Get => {
                args.check(&["name"])?;
                let name = args.require_string("name", 0)?;
                let value = property_value(st, &self.config, &name)
                    .ok_or_else(|| LiveError::UnresolvedIdentifier(format!("{}.{}", ROOT_RECEIVER, name)))?;
                return Ok(StepOutcome::Value(value));
            }
        }
        Ok(StepOutcome::Chain)
    }

    /// Target position from `x`/`y`/`z` args, absolute or relative.
    fn target(&self, st: &PrinterState, args: &CallArgs, relative: bool) -> Result<[f64; 3], LiveError> {
        let mut target = st.position();
        for (i, axis) in ["x", "y", "z"].iter().enumerate() {
            if let Some(v) = args.number(axis, i)? {
                target[i] = if relative { target[i] + v } else { v };
            }
        }
        Ok(target)
    }

    fn clamp(&self, target: [f64; 3]) -> [f64; 3] {
        let max = [self.config.bed_x, self.config.bed_y, self.config.max_z];
        let mut clamped = target;
        for i in 0..3 {
            clamped[i] = round4(target[i].clamp(0.0, max[i]));
        }
        if clamped != target.map(round4) {
            warn!(?target, ?clamped, "position clipped to printer bounds");
        }
        clamped
    }

    async fn along_heading(
        &self,
        st: &mut PrinterState,
        extrude: bool,
        source: &Source,
    ) -> Result<Option<Ticket>, LiveError> {
        let rad = st.heading.to_radians();
        let target = [
            st.x + st.distance * rad.cos(),
            st.y + st.distance * rad.sin(),
            st.z,
        ];
        if extrude {
            let speed = st.print_speed;
            self.extrude_to(st, target, None, speed, source).await
        } else {
            let speed = st.travel_speed;
            self.travel_to(st, target, speed, source).await
        }
    }

    async fn travel_to(
        &self,
        st: &mut PrinterState,
        target: [f64; 3],
        speed: f64,
        source: &Source,
    ) -> Result<Option<Ticket>, LiveError> {
        let target = self.clamp(target);
        if distance(st.position(), target) < MIN_MOVE {
            return Ok(None);
        }
        [st.x, st.y, st.z] = target;
        let params = [
            ("x", Value::Number(st.x)),
            ("y", Value::Number(st.y)),
            ("z", Value::Number(st.z)),
            ("speed", Value::Number(speed)),
        ];
        self.enqueue(MotionKind::Move, &params, source).await.map(Some)
    }

    /// Printing move. Without an explicit `e`, filament is computed from the
    /// path length, layer height and nozzle width.
    async fn extrude_to(
        &self,
        st: &mut PrinterState,
        target: [f64; 3],
        e: Option<f64>,
        speed: f64,
        source: &Source,
    ) -> Result<Option<Ticket>, LiveError> {
        let target = self.clamp(target);
        let length = distance(st.position(), target);
        let new_e = match e {
            Some(e) => {
                st.retraction = 0.0;
                e
            }
            None => {
                let radius = self.config.filament_diameter / 2.0;
                let filament =
                    length * st.layer_height * self.config.nozzle_diameter / (PI * radius * radius);
                st.e + filament
            }
        };
        if length < MIN_MOVE && (new_e - st.e).abs() < MIN_MOVE {
            return Ok(None);
        }
        [st.x, st.y, st.z] = target;
        st.e = round4(new_e);
        let params = [
            ("x", Value::Number(st.x)),
            ("y", Value::Number(st.y)),
            ("z", Value::Number(st.z)),
            ("e", Value::Number(st.e)),
            ("speed", Value::Number(speed)),
        ];
        self.enqueue(MotionKind::Extrude, &params, source).await.map(Some)
    }

    async fn raw(&self, code: &str, source: &Source) -> Result<Ticket, LiveError> {
        let params = [("code", Value::Str(code.to_string()))];
        self.enqueue(MotionKind::RawGcode, &params, source).await
    }

    async fn enqueue(
        &self,
        kind: MotionKind,
        params: &[(&str, Value)],
        source: &Source,
    ) -> Result<Ticket, LiveError> {
        let params: BTreeMap<String, Value> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.queue.enqueue(kind, params, source.clone()).await
    }
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2) + (b[2] - a[2]).powi(2)).sqrt()
}

fn invalid(args: &CallArgs, message: &str) -> LiveError {
    LiveError::InvalidArgument {
        method: args.method.clone(),
        message: message.to_string(),
    }
}

fn positive(args: &CallArgs, name: &str, value: f64) -> Result<f64, LiveError> {
    if value > 0.0 {
        Ok(value)
    } else {
        Err(invalid(args, &format!("`{}` must be greater than 0, got {}", name, value)))
    }
}
