//! # printloop-core
//!
//! Core library for live-coding a 3D printer.
//!
//! A performer types terse shorthand (`# moveto x: 20 y: 20 | turn 45`) while
//! the printer keeps moving. This crate compiles that shorthand into call
//! chains, runs them against a printer model, schedules named periodic tasks
//! that can be swapped without stopping, and serializes every resulting
//! motion command into one ordered, acknowledgment-gated stream to the device.
//!
//! ## Modules
//!
//! - [`lexer`], [`compiler`], [`ast`] - Shorthand tokenizer and compiler
//! - [`value`] - Runtime values and argument evaluation
//! - [`printer`] - The capability interface statements call
//! - [`scheduler`] - Named, hot-swappable periodic tasks
//! - [`queue`], [`motion`] - Ordered motion command queue
//! - [`transport`], [`gcode_client`] - Device links (TCP G-code, dry run)
//! - [`session`] - Event bus and JSON Lines event log
//! - [`live`] - Runtime wiring everything together
//! - [`config`] - Persistent settings in `~/.printloop/config.json`
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use printloop_core::config::PrintloopConfig;
//! use printloop_core::live::Live;
//! use printloop_core::session::Session;
//! use printloop_core::transport::DryRunTransport;
//!
//! # async fn example() {
//! let live = Live::start(
//!     &PrintloopConfig::load(),
//!     Arc::new(DryRunTransport::new()),
//!     Session::new("rehearsal"),
//! )
//! .await;
//!
//! let report = live.run_source("##\n# start 200\nupto 5\n##").await;
//! assert!(report.is_clean());
//! live.shutdown().await;
//! # }
//! ```

pub mod ast;
pub mod compiler;
pub mod config;
pub mod error;
pub mod gcode_client;
pub mod lexer;
pub mod live;
pub mod motion;
pub mod printer;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod value;

pub use error::{LiveError, ParseError};
pub use live::{Executor, Live, RunReport};
