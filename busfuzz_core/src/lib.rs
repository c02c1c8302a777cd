//!
//! `busfuzz` is a CAN bus fuzzing and diagnostics engine. It discovers live
//! arbitration IDs on a vehicle bus, drives UDS/DCM diagnostic sessions,
//! probes XCP memory, and generates or replays fuzzed CAN frames with
//! reproducible randomness and session logging.
//!
//! The engine is transport agnostic: everything talks to the bus through the
//! [`traits::Transport`] trait, so the same code runs against a physical
//! interface, a virtual `vcan` channel or a scripted test double. A ready to
//! use SocketCAN implementation lives in the `busfuzz_common` crate.
//!
//! The usual entry point is [`cli::CanFuzzBuilder`], which parses the command
//! line and dispatches to the individual modules:
//!
//! ```rs
//! #[tokio::main]
//! async fn main() {
//!     let builder = CanFuzzBuilder::new(SocketCanTransport::new);
//!     if let Err(err) = builder.start_cli().await {
//!         eprintln!("{err}");
//!         std::process::exit(1);
//!     }
//! }
//! ```
//!
//! Every module can also be driven headless through its driver type
//! ([`fuzz::engine::FuzzEngine`], [`dcm::DcmDriver`], [`xcp::XcpDriver`],
//! [`discover`]) on top of a [`session::Session`].
//!

#![deny(missing_docs)]
#![deny(unsafe_code, clippy::unwrap_used)]
#![warn(clippy::pedantic)]

/// Contains the `Transport` trait that connects the engine to a CAN channel.
/// A SocketCAN implementation is provided by the `busfuzz_common` crate.
pub mod traits;

/// The validated CAN frame value type used everywhere in the engine.
pub mod frame;

/// Encoding and decoding of message literals and candump style log lines.
pub mod codec;

/// Nibble masks: which nibbles of an arbitration ID and payload are mutable.
pub mod mask;

/// Seeded random generation helpers for the `random` and `mutate` modes.
pub mod mutator;

/// Session context and the append-only session log.
pub mod session;

/// Arbitration ID discovery and passive listening.
pub mod discover;

/// UDS/DCM diagnostic session driver.
pub mod dcm;

/// XCP driver: slave discovery, info and memory dump.
pub mod xcp;

/// Contains the fuzzing engine with its five modes.
pub mod fuzz;

/// Length attack: DLC sweeps with patterned payloads.
pub mod lenattack;

/// Manage the logger. This initializes the `tracing_subscriber` used for all
/// streaming output.
pub mod log;

/// Contains all the different errors `busfuzz_core` can return.
pub mod error;

/// Contains the `CanFuzzBuilder` to start `busfuzz_core` in CLI mode.
pub mod cli;

#[cfg(test)]
pub(crate) mod testutil;
