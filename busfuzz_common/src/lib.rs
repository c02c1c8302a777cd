//! Collection of common implementations for `busfuzz_core`
//!
//! `busfuzz_common` is a collection of ready to use implementations for the
//! traits consumed by `busfuzz_core`.
//!
//! Currently there are the following common implementations:
//!
//! - `Transport`
//!     - `SocketCanTransport`: Drives a SocketCAN interface (physical `can0`
//!       or virtual `vcan0`) with a background receive listener.
//!

#![deny(missing_docs)]
#![deny(unsafe_code, clippy::unwrap_used)]
#![warn(clippy::pedantic)]

/// A collection of different `Transport` implementations
pub mod transport;
