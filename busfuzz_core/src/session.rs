//! The per-invocation session context and the append-only session log.
//!
//! Every module runs on top of a [`Session`]: one transport handle, one log
//! writer and one set of timeouts, constructed once per invocation and passed
//! explicitly instead of living in globals. The log records every transmitted
//! and received frame as a candump style line so any run can later be
//! replayed or bisected with `fuzzer replay` / `fuzzer identify`.

use crate::codec::{format_candump, parse_candump};
use crate::error::{CanFuzzError, CanFuzzResult};
use crate::frame::Frame;
use crate::traits::Transport;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// The unit replayed from a session log: a frame and the pause that preceded
/// it in the original run.
#[derive(Debug, Clone)]
pub struct FuzzDirective {
    /// The recorded frame.
    pub frame: Frame,
    /// Pause between the previous directive and this one.
    pub delay_since_previous: Duration,
}

/// Timeouts and pacing for one invocation. The spec deliberately leaves the
/// exact values to the operator, so all of these are plain CLI flags with
/// these defaults.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// How long a diagnostic request waits for its reply.
    pub response_timeout: Duration,
    /// How long a discovery probe waits before moving to the next ID.
    pub probe_timeout: Duration,
    /// Pause between consecutive fuzzed frames.
    pub frame_delay: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(200),
            frame_delay: Duration::from_millis(10),
        }
    }
}

/// Append-only writer for the session log. The only mutation is `append`;
/// every line is flushed to disk immediately so an interrupted run loses
/// nothing.
pub struct SessionLog {
    path: PathBuf,
    interface: String,
    file: File,
}

impl SessionLog {
    /// Opens (or creates) the log file for appending.
    /// # Errors
    pub fn open(path: &Path, interface: &str) -> CanFuzzResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            interface: interface.to_owned(),
            file,
        })
    }

    /// Appends one frame as a candump line and flushes.
    /// # Errors
    pub fn append(&mut self, frame: &Frame) -> CanFuzzResult<()> {
        let line = format_candump(frame, &self.interface);
        writeln!(self.file, "{line}")?;
        self.file.flush()?;
        Ok(())
    }

    /// Location of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads a previously written log into an ordered directive sequence,
    /// with inter-frame delays derived from the recorded timestamps. Any
    /// unparsable line aborts the load: a replay cannot proceed from a
    /// corrupt source.
    /// # Errors
    pub fn load(path: &Path) -> CanFuzzResult<Vec<FuzzDirective>> {
        let file = File::open(path)?;
        let mut directives = Vec::new();
        let mut previous_ts: Option<f64> = None;

        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let frame = parse_candump(&line).map_err(|err| CanFuzzError::LogFormat {
                path: path.to_path_buf(),
                line: index + 1,
                reason: err.to_string(),
            })?;

            let delay = match previous_ts {
                Some(prev) if frame.timestamp() > prev => {
                    Duration::from_secs_f64(frame.timestamp() - prev)
                }
                _ => Duration::ZERO,
            };
            previous_ts = Some(frame.timestamp());
            directives.push(FuzzDirective {
                frame,
                delay_since_previous: delay,
            });
        }
        Ok(directives)
    }
}

/// The session context: transport handle, log writer and timeouts for one
/// invocation.
pub struct Session<T: Transport> {
    /// The bus channel.
    pub transport: T,
    /// Timeouts and pacing.
    pub config: BusConfig,
    log: SessionLog,
}

impl<T: Transport> Session<T> {
    /// Bundles an opened transport with a log writer.
    pub fn new(transport: T, log: SessionLog, config: BusConfig) -> Self {
        Self {
            transport,
            config,
            log,
        }
    }

    /// Transmits a frame and records it in the session log.
    /// # Errors
    pub async fn send(&mut self, frame: &Frame) -> CanFuzzResult<()> {
        self.transport.send(frame).await?;
        self.log.append(frame)
    }

    /// Returns the next already-queued frame without waiting, logging it.
    /// Used by the fuzz loops to harvest responses between transmissions.
    /// # Errors
    pub async fn poll_received(&mut self) -> CanFuzzResult<Option<Frame>> {
        let frame = self.transport.recv(Duration::ZERO).await?;
        if let Some(frame) = &frame {
            self.log.append(frame)?;
        }
        Ok(frame)
    }

    /// Waits up to `timeout` for a frame, optionally restricted to a single
    /// arbitration ID. Every received frame is logged; frames from other IDs
    /// are skipped but do not reset the deadline.
    /// # Errors
    pub async fn await_response(
        &mut self,
        from_id: Option<u32>,
        timeout: Duration,
    ) -> CanFuzzResult<Option<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.transport.recv(remaining).await? {
                None => return Ok(None),
                Some(frame) => {
                    self.log.append(&frame)?;
                    if from_id.is_none_or(|id| frame.id() == id) {
                        return Ok(Some(frame));
                    }
                }
            }
        }
    }

    /// Discards stale frames that piled up in the receive queue, without
    /// logging them. Called before a request so the next response is really
    /// an answer to it.
    /// # Errors
    pub async fn drain(&mut self) -> CanFuzzResult<()> {
        while self.transport.recv(Duration::ZERO).await?.is_some() {}
        Ok(())
    }

    /// Access to the log writer, e.g. to report its path.
    pub fn log(&mut self) -> &mut SessionLog {
        &mut self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Direction;

    fn tmp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("busfuzz-test-{}-{name}", std::process::id()));
        path
    }

    #[test]
    fn append_then_load_round_trips() {
        let path = tmp_path("roundtrip.log");
        let _ = std::fs::remove_file(&path);

        {
            let mut log = SessionLog::open(&path, "vcan0").expect("open log");
            for (ts, id) in [(10.0, 0x100u32), (10.5, 0x200), (10.6, 0x300)] {
                let frame = Frame::with_timestamp(id, &[0xAB, 0xCD], ts, Direction::Sent)
                    .expect("valid frame");
                log.append(&frame).expect("append");
            }
        }

        let directives = SessionLog::load(&path).expect("load");
        assert_eq!(directives.len(), 3);
        assert_eq!(directives[0].frame.id(), 0x100);
        assert_eq!(directives[0].delay_since_previous, Duration::ZERO);
        assert!(
            (directives[1].delay_since_previous.as_secs_f64() - 0.5).abs() < 1e-3,
            "expected ~500ms, got {:?}",
            directives[1].delay_since_previous
        );
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn load_rejects_corrupt_lines() {
        let path = tmp_path("corrupt.log");
        std::fs::write(&path, "(1.0) vcan0 123#00\nthis is not a record\n").expect("write");
        let err = SessionLog::load(&path);
        assert!(matches!(err, Err(CanFuzzError::LogFormat { line: 2, .. })));
        std::fs::remove_file(&path).expect("cleanup");
    }

    #[test]
    fn out_of_order_timestamps_become_zero_delay() {
        let path = tmp_path("order.log");
        std::fs::write(&path, "(5.0) vcan0 123#00\n(4.0) vcan0 124#00\n").expect("write");
        let directives = SessionLog::load(&path).expect("load");
        assert_eq!(directives[1].delay_since_previous, Duration::ZERO);
        std::fs::remove_file(&path).expect("cleanup");
    }
}
