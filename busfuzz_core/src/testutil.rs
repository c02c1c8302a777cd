//! Scripted transport double shared by the driver and engine tests.

use crate::error::CanFuzzError;
use crate::frame::{Direction, Frame};
use crate::session::{BusConfig, Session, SessionLog};
use crate::traits::Transport;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

/// In-memory transport: records everything sent and serves queued or
/// scripted responses.
pub(crate) struct MockTransport {
    pub sent: Vec<Frame>,
    pub queue: VecDeque<Frame>,
    responder: Option<Responder>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent: Vec::new(),
            queue: VecDeque::new(),
            responder: None,
        }
    }

    /// Installs a callback that produces the frames "the bus" answers with
    /// whenever something is sent.
    pub fn with_responder(responder: impl FnMut(&Frame) -> Vec<Frame> + Send + 'static) -> Self {
        let mut transport = Self::new();
        transport.responder = Some(Box::new(responder));
        transport
    }

    pub fn push_rx(&mut self, frame: Frame) {
        self.queue.push_back(frame);
    }
}

impl Transport for MockTransport {
    fn title(&self) -> String {
        "mock".to_owned()
    }

    async fn open(&mut self) -> Result<(), CanFuzzError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CanFuzzError> {
        Ok(())
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), CanFuzzError> {
        self.sent.push(frame.clone());
        if let Some(responder) = &mut self.responder {
            self.queue.extend(responder(frame));
        }
        Ok(())
    }

    async fn recv(&mut self, _timeout: Duration) -> Result<Option<Frame>, CanFuzzError> {
        Ok(self.queue.pop_front())
    }
}

pub(crate) fn tx_frame(id: u32, data: &[u8]) -> Frame {
    Frame::new(id, data, Direction::Sent).expect("valid test frame")
}

pub(crate) fn rx_frame(id: u32, data: &[u8]) -> Frame {
    Frame::new(id, data, Direction::Received).expect("valid test frame")
}

/// A session over a mock transport, logging into a unique temp file.
pub(crate) fn mock_session(name: &str, transport: MockTransport) -> (Session<MockTransport>, PathBuf) {
    let mut path = std::env::temp_dir();
    path.push(format!("busfuzz-mock-{}-{name}.log", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let log = SessionLog::open(&path, "mock0").expect("open mock log");
    let config = BusConfig {
        response_timeout: Duration::from_millis(5),
        probe_timeout: Duration::from_millis(5),
        frame_delay: Duration::ZERO,
    };
    (Session::new(transport, log, config), path)
}
