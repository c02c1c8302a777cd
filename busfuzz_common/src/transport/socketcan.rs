use busfuzz_core::error::CanFuzzError;
use busfuzz_core::frame::{ARB_ID_MAX_STANDARD, Direction, Frame};
use busfuzz_core::traits::Transport;
use socketcan::{
    CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame as RawFrame, Id, Socket, StandardId,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;

/// Incoming frames queue up here while the control loop is busy; CAN frames
/// are small and bursts on a busy bus are short.
const RECEIVE_QUEUE_DEPTH: usize = 1024;

/// Transport for SocketCAN interfaces (physical `can0` or virtual `vcan0`).
///
/// One socket serves both directions: a background thread reads incoming
/// frames into a bounded queue, `recv` takes them out with a timeout. Using
/// a single socket means frames we transmit are not echoed back to us, so
/// everything in the queue is genuine bus traffic.
pub struct SocketCanTransport {
    channel: String,
    socket: Option<Arc<CanSocket>>,
    receiver: Option<mpsc::Receiver<Frame>>,
    listener: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl SocketCanTransport {
    /// Create an instance of `SocketCanTransport` for the given channel.
    #[must_use]
    pub fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_owned(),
            socket: None,
            receiver: None,
            listener: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

fn listener_loop(socket: &CanSocket, queue: &mpsc::Sender<Frame>, shutdown: &AtomicBool) {
    let mut dropped: u64 = 0;
    while !shutdown.load(Ordering::Relaxed) {
        match socket.read_frame() {
            Ok(raw) => {
                let Ok(frame) = Frame::new(raw.raw_id(), raw.data(), Direction::Received) else {
                    continue;
                };
                if queue.try_send(frame).is_err() {
                    dropped += 1;
                    if dropped.is_power_of_two() {
                        tracing::warn!("receive queue full, {dropped} frames dropped so far");
                    }
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => {
                if !shutdown.load(Ordering::Relaxed) {
                    tracing::warn!("receive listener: {err}");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }
}

impl Transport for SocketCanTransport {
    fn title(&self) -> String {
        format!("socketcan ({})", self.channel)
    }

    async fn open(&mut self) -> Result<(), CanFuzzError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket =
            CanSocket::open(&self.channel).map_err(|err| CanFuzzError::TransportUnavailable {
                channel: self.channel.clone(),
                err_msg: err.to_string(),
            })?;
        socket
            .set_nonblocking(true)
            .map_err(|err| CanFuzzError::TransportUnavailable {
                channel: self.channel.clone(),
                err_msg: err.to_string(),
            })?;
        let socket = Arc::new(socket);

        let (sender, receiver) = mpsc::channel(RECEIVE_QUEUE_DEPTH);
        self.shutdown.store(false, Ordering::Relaxed);

        let reader = Arc::clone(&socket);
        let shutdown = Arc::clone(&self.shutdown);
        self.listener = Some(std::thread::spawn(move || {
            listener_loop(&reader, &sender, &shutdown);
        }));

        self.socket = Some(socket);
        self.receiver = Some(receiver);
        tracing::debug!("opened {}", self.title());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CanFuzzError> {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        self.receiver = None;
        self.socket = None;
        Ok(())
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), CanFuzzError> {
        let Some(socket) = &self.socket else {
            return Err(CanFuzzError::TransportWrite);
        };

        let id = if frame.id() > ARB_ID_MAX_STANDARD {
            ExtendedId::new(frame.id()).map(Id::Extended)
        } else {
            StandardId::new(frame.id() as u16).map(Id::Standard)
        };
        let raw = id
            .and_then(|id| CanFrame::new(id, frame.data()))
            .ok_or(CanFuzzError::TransportWrite)?;

        socket.write_frame(&raw).map_err(|err| {
            tracing::warn!("write on {} failed: {err}", self.channel);
            CanFuzzError::TransportWrite
        })
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, CanFuzzError> {
        let Some(receiver) = &mut self.receiver else {
            return Err(CanFuzzError::TransportRead);
        };
        if timeout.is_zero() {
            return Ok(receiver.try_recv().ok());
        }
        match tokio::time::timeout(timeout, receiver.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            // the listener thread is gone, the channel is unusable
            Ok(None) => Err(CanFuzzError::TransportRead),
            Err(_elapsed) => Ok(None),
        }
    }
}
