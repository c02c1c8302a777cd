use crate::error::CanFuzzError;
use crate::frame::Frame;
use std::time::Duration;

/// Transport layer to connect to a CAN channel.
///
/// Implementations are free to run a background receive listener feeding an
/// internal queue, as the SocketCAN transport in `busfuzz_common` does; the
/// engine only ever has one request outstanding, so `recv` is always called
/// from a single logical worker.
pub trait Transport {
    /// A short description of the channel, shown in log output.
    fn title(&self) -> String;

    /// Opens the channel. Called once before any traffic.
    /// # Errors
    fn open(&mut self) -> impl std::future::Future<Output = Result<(), CanFuzzError>>;

    /// Closes the channel.
    /// # Errors
    fn close(&mut self) -> impl std::future::Future<Output = Result<(), CanFuzzError>>;

    /// Transmits a single frame.
    /// # Errors
    fn send(&mut self, frame: &Frame) -> impl std::future::Future<Output = Result<(), CanFuzzError>>;

    /// Waits up to `timeout` for the next incoming frame and returns
    /// `Ok(None)` when nothing arrived in time. A zero timeout must not
    /// block: it returns only frames that are already queued.
    /// # Errors
    fn recv(
        &mut self,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<Option<Frame>, CanFuzzError>>;
}
