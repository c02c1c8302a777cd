/// Implements the `Transport` trait for SocketCAN interfaces
pub mod socketcan;
