use crate::error::CanFuzzError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest arbitration ID an extended (29 bit) CAN frame can carry.
pub const ARB_ID_MAX: u32 = 0x1FFF_FFFF;

/// Largest arbitration ID of a standard (11 bit) CAN frame.
pub const ARB_ID_MAX_STANDARD: u32 = 0x7FF;

/// Classic CAN payload limit in bytes.
pub const MAX_DATA_LEN: usize = 8;

/// Whether a frame was transmitted by us or picked up from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The frame was transmitted by this process.
    Sent,
    /// The frame was received from the bus.
    Received,
}

/// A single classic CAN frame. Validated at construction and immutable
/// afterwards: the arbitration ID fits 29 bits and the payload holds at most
/// 8 bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    id: u32,
    data: Vec<u8>,
    timestamp: f64,
    direction: Direction,
}

impl Frame {
    /// Creates a frame stamped with the current wall clock time.
    /// # Errors
    pub fn new(id: u32, data: &[u8], direction: Direction) -> Result<Self, CanFuzzError> {
        Self::with_timestamp(id, data, now_epoch(), direction)
    }

    /// Creates a frame with an explicit timestamp, used when parsing log
    /// records that carry their own capture time.
    /// # Errors
    pub fn with_timestamp(
        id: u32,
        data: &[u8],
        timestamp: f64,
        direction: Direction,
    ) -> Result<Self, CanFuzzError> {
        if id > ARB_ID_MAX {
            return Err(CanFuzzError::MalformedFrame {
                input: format!("{id:#x}"),
                reason: "arbitration ID exceeds 29 bits".to_owned(),
            });
        }
        if data.len() > MAX_DATA_LEN {
            return Err(CanFuzzError::MalformedFrame {
                input: hex::encode(data),
                reason: format!("payload of {} bytes exceeds 8", data.len()),
            });
        }
        Ok(Self {
            id,
            data: data.to_vec(),
            timestamp,
            direction,
        })
    }

    /// The arbitration ID.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The payload bytes (0 to 8).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Capture or creation time in seconds since the epoch.
    #[must_use]
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Whether the frame was sent by us or received from the bus.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// True if the ID does not fit into a standard 11 bit identifier.
    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.id > ARB_ID_MAX_STANDARD
    }

    /// Returns the frame zero-padded to the full 8 payload bytes. Padding
    /// never truncates, a full frame is returned unchanged.
    #[must_use]
    pub fn padded(mut self) -> Self {
        self.data.resize(MAX_DATA_LEN, 0x00);
        self
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_extended() {
            write!(f, "{:08X}#{}", self.id, hex::encode_upper(&self.data))
        } else {
            write!(f, "{:03X}#{}", self.id, hex::encode_upper(&self.data))
        }
    }
}

pub(crate) fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_payload() {
        let err = Frame::new(0x123, &[0u8; 9], Direction::Sent);
        assert!(matches!(err, Err(CanFuzzError::MalformedFrame { .. })));
    }

    #[test]
    fn rejects_id_above_29_bits() {
        let err = Frame::new(ARB_ID_MAX + 1, &[], Direction::Sent);
        assert!(matches!(err, Err(CanFuzzError::MalformedFrame { .. })));
    }

    #[test]
    fn padding_extends_to_eight_bytes() {
        let frame = Frame::new(0x7E0, &[0xC0, 0xFF, 0xEE], Direction::Sent)
            .expect("valid frame")
            .padded();
        assert_eq!(frame.data(), &[0xC0, 0xFF, 0xEE, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn padding_leaves_full_frames_alone() {
        let data = [1, 2, 3, 4, 5, 6, 7, 8];
        let frame = Frame::new(0x1, &data, Direction::Sent)
            .expect("valid frame")
            .padded();
        assert_eq!(frame.data(), &data);
    }

    #[test]
    fn display_distinguishes_standard_and_extended() {
        let std = Frame::new(0x7E0, &[0xAA], Direction::Sent).expect("valid frame");
        let ext = Frame::new(0x18DB_33F1, &[0xAA], Direction::Sent).expect("valid frame");
        assert_eq!(std.to_string(), "7E0#AA");
        assert_eq!(ext.to_string(), "18DB33F1#AA");
    }
}
