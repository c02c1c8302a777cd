//! Textual CAN frame formats.
//!
//! Two encodings are handled here: the human command syntax `ARB_ID#DATA`
//! (hex ID with `0x` prefix or decimal, payload as dot separated hex byte
//! pairs, e.g. `0x7e0#c0.ff.ee`) and the candump style log line
//! `(timestamp) interface ID#DATA` that the session log reads and writes.

use crate::error::CanFuzzError;
use crate::frame::{Direction, Frame, MAX_DATA_LEN};

/// Parses a numeric argument, hex if prefixed with `0x`, decimal otherwise.
/// # Errors
pub fn parse_number(text: &str) -> Result<u32, CanFuzzError> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse::<u32>()
    };
    parsed.map_err(|_| CanFuzzError::MalformedFrame {
        input: text.to_owned(),
        reason: "not a decimal or 0x-prefixed hex number".to_owned(),
    })
}

/// Parses a message literal `ARB_ID#DATA` into a [`Frame`] stamped with the
/// current time. DATA must be 1 to 8 dot separated hex bytes.
/// # Errors
pub fn parse_message_literal(text: &str) -> Result<Frame, CanFuzzError> {
    let malformed = |reason: &str| CanFuzzError::MalformedFrame {
        input: text.to_owned(),
        reason: reason.to_owned(),
    };

    let (id_part, data_part) = text
        .split_once('#')
        .ok_or_else(|| malformed("expected ARB_ID#DATA"))?;
    let id = parse_number(id_part)?;

    if data_part.is_empty() {
        return Err(malformed("expected 1 to 8 data bytes"));
    }

    let mut data = Vec::new();
    for token in data_part.split('.') {
        if token.is_empty() || token.len() > 2 {
            return Err(malformed("data bytes must be 1 or 2 hex digits"));
        }
        let byte = u8::from_str_radix(token, 16)
            .map_err(|_| malformed("data bytes must be valid hex"))?;
        data.push(byte);
    }
    if data.len() > MAX_DATA_LEN {
        return Err(malformed("more than 8 data bytes"));
    }

    Frame::new(id, &data, Direction::Sent)
}

/// Formats a frame back into the canonical (lowercase) message literal.
#[must_use]
pub fn format_message_literal(frame: &Frame) -> String {
    let data = frame
        .data()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(".");
    format!("{:#x}#{}", frame.id(), data)
}

/// Formats a frame as a candump style log line.
#[must_use]
pub fn format_candump(frame: &Frame, interface: &str) -> String {
    format!("({:.6}) {interface} {frame}", frame.timestamp())
}

/// Parses a candump style log line `(timestamp) interface ID#DATA`. The
/// parentheses around the timestamp are optional and data bytes may be
/// separated by dots. Parsed frames are marked [`Direction::Sent`] since log
/// records exist to be replayed.
/// # Errors
pub fn parse_candump(line: &str) -> Result<Frame, CanFuzzError> {
    let malformed = |reason: &str| CanFuzzError::MalformedFrame {
        input: line.to_owned(),
        reason: reason.to_owned(),
    };

    let mut parts = line.split_whitespace();
    let ts_part = parts.next().ok_or_else(|| malformed("empty line"))?;
    let _interface = parts.next().ok_or_else(|| malformed("missing interface"))?;
    let frame_part = parts.next().ok_or_else(|| malformed("missing ID#DATA"))?;
    if parts.next().is_some() {
        return Err(malformed("trailing tokens"));
    }

    let ts_part = ts_part.trim_start_matches('(').trim_end_matches(')');
    let timestamp: f64 = ts_part
        .parse()
        .map_err(|_| malformed("timestamp is not a number"))?;

    let (id_part, data_part) = frame_part
        .split_once('#')
        .ok_or_else(|| malformed("expected ID#DATA"))?;
    let id = u32::from_str_radix(id_part, 16).map_err(|_| malformed("ID is not hex"))?;

    let digits: String = data_part.chars().filter(|c| *c != '.').collect();
    if digits.len() % 2 != 0 {
        return Err(malformed("odd number of data digits"));
    }
    let data = hex::decode(&digits).map_err(|_| malformed("data is not hex"))?;
    if data.len() > MAX_DATA_LEN {
        return Err(malformed("more than 8 data bytes"));
    }

    Frame::with_timestamp(id, &data, timestamp, Direction::Sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_round_trips_canonical_form() {
        for literal in ["0x7e0#c0.ff.ee", "0x123#00", "0x1fffb000#de.ad.be.ef.00.11.22.33"] {
            let frame = parse_message_literal(literal).expect("parses");
            assert_eq!(format_message_literal(&frame), literal);
        }
    }

    #[test]
    fn literal_accepts_decimal_ids() {
        let frame = parse_message_literal("291#01.02").expect("parses");
        assert_eq!(frame.id(), 291);
        assert_eq!(frame.data(), &[0x01, 0x02]);
    }

    #[test]
    fn literal_rejects_nine_bytes() {
        let err = parse_message_literal("0x1#00.11.22.33.44.55.66.77.88");
        assert!(matches!(err, Err(CanFuzzError::MalformedFrame { .. })));
    }

    #[test]
    fn literal_rejects_bad_hex_and_empty_data() {
        assert!(parse_message_literal("0x1#zz").is_err());
        assert!(parse_message_literal("0x1#").is_err());
        assert!(parse_message_literal("0x1").is_err());
    }

    #[test]
    fn padded_literal_matches_the_send_contract() {
        let frame = parse_message_literal("0x07e0#c0.ff.ee")
            .expect("parses")
            .padded();
        assert_eq!(frame.id(), 0x7E0);
        assert_eq!(frame.data(), &[0xC0, 0xFF, 0xEE, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn candump_round_trip() {
        let frame = Frame::with_timestamp(
            0x7E8,
            &[0x03, 0x41, 0x0D, 0x32],
            1625158000.123456,
            Direction::Sent,
        )
        .expect("valid frame");
        let line = format_candump(&frame, "vcan0");
        assert_eq!(line, "(1625158000.123456) vcan0 7E8#03410D32");

        let parsed = parse_candump(&line).expect("parses");
        assert_eq!(parsed.id(), frame.id());
        assert_eq!(parsed.data(), frame.data());
        assert!((parsed.timestamp() - frame.timestamp()).abs() < 1e-6);
    }

    #[test]
    fn candump_accepts_bare_timestamp_and_dots() {
        let parsed = parse_candump("1625158000.000001 can0 123#de.ad.be.ef").expect("parses");
        assert_eq!(parsed.id(), 0x123);
        assert_eq!(parsed.data(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn candump_accepts_empty_payload() {
        let parsed = parse_candump("(1.000000) can0 7DF#").expect("parses");
        assert!(parsed.data().is_empty());
    }

    #[test]
    fn candump_rejects_garbage() {
        assert!(parse_candump("not a log line").is_err());
        assert!(parse_candump("(1.0) can0 123#123").is_err());
        assert!(parse_candump("(abc) can0 123#00").is_err());
    }
}
