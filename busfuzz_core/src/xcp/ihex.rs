//! Minimal Intel-hex writer for `xcp dump` output: data records of up to 16
//! bytes, type-04 extended linear address records whenever the upper 16
//! address bits change, and the closing EOF record.

use std::io::{self, Write};

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;
const RECORD_EXT_LINEAR_ADDRESS: u8 = 0x04;
const BYTES_PER_RECORD: usize = 16;

/// Writes `data` as Intel-hex starting at absolute address `start`.
/// # Errors
pub fn write_hex(out: &mut impl Write, start: u32, data: &[u8]) -> io::Result<()> {
    let mut upper: Option<u16> = None;
    let mut offset = 0usize;

    while offset < data.len() {
        let address = start.wrapping_add(offset as u32);
        let address_upper = (address >> 16) as u16;
        if upper != Some(address_upper) {
            record(out, 0x0000, RECORD_EXT_LINEAR_ADDRESS, &address_upper.to_be_bytes())?;
            upper = Some(address_upper);
        }

        // records never cross a 64k boundary
        let lower = (address & 0xFFFF) as usize;
        let take = BYTES_PER_RECORD
            .min(data.len() - offset)
            .min(0x1_0000 - lower);
        record(out, lower as u16, RECORD_DATA, &data[offset..offset + take])?;
        offset += take;
    }

    record(out, 0x0000, RECORD_EOF, &[])
}

fn record(out: &mut impl Write, address: u16, record_type: u8, payload: &[u8]) -> io::Result<()> {
    let mut sum = payload.len() as u8;
    sum = sum
        .wrapping_add((address >> 8) as u8)
        .wrapping_add(address as u8)
        .wrapping_add(record_type);
    for byte in payload {
        sum = sum.wrapping_add(*byte);
    }
    let checksum = sum.wrapping_neg();

    write!(
        out,
        ":{:02X}{address:04X}{record_type:02X}",
        payload.len()
    )?;
    for byte in payload {
        write!(out, "{byte:02X}")?;
    }
    writeln!(out, "{checksum:02X}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(start: u32, data: &[u8]) -> String {
        let mut out = Vec::new();
        write_hex(&mut out, start, data).expect("write");
        String::from_utf8(out).expect("ascii")
    }

    #[test]
    fn known_vector_with_extended_address() {
        let lines = render(0x1FFF_B000, &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(
            lines,
            ":020000041FFFDC\n:04B00000DEADBEEF14\n:00000001FF\n"
        );
    }

    #[test]
    fn checksums_balance_to_zero() {
        let lines = render(0x8000, &(0..64u8).collect::<Vec<_>>());
        for line in lines.lines() {
            let bytes = hex::decode(&line[1..]).expect("hex record");
            let sum: u8 = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            assert_eq!(sum, 0, "record {line} does not balance");
        }
    }

    #[test]
    fn records_split_at_64k_boundaries() {
        let lines = render(0xFFF8, &[0xAA; 16]);
        let lines: Vec<&str> = lines.lines().collect();
        // 8 bytes below the boundary, a new extended address record, 8 above
        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with(":020000040000"));
        assert!(lines[1].starts_with(":08FFF800"));
        assert!(lines[2].starts_with(":020000040001"));
        assert!(lines[3].starts_with(":08000000AA"));
        assert_eq!(lines[4], ":00000001FF");
    }

    #[test]
    fn empty_dump_is_just_eof() {
        assert_eq!(render(0x0, &[]), ":00000001FF\n");
    }
}
