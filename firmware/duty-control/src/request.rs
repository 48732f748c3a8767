use crate::channel::DutyPercent;
use crate::error::WriteError;
use std::fmt;

/// Bytes taken from a single write. The last byte is reserved as the
/// terminator, so at most `INPUT_CAPACITY - 1` bytes are parsed.
pub const INPUT_CAPACITY: usize = 9;

/// One write's worth of input: the bounded copy and what it parsed to.
#[derive(Clone, Copy)]
pub struct DutyRequest {
    raw: [u8; INPUT_CAPACITY],
    len: usize,
    value: Option<i64>,
}

impl DutyRequest {
    /// Copy the prefix of `input` that fits and parse it.
    pub fn from_bytes(input: &[u8]) -> Self {
        let len = input.len().min(INPUT_CAPACITY);
        let mut raw = [0u8; INPUT_CAPACITY];
        raw[..len].copy_from_slice(&input[..len]);
        let value = parse_decimal(&raw[..len.min(INPUT_CAPACITY - 1)]);
        Self { raw, len, value }
    }

    /// Bytes accepted from the caller's buffer.
    pub fn consumed(&self) -> usize {
        self.len
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw[..self.len]
    }

    pub fn value(&self) -> Option<i64> {
        self.value
    }

    pub fn is_valid(&self) -> bool {
        self.duty().is_ok()
    }

    pub fn duty(&self) -> Result<DutyPercent, WriteError> {
        self.value
            .ok_or(WriteError::InvalidFormat)
            .and_then(DutyPercent::try_from)
    }
}

impl fmt::Debug for DutyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DutyRequest")
            .field("raw", &String::from_utf8_lossy(self.raw()))
            .field("value", &self.value)
            .finish()
    }
}

/// Base-10 signed integer, optional sign, at most one trailing newline.
/// A NUL byte ends the text early.
fn parse_decimal(bytes: &[u8]) -> Option<i64> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let text = &bytes[..end];
    let text = text.strip_suffix(b"\n").unwrap_or(text);
    std::str::from_utf8(text).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_values() {
        let req = DutyRequest::from_bytes(b"50");
        assert_eq!(req.value(), Some(50));
        assert_eq!(req.consumed(), 2);
        assert_eq!(req.duty().unwrap().get(), 50);

        assert_eq!(DutyRequest::from_bytes(b"0").duty().unwrap().get(), 0);
        assert_eq!(DutyRequest::from_bytes(b"100").duty().unwrap().get(), 100);
    }

    #[test]
    fn test_trailing_newline_and_sign() {
        let req = DutyRequest::from_bytes(b"75\n");
        assert_eq!(req.value(), Some(75));
        assert_eq!(req.consumed(), 3);

        assert_eq!(DutyRequest::from_bytes(b"+20").value(), Some(20));
        assert_eq!(DutyRequest::from_bytes(b"-0").value(), Some(0));
        assert_eq!(DutyRequest::from_bytes(b"007").value(), Some(7));
    }

    #[test]
    fn test_malformed_input() {
        for input in [
            &b""[..],
            b"abc",
            b"\n",
            b"+",
            b"-",
            b" 5",
            b"5 ",
            b"5\n\n",
            b"1e2",
            b"\xff\xfe",
        ] {
            let req = DutyRequest::from_bytes(input);
            assert_eq!(req.duty(), Err(WriteError::InvalidFormat), "{:?}", req);
            assert!(!req.is_valid());
        }
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(
            DutyRequest::from_bytes(b"101").duty(),
            Err(WriteError::OutOfRange(101))
        );
        assert_eq!(
            DutyRequest::from_bytes(b"-1").duty(),
            Err(WriteError::OutOfRange(-1))
        );
    }

    #[test]
    fn test_long_input_truncated() {
        let req = DutyRequest::from_bytes(b"12345678901234567890");
        assert_eq!(req.consumed(), INPUT_CAPACITY);
        assert_eq!(req.raw(), b"123456789");
        // Only the first eight bytes reach the parser.
        assert_eq!(req.value(), Some(12_345_678));
        assert_eq!(req.duty(), Err(WriteError::OutOfRange(12_345_678)));
    }

    #[test]
    fn test_ninth_byte_ignored() {
        // "00000050" plus one byte that falls on the terminator slot.
        let req = DutyRequest::from_bytes(b"00000050x");
        assert_eq!(req.consumed(), 9);
        assert_eq!(req.value(), Some(50));
    }

    #[test]
    fn test_nul_terminates() {
        let req = DutyRequest::from_bytes(b"42\0junk");
        assert_eq!(req.value(), Some(42));
        assert_eq!(req.consumed(), 7);
    }
}
