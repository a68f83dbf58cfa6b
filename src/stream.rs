//! Record stream primitives.
//!
//! Every payload inside a container (catalog table, settings records,
//! drafts, blob records) is a flat stream of big-endian values:
//!
//! ```text
//! integers     big-endian, fixed width
//! byte array   u32 length (0xFFFFFFFF = null) + bytes
//! string       u32 byte length (0xFFFFFFFF = null) + UTF-16BE code units
//! date-time    i64 julian day + u32 msecs of day + u8 time spec
//! ```
//!
//! Readers never panic on truncated input; they return `StreamError`.

/// Length marker for a null byte array or string
pub const NULL_LENGTH: u32 = 0xFFFF_FFFF;

/// Julian day of 1970-01-01
const UNIX_EPOCH_JULIAN_DAY: i64 = 2_440_588;
const MSECS_PER_DAY: i64 = 86_400_000;
const TIME_SPEC_UTC: u8 = 1;

/// Error types for stream decoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("Unexpected end of stream: needed {needed} bytes, {remaining} left")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("Invalid UTF-16 string data")]
    InvalidString,
    #[error("Invalid date-time value")]
    InvalidDateTime,
}

/// Serialized size of a byte array
#[must_use]
pub fn bytes_size(len: usize) -> usize {
    4 + len
}

/// Serialized size of a string
#[must_use]
pub fn string_size(value: &str) -> usize {
    4 + value.encode_utf16().count() * 2
}

/// Append-only record stream writer
#[derive(Debug, Clone, Default)]
pub struct StreamWriter {
    buf: Vec<u8>,
}

impl StreamWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Booleans are stored as i32 0/1
    pub fn write_bool(&mut self, value: bool) {
        self.write_i32(i32::from(value));
    }

    /// Append bytes without a length prefix
    pub fn write_raw(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    pub fn write_null_bytes(&mut self) {
        self.write_u32(NULL_LENGTH);
    }

    pub fn write_string(&mut self, value: &str) {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.write_u32((units.len() * 2) as u32);
        for unit in units {
            self.write_u16(unit);
        }
    }

    /// Write a UTC timestamp given in milliseconds since the Unix epoch
    pub fn write_date_time(&mut self, unix_millis: i64) {
        let day = unix_millis.div_euclid(MSECS_PER_DAY);
        let msecs = unix_millis.rem_euclid(MSECS_PER_DAY);
        self.write_i64(UNIX_EPOCH_JULIAN_DAY + day);
        self.write_u32(msecs as u32);
        self.write_u8(TIME_SPEC_UTC);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a record stream
#[derive(Debug, Clone)]
pub struct StreamReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> StreamReader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], StreamError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(StreamError::UnexpectedEnd { needed, remaining });
        }
        let slice = &self.data[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], StreamError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Skip `len` raw bytes
    pub fn skip(&mut self, len: usize) -> Result<(), StreamError> {
        self.take(len).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, StreamError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, StreamError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, StreamError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, StreamError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, StreamError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, StreamError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    /// Any value other than 1 reads as false
    pub fn read_bool(&mut self) -> Result<bool, StreamError> {
        Ok(self.read_i32()? == 1)
    }

    /// Null arrays read as empty
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, StreamError> {
        let len = self.read_u32()?;
        if len == NULL_LENGTH {
            return Ok(Vec::new());
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    /// Null strings read as empty
    pub fn read_string(&mut self) -> Result<String, StreamError> {
        let len = self.read_u32()?;
        if len == NULL_LENGTH {
            return Ok(String::new());
        }
        if len % 2 != 0 {
            return Err(StreamError::InvalidString);
        }
        let raw = self.take(len as usize)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16(&units).map_err(|_| StreamError::InvalidString)
    }

    /// Read a timestamp as milliseconds since the Unix epoch
    pub fn read_date_time(&mut self) -> Result<i64, StreamError> {
        let julian_day = self.read_i64()?;
        let msecs = self.read_u32()?;
        let _spec = self.read_u8()?;
        if i64::from(msecs) >= MSECS_PER_DAY {
            return Err(StreamError::InvalidDateTime);
        }
        (julian_day - UNIX_EPOCH_JULIAN_DAY)
            .checked_mul(MSECS_PER_DAY)
            .and_then(|day_ms| day_ms.checked_add(i64::from(msecs)))
            .ok_or(StreamError::InvalidDateTime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_big_endian() {
        let mut w = StreamWriter::new();
        w.write_u32(0x0102_0304);
        w.write_i32(-2);
        w.write_u64(0x0A0B_0C0D_0E0F_1011);
        assert_eq!(
            hex::encode(w.as_bytes()),
            "01020304fffffffe0a0b0c0d0e0f1011"
        );

        let bytes = w.into_bytes();
        let mut r = StreamReader::new(&bytes);
        assert_eq!(r.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(r.read_i32().unwrap(), -2);
        assert_eq!(r.read_u64().unwrap(), 0x0A0B_0C0D_0E0F_1011);
        assert!(r.at_end());
    }

    #[test]
    fn test_string_is_utf16_with_byte_length() {
        let mut w = StreamWriter::new();
        w.write_string("hé");
        assert_eq!(hex::encode(w.as_bytes()), "00000004006800e9");
        assert_eq!(w.len(), string_size("hé"));

        let bytes = w.into_bytes();
        assert_eq!(StreamReader::new(&bytes).read_string().unwrap(), "hé");
    }

    #[test]
    fn test_string_outside_bmp() {
        let mut w = StreamWriter::new();
        w.write_string("🙂 ok");
        let bytes = w.into_bytes();
        assert_eq!(StreamReader::new(&bytes).read_string().unwrap(), "🙂 ok");
    }

    #[test]
    fn test_null_bytes_and_string_read_as_empty() {
        let mut w = StreamWriter::new();
        w.write_null_bytes();
        w.write_null_bytes();
        let bytes = w.into_bytes();

        let mut r = StreamReader::new(&bytes);
        assert!(r.read_bytes().unwrap().is_empty());
        assert!(r.read_string().unwrap().is_empty());
    }

    #[test]
    fn test_truncated_input_errors() {
        let mut w = StreamWriter::new();
        w.write_bytes(b"hello");
        let bytes = w.into_bytes();

        let mut r = StreamReader::new(&bytes[..6]);
        assert_eq!(
            r.read_bytes().unwrap_err(),
            StreamError::UnexpectedEnd { needed: 5, remaining: 2 }
        );

        let mut r = StreamReader::new(&[0, 1]);
        assert!(r.read_u32().is_err());
    }

    #[test]
    fn test_odd_string_length_rejected() {
        let mut r = StreamReader::new(&[0, 0, 0, 3, 0, 65, 0]);
        assert_eq!(r.read_string().unwrap_err(), StreamError::InvalidString);
    }

    #[test]
    fn test_date_time_round_trip() {
        for millis in [0i64, 1_704_067_200_123, -1] {
            let mut w = StreamWriter::new();
            w.write_date_time(millis);
            assert_eq!(w.len(), 13);
            let bytes = w.into_bytes();
            assert_eq!(StreamReader::new(&bytes).read_date_time().unwrap(), millis);
        }
    }

    #[test]
    fn test_bool_encoding() {
        let mut w = StreamWriter::new();
        w.write_bool(true);
        w.write_bool(false);
        w.write_i32(2);
        let bytes = w.into_bytes();

        let mut r = StreamReader::new(&bytes);
        assert!(r.read_bool().unwrap());
        assert!(!r.read_bool().unwrap());
        assert!(!r.read_bool().unwrap());
    }
}
