//! Message body packing on top of the varint codec.

use crate::varint::{self, WireError};

/// How received strings are cleaned before use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sanitize {
    /// Keep the string as sent
    None,
    /// Replace control characters with spaces
    #[default]
    ControlChars,
    /// Replace control characters and drop leading whitespace
    ControlCharsSkipLeading,
}

/// Replaces every control character (below 0x20) with a space
pub fn sanitize_cc(input: &str) -> String {
    input
        .chars()
        .map(|c| if (c as u32) < 0x20 { ' ' } else { c })
        .collect()
}

pub fn sanitize(input: &str, mode: Sanitize) -> String {
    match mode {
        Sanitize::None => input.to_string(),
        Sanitize::ControlChars => sanitize_cc(input),
        Sanitize::ControlCharsSkipLeading => {
            sanitize_cc(input.trim_start_matches(|c: char| c.is_whitespace() || (c as u32) < 0x20))
        }
    }
}

/// Builds a message body one field at a time
#[derive(Debug, Default, Clone)]
pub struct Packer {
    buffer: Vec<u8>,
}

impl Packer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_int(&mut self, value: i32) -> &mut Self {
        varint::pack(&mut self.buffer, value);
        self
    }

    /// Appends a zero-terminated string, cut to at most `limit` bytes on a
    /// character boundary. A limit of zero means no limit.
    pub fn add_string(&mut self, value: &str, limit: usize) -> &mut Self {
        let mut end = value.len();
        if limit > 0 && end > limit {
            end = limit;
            while !value.is_char_boundary(end) {
                end -= 1;
            }
        }
        self.buffer
            .extend(value.as_bytes()[..end].iter().filter(|&&b| b != 0));
        self.buffer.push(0);
        self
    }

    pub fn add_raw(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Reads fields back out of a message body.
///
/// The first failed read poisons the unpacker; every later read fails too,
/// so a caller may unpack a whole message and check once at the end.
#[derive(Debug)]
pub struct Unpacker<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Unpacker<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            failed: false,
        }
    }

    fn fail(&mut self, error: WireError) -> WireError {
        self.failed = true;
        error
    }

    pub fn get_int(&mut self) -> Result<i32, WireError> {
        if self.failed {
            return Err(WireError::Poisoned);
        }
        match varint::unpack(&self.data[self.pos..]) {
            Ok((value, used)) => {
                self.pos += used;
                Ok(value)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    pub fn get_string(&mut self, mode: Sanitize) -> Result<String, WireError> {
        if self.failed {
            return Err(WireError::Poisoned);
        }
        let data = self.data;
        let rest = &data[self.pos..];
        let Some(len) = rest.iter().position(|&b| b == 0) else {
            return Err(self.fail(WireError::UnterminatedString));
        };
        let text = String::from_utf8_lossy(&rest[..len]).into_owned();
        self.pos += len + 1;
        Ok(sanitize(&text, mode))
    }

    pub fn get_raw(&mut self, size: i32) -> Result<&'a [u8], WireError> {
        if self.failed {
            return Err(WireError::Poisoned);
        }
        if size < 0 {
            return Err(self.fail(WireError::NegativeLength(size)));
        }
        let size = size as usize;
        if self.remaining() < size {
            return Err(self.fail(WireError::RawOutOfBounds(size)));
        }
        let data = self.data;
        let out = &data[self.pos..self.pos + size];
        self.pos += size;
        Ok(out)
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_read_fields() {
        let mut packer = Packer::new();
        packer
            .add_int(7)
            .add_string("nameless tee", 0)
            .add_int(-3)
            .add_raw(&[1, 2, 3]);
        let bytes = packer.finish();

        let mut unpacker = Unpacker::new(&bytes);
        assert_eq!(unpacker.get_int(), Ok(7));
        assert_eq!(
            unpacker.get_string(Sanitize::None).as_deref(),
            Ok("nameless tee")
        );
        assert_eq!(unpacker.get_int(), Ok(-3));
        assert_eq!(unpacker.get_raw(3), Ok(&[1u8, 2, 3][..]));
        assert_eq!(unpacker.remaining(), 0);
        assert!(!unpacker.has_failed());
    }

    #[test]
    fn test_string_limit_respects_char_boundary() {
        let mut packer = Packer::new();
        packer.add_string("aé", 2);
        assert_eq!(packer.finish(), vec![b'a', 0]);
    }

    #[test]
    fn test_sanitize_modes() {
        assert_eq!(sanitize_cc("a\tb\nc"), "a b c");
        assert_eq!(sanitize("  \u{1}x", Sanitize::ControlCharsSkipLeading), "x");
        assert_eq!(sanitize("\u{1}x", Sanitize::None), "\u{1}x");
    }

    #[test]
    fn test_failed_read_poisons_unpacker() {
        let bytes = [0x80];
        let mut unpacker = Unpacker::new(&bytes);
        assert_eq!(unpacker.get_int(), Err(WireError::Truncated));
        assert!(unpacker.has_failed());
        assert_eq!(unpacker.get_raw(0), Err(WireError::Poisoned));
    }

    #[test]
    fn test_raw_out_of_bounds() {
        let bytes = [1, 2];
        let mut unpacker = Unpacker::new(&bytes);
        assert_eq!(unpacker.get_raw(3), Err(WireError::RawOutOfBounds(3)));
        let mut unpacker = Unpacker::new(&bytes);
        assert_eq!(unpacker.get_raw(-1), Err(WireError::NegativeLength(-1)));
    }

    #[test]
    fn test_unterminated_string() {
        let bytes = *b"abc";
        let mut unpacker = Unpacker::new(&bytes);
        assert_eq!(
            unpacker.get_string(Sanitize::ControlChars),
            Err(WireError::UnterminatedString)
        );
    }
}
