//! Bounds-checked reader over the packed dictionary bytes.

/// A forward-only cursor that never reads past the end of its buffer.
///
/// Every read returns `None` once the buffer is exhausted instead of
/// panicking, so a truncated or hostile dictionary only shortens the scan.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at `pos`.
    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    /// Read a big-endian `u16`. Consumes nothing if fewer than two bytes remain.
    pub fn read_u16_be(&mut self) -> Option<u16> {
        let bytes = self.data.get(self.pos..self.pos.checked_add(2)?)?;
        self.pos += 2;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_stop_at_end_of_buffer() {
        let data = [0x01, 0x02, 0x03];
        let mut cursor = Cursor::at(&data, 0);
        assert_eq!(cursor.read_u16_be(), Some(0x0102));
        assert_eq!(cursor.remaining(), 1);
        assert_eq!(cursor.read_u16_be(), None);
        assert_eq!(cursor.position(), 2, "failed read must not advance");
        assert_eq!(cursor.read_u8(), Some(0x03));
        assert_eq!(cursor.read_u8(), None);
    }

    #[test]
    fn cursor_past_end_is_empty() {
        let data = [0xFF; 4];
        let mut cursor = Cursor::at(&data, 100);
        assert_eq!(cursor.remaining(), 0);
        assert_eq!(cursor.read_u8(), None);
        assert_eq!(cursor.read_u16_be(), None);
    }
}
