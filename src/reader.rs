use crate::buffer::SharedBuffer;
use crate::error::Error;

/// Read-only cursor over a [`SharedBuffer`].
///
/// The cursor never mutates the buffer it scans. Matches are handed out as windows over the same
/// backing store, appended to a target buffer, so the bytes themselves stay where they are.
pub struct BufferReader<'a> {
    buffer: &'a SharedBuffer,
    offset: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a SharedBuffer) -> BufferReader<'a> {
        BufferReader { buffer, offset: 0 }
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    pub fn is_eof(&self) -> bool {
        self.offset >= self.buffer.len()
    }

    /// Scans for the first byte contained in `delimiters` and appends everything up to it, plus
    /// `extend` bytes (negative values leave bytes out), to `target`. The cursor moves past the
    /// appended span.
    ///
    /// Returns [`Error::NotFound`] when none of the delimiters is buffered yet.
    pub fn read_until(
        &mut self,
        target: &mut SharedBuffer,
        delimiters: &[u8],
        extend: isize,
    ) -> Result<(), Error> {
        let unread = &self.buffer.as_slice()[self.offset.min(self.buffer.len())..];

        let found = unread
            .iter()
            .position(|byte| delimiters.contains(byte))
            .ok_or(Error::NotFound)?;

        let span = found
            .checked_add_signed(extend)
            .filter(|span| *span <= unread.len())
            .ok_or(Error::OutOfBound)?;

        target.append(&self.tail(), span)?;
        self.offset += span;

        Ok(())
    }

    /// Appends exactly `length` bytes to `target`.
    pub fn read(&mut self, target: &mut SharedBuffer, length: usize) -> Result<(), Error> {
        if length > self.remaining() {
            return Err(Error::OutOfBound);
        }

        target.append(&self.tail(), length)?;
        self.offset += length;

        Ok(())
    }

    /// Skips `length` bytes.
    pub fn next(&mut self, length: usize) -> Result<(), Error> {
        if length > self.remaining() {
            return Err(Error::OutOfBound);
        }

        self.offset += length;
        Ok(())
    }

    /// The byte under the cursor, `0` at the end.
    pub fn current(&self) -> u8 {
        self.buffer.get(self.offset).unwrap_or(0)
    }

    /// The byte right before the cursor, `0` at the start.
    pub fn last(&self) -> u8 {
        match self.offset {
            0 => 0,
            offset => self.buffer.get(offset - 1).unwrap_or(0),
        }
    }

    fn tail(&self) -> SharedBuffer {
        let mut tail = self.buffer.clone();
        tail.narrow(self.offset, 0);
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_until_single_delimiter() {
        let buffer = SharedBuffer::from("$3\r\nfoo\r\n");
        let mut reader = BufferReader::new(&buffer);

        let mut line = SharedBuffer::new();
        reader.read_until(&mut line, b"\n", 1).unwrap();

        assert_eq!(line, "$3\r\n");
        assert_eq!(reader.offset(), 4);
        assert_eq!(reader.current(), b'f');
        assert_eq!(reader.last(), b'\n');
    }

    #[test]
    fn read_until_stops_at_first_of_any_delimiter() {
        let buffer = SharedBuffer::from("PING\r\nGET key\r\n");
        let mut reader = BufferReader::new(&buffer);

        let mut token = SharedBuffer::new();
        reader.read_until(&mut token, b" \n", 0).unwrap();

        assert_eq!(token, "PING\r");
        assert_eq!(reader.current(), b'\n');
    }

    #[test]
    fn read_until_with_negative_extend_leaves_bytes_unread() {
        let buffer = SharedBuffer::from("OK\r\n");
        let mut reader = BufferReader::new(&buffer);

        let mut line = SharedBuffer::new();
        reader.read_until(&mut line, b"\n", -1).unwrap();

        assert_eq!(line, "OK");
        assert_eq!(reader.offset(), 2);
        assert_eq!(reader.current(), b'\r');
    }

    #[test]
    fn read_until_without_delimiter_is_not_found() {
        let buffer = SharedBuffer::from("*12");
        let mut reader = BufferReader::new(&buffer);

        let mut line = SharedBuffer::new();

        assert_eq!(
            reader.read_until(&mut line, b"\n", 1),
            Err(Error::NotFound)
        );
        assert_eq!(reader.offset(), 0);
        assert!(line.is_empty());
    }

    #[test]
    fn read_until_at_eof_is_not_found() {
        let buffer = SharedBuffer::new();
        let mut reader = BufferReader::new(&buffer);

        let mut line = SharedBuffer::new();

        assert_eq!(
            reader.read_until(&mut line, b"\n", 1),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn read_exact_length() {
        let buffer = SharedBuffer::from("foo\r\nbar");
        let mut reader = BufferReader::new(&buffer);

        let mut body = SharedBuffer::new();
        reader.read(&mut body, 5).unwrap();

        assert_eq!(body, "foo\r\n");
        assert_eq!(reader.remaining(), 3);
        assert_eq!(reader.read(&mut body, 4), Err(Error::OutOfBound));
        assert_eq!(reader.remaining(), 3);
    }

    #[test]
    fn consecutive_reads_share_the_store() {
        let buffer = SharedBuffer::from("foobar");
        let mut reader = BufferReader::new(&buffer);

        let mut target = SharedBuffer::new();
        reader.read(&mut target, 3).unwrap();
        reader.read(&mut target, 3).unwrap();

        assert_eq!(target, "foobar");
        assert_eq!(target.capacity(), buffer.capacity());
    }

    #[test]
    fn reader_honors_buffer_window() {
        let mut buffer = SharedBuffer::from("xx+OK\r\n");
        buffer.narrow(2, 0);
        let mut reader = BufferReader::new(&buffer);

        assert_eq!(reader.current(), b'+');

        let mut line = SharedBuffer::new();
        reader.read_until(&mut line, b"\n", 1).unwrap();

        assert_eq!(line, "+OK\r\n");
        assert!(reader.is_eof());
    }

    #[test]
    fn next_and_sentinels() {
        let buffer = SharedBuffer::from("ab");
        let mut reader = BufferReader::new(&buffer);

        assert_eq!(reader.last(), 0);
        reader.next(2).unwrap();
        assert_eq!(reader.current(), 0);
        assert_eq!(reader.last(), b'b');
        assert!(reader.is_eof());
        assert_eq!(reader.next(1), Err(Error::OutOfBound));
    }
}
