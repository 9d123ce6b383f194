use bytes::Buf;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;

/// A window over a reference-counted backing store.
///
/// Cloning a `SharedBuffer` is cheap: both values point at the same allocation and only the
/// visible window (`offset..size`) is per value. Slices handed from the parser to commands and
/// replies are clones of the input buffer narrowed down to the bytes they cover, so payload bytes
/// are not copied on their way through the proxy.
///
/// Writes are copy-on-write. Whenever the store has more than one referent, growing or appending
/// first moves the live window into a fresh private store, so other windows over the old store
/// never observe the mutation.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    // The store's length is its capacity; bytes past `size` are scratch space.
    store: Option<Arc<Vec<u8>>>,
    offset: usize,
    size: usize,
}

impl SharedBuffer {
    pub fn new() -> SharedBuffer {
        SharedBuffer::default()
    }

    /// Copies `data` into a new private store of exactly `data.len()` bytes.
    pub fn from_bytes(data: &[u8]) -> SharedBuffer {
        if data.is_empty() {
            return SharedBuffer::new();
        }

        SharedBuffer {
            store: Some(Arc::new(data.to_vec())),
            offset: 0,
            size: data.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.size - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start of the visible window relative to the backing store.
    pub fn window_start(&self) -> usize {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.store.as_ref().map_or(0, |store| store.len())
    }

    /// Unused bytes past the end of the visible window.
    pub fn free_size(&self) -> usize {
        self.capacity() - self.size
    }

    /// Whether this value is the only one referencing its backing store.
    pub fn is_exclusive(&self) -> bool {
        self.store
            .as_ref()
            .map_or(false, |store| Arc::strong_count(store) == 1)
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.store {
            Some(store) => &store[self.offset..self.size],
            None => &[],
        }
    }

    pub fn get(&self, index: usize) -> Result<u8, Error> {
        self.as_slice().get(index).copied().ok_or(Error::OutOfBound)
    }

    /// Narrows the visible window.
    ///
    /// The start moves forward by `start` bytes. A positive `length` caps the window at `length`
    /// bytes from the new start, a negative one trims `|length|` bytes off the current end and zero
    /// keeps the end. The window never widens.
    pub fn narrow(&mut self, start: usize, length: isize) {
        self.offset += start;

        let end = if length > 0 {
            self.offset + length.unsigned_abs()
        } else {
            self.size.saturating_sub(length.unsigned_abs())
        };

        if end < self.size {
            self.size = end;
        }
        if self.offset > self.size {
            self.offset = self.size;
        }
    }

    /// Makes sure at least `extra` unused bytes follow the visible window and that the store is
    /// private, compacting in place when the store is exclusive and the consumed prefix is large
    /// enough.
    pub fn append_capacity(&mut self, extra: usize) -> Result<(), Error> {
        if extra == 0 {
            return Ok(());
        }

        let (offset, size) = (self.offset, self.size);
        let live = size - offset;

        if let Some(store) = self.store.as_mut().and_then(Arc::get_mut) {
            if size + extra <= store.len() {
                return Ok(());
            }

            if live + extra <= store.len() {
                store.copy_within(offset..size, 0);
                self.offset = 0;
                self.size = live;
                return Ok(());
            }

            // A private store that keeps filling up doubles, so a long message is not copied once
            // per read.
            let doubled = store.len().saturating_mul(2);
            return self.reallocate((live + extra).max(doubled));
        }

        self.reallocate(live + extra)
    }

    /// Marks `n` bytes past the window as written. Used after reading from a socket straight into
    /// [`SharedBuffer::spare_capacity_mut`].
    pub fn commit(&mut self, n: usize) -> Result<(), Error> {
        if self.size + n > self.capacity() {
            return Err(Error::OutOfBound);
        }

        self.size += n;
        Ok(())
    }

    /// The writable tail of a private store holding at least `min` bytes.
    pub fn spare_capacity_mut(&mut self, min: usize) -> Result<&mut [u8], Error> {
        self.append_capacity(min.max(1))?;

        let size = self.size;
        let store = self.private_store()?;
        Ok(&mut store[size..])
    }

    pub fn append_slice(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }

        self.append_capacity(data.len())?;

        let size = self.size;
        let store = self.private_store()?;
        store[size..size + data.len()].copy_from_slice(data);
        self.size += data.len();

        Ok(())
    }

    /// Appends the first `len` visible bytes of `other`.
    ///
    /// Without a store of its own this buffer simply starts sharing `other`'s store. If `other`
    /// begins exactly where this window ends in the same store, the window is widened. Only
    /// otherwise are the bytes copied.
    pub fn append(&mut self, other: &SharedBuffer, len: usize) -> Result<(), Error> {
        if len > other.len() {
            return Err(Error::OutOfBound);
        }

        let Some(theirs) = &other.store else {
            return Ok(());
        };

        if self.store.is_none() {
            self.store = Some(Arc::clone(theirs));
            self.offset = other.offset;
            self.size = other.offset + len;
            return Ok(());
        }

        if self.continues_into(other) {
            self.size += len;
            return Ok(());
        }

        self.append_slice(&other.as_slice()[..len])
    }

    /// Empties the window. A shared store is released, an exclusive one is kept for reuse.
    pub fn clear(&mut self) {
        self.offset = 0;
        self.size = 0;

        if !self.is_exclusive() {
            self.store = None;
        }
    }

    fn continues_into(&self, other: &SharedBuffer) -> bool {
        match (&self.store, &other.store) {
            (Some(mine), Some(theirs)) => Arc::ptr_eq(mine, theirs) && self.size == other.offset,
            _ => false,
        }
    }

    fn private_store(&mut self) -> Result<&mut Vec<u8>, Error> {
        self.store
            .as_mut()
            .and_then(Arc::get_mut)
            .ok_or(Error::Exhausted)
    }

    fn reallocate(&mut self, capacity: usize) -> Result<(), Error> {
        let mut store = Vec::new();
        store
            .try_reserve_exact(capacity)
            .map_err(|_| Error::Exhausted)?;
        store.resize(capacity, 0);

        let live = self.len();
        store[..live].copy_from_slice(self.as_slice());

        self.store = Some(Arc::new(store));
        self.offset = 0;
        self.size = live;

        Ok(())
    }
}

// Writing a buffer to a socket consumes it from the front, which is what lets a partial write be
// resumed with the same value.
impl Buf for SharedBuffer {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        self.as_slice()
    }

    fn advance(&mut self, cnt: usize) {
        self.narrow(cnt, 0);
    }
}

impl AsRef<[u8]> for SharedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<&[u8]> for SharedBuffer {
    fn from(data: &[u8]) -> Self {
        SharedBuffer::from_bytes(data)
    }
}

impl From<&str> for SharedBuffer {
    fn from(data: &str) -> Self {
        SharedBuffer::from_bytes(data.as_bytes())
    }
}

impl From<Vec<u8>> for SharedBuffer {
    fn from(data: Vec<u8>) -> Self {
        if data.is_empty() {
            return SharedBuffer::new();
        }

        let size = data.len();
        SharedBuffer {
            store: Some(Arc::new(data)),
            offset: 0,
            size,
        }
    }
}

impl From<String> for SharedBuffer {
    fn from(data: String) -> Self {
        SharedBuffer::from(data.into_bytes())
    }
}

impl PartialEq for SharedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for SharedBuffer {}

impl PartialEq<[u8]> for SharedBuffer {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_slice() == other
    }
}

impl PartialEq<&str> for SharedBuffer {
    fn eq(&self, other: &&str) -> bool {
        self.as_slice() == other.as_bytes()
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_copies_into_private_store() {
        let buffer = SharedBuffer::from_bytes(b"hello");

        assert_eq!(buffer.as_slice(), b"hello");
        assert_eq!(buffer.capacity(), 5);
        assert!(buffer.is_exclusive());
    }

    #[test]
    fn from_empty_bytes_has_no_store() {
        let buffer = SharedBuffer::from_bytes(b"");

        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 0);
        assert!(!buffer.is_exclusive());
    }

    #[test]
    fn append_onto_empty_round_trips() {
        for n in [0usize, 1, 2, 17, 4096] {
            let data: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let source = SharedBuffer::from_bytes(&data);

            let mut buffer = SharedBuffer::new();
            buffer.append(&source, source.len()).unwrap();

            assert_eq!(buffer.as_slice(), &data[..]);
        }
    }

    #[test]
    fn append_onto_empty_shares_the_store() {
        let source = SharedBuffer::from("foobar");

        let mut buffer = SharedBuffer::new();
        buffer.append(&source, 3).unwrap();

        assert_eq!(buffer, "foo");
        assert!(!source.is_exclusive());
        assert!(!buffer.is_exclusive());
    }

    #[test]
    fn append_contiguous_window_widens_in_place() {
        let source = SharedBuffer::from("foobar");

        let mut head = source.clone();
        head.narrow(0, 3);
        let mut tail = source.clone();
        tail.narrow(3, 0);

        let mut buffer = SharedBuffer::new();
        buffer.append(&head, head.len()).unwrap();
        buffer.append(&tail, tail.len()).unwrap();

        assert_eq!(buffer, "foobar");
        assert_eq!(buffer.capacity(), source.capacity());
    }

    #[test]
    fn append_more_than_available_is_out_of_bound() {
        let source = SharedBuffer::from("abc");
        let mut buffer = SharedBuffer::new();

        assert_eq!(buffer.append(&source, 4), Err(Error::OutOfBound));
    }

    #[test]
    fn append_to_shared_copy_does_not_touch_original() {
        let original = SharedBuffer::from("hello");
        let mut copy = original.clone();

        copy.append_capacity(16).unwrap();
        copy.append_slice(b" world").unwrap();

        assert_eq!(original, "hello");
        assert_eq!(copy, "hello world");
        assert!(original.is_exclusive());
        assert!(copy.is_exclusive());
    }

    #[test]
    fn append_to_shared_window_with_free_space_still_copies() {
        let mut original = SharedBuffer::new();
        original.append_capacity(64).unwrap();
        original.append_slice(b"abc").unwrap();

        let mut view = original.clone();
        view.narrow(1, 1);

        original.append_slice(b"def").unwrap();

        assert_eq!(view, "b");
        assert_eq!(original, "abcdef");
        assert!(view.is_exclusive());
    }

    #[test]
    fn append_capacity_compacts_exclusive_store() {
        let mut buffer = SharedBuffer::new();
        buffer.append_capacity(8).unwrap();
        buffer.append_slice(b"abcdefgh").unwrap();
        buffer.narrow(6, 0);

        buffer.append_capacity(4).unwrap();

        assert_eq!(buffer.capacity(), 8);
        assert_eq!(buffer.window_start(), 0);
        assert_eq!(buffer, "gh");
        assert_eq!(buffer.free_size(), 6);
    }

    #[test]
    fn append_capacity_grows_when_compaction_is_not_enough() {
        let mut buffer = SharedBuffer::from("abcd");
        buffer.narrow(1, 0);

        buffer.append_capacity(10).unwrap();

        assert_eq!(buffer, "bcd");
        assert_eq!(buffer.capacity(), 13);
        assert_eq!(buffer.free_size(), 10);
    }

    #[test]
    fn exclusive_store_doubles_when_full() {
        let mut buffer = SharedBuffer::from("abcd");

        buffer.append_capacity(1).unwrap();

        assert_eq!(buffer, "abcd");
        assert_eq!(buffer.capacity(), 8);
    }

    #[test]
    fn shared_store_is_copied_at_exact_size() {
        let source = SharedBuffer::from("abcd");
        let mut buffer = source.clone();

        buffer.append_capacity(1).unwrap();

        assert_eq!(buffer.capacity(), 5);
        assert_eq!(source.capacity(), 4);
    }

    #[test]
    fn narrow_moves_start_and_caps_end() {
        let mut buffer = SharedBuffer::from("*3\r\nfoo\r\n");

        buffer.narrow(4, 3);
        assert_eq!(buffer, "foo");

        let mut buffer = SharedBuffer::from("foo\r\n");
        buffer.narrow(0, -2);
        assert_eq!(buffer, "foo");
    }

    #[test]
    fn narrow_never_widens() {
        let mut buffer = SharedBuffer::from("abcdef");
        buffer.narrow(1, 2);

        buffer.narrow(0, 10);

        assert_eq!(buffer, "bc");
    }

    #[test]
    fn narrow_clamps_start_to_end() {
        let mut buffer = SharedBuffer::from("abc");
        buffer.narrow(2, -3);

        assert!(buffer.is_empty());

        let mut buffer = SharedBuffer::from("abc");
        buffer.narrow(10, 0);

        assert!(buffer.is_empty());
    }

    #[test]
    fn clear_keeps_exclusive_store_for_reuse() {
        let mut buffer = SharedBuffer::from("abc");
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 3);
    }

    #[test]
    fn clear_releases_shared_store() {
        let original = SharedBuffer::from("abc");
        let mut copy = original.clone();

        copy.clear();

        assert_eq!(copy.capacity(), 0);
        assert!(original.is_exclusive());
    }

    #[test]
    fn indexed_access_is_bounded() {
        let mut buffer = SharedBuffer::from("abc");
        buffer.narrow(1, 0);

        assert_eq!(buffer.get(0), Ok(b'b'));
        assert_eq!(buffer.get(1), Ok(b'c'));
        assert_eq!(buffer.get(2), Err(Error::OutOfBound));
    }

    #[test]
    fn spare_capacity_and_commit() {
        let mut buffer = SharedBuffer::new();

        let spare = buffer.spare_capacity_mut(4).unwrap();
        assert_eq!(spare.len(), 4);
        spare[..2].copy_from_slice(b"ok");
        buffer.commit(2).unwrap();

        assert_eq!(buffer, "ok");
        assert_eq!(buffer.commit(3), Err(Error::OutOfBound));
    }

    #[test]
    fn spare_capacity_of_shared_store_is_private() {
        let mut buffer = SharedBuffer::new();
        buffer.append_capacity(16).unwrap();
        buffer.append_slice(b"abc").unwrap();
        let view = buffer.clone();

        let spare = buffer.spare_capacity_mut(1).unwrap();
        spare[0] = b'd';
        buffer.commit(1).unwrap();

        assert_eq!(view, "abc");
        assert_eq!(buffer, "abcd");
    }

    #[test]
    fn buf_advance_consumes_from_front() {
        let mut buffer = SharedBuffer::from("hello");

        assert_eq!(buffer.remaining(), 5);
        buffer.advance(2);

        assert_eq!(buffer.chunk(), b"llo");
    }
}
