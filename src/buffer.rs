//! Fixed-capacity element buffer.

use std::mem;

use crate::error::{Result, SortError};

/// In-memory staging area for a batch of records.
///
/// Both stream implementations buffer records here between the caller and the
/// backing storage. The buffer tracks a count of valid records and a read
/// cursor; `0 <= cursor <= valid <= capacity` holds at all times.
///
/// Buffers are move-only and scoped to a single stream.
pub struct ElementBuffer<T> {
    storage: Vec<T>,
    capacity: usize,
    valid: usize,
    cursor: usize,
}

impl<T: Default> ElementBuffer<T> {
    /// Creates a buffer with the given capacity in records (minimum 1).
    pub fn new(capacity: u64) -> Self {
        let capacity = (capacity.max(1)) as usize;
        let mut storage = Vec::new();
        storage.resize_with(capacity, T::default);

        return ElementBuffer {
            storage,
            capacity,
            valid: 0,
            cursor: 0,
        };
    }

    /// Appends a record.
    ///
    /// Returns `true` iff the buffer is at capacity after the call. Pushing
    /// into a full buffer stores nothing and returns `true`.
    pub fn push(&mut self, element: T) -> bool {
        if self.valid < self.capacity {
            self.storage[self.valid] = element;
            self.valid += 1;
            return self.valid == self.capacity;
        }
        return true;
    }

    /// Read-only view of the currently valid records.
    pub fn data(&self) -> &[T] {
        &self.storage[..self.valid]
    }

    /// Number of valid records.
    pub fn len(&self) -> usize {
        self.valid
    }

    /// Mutable view of the full backing storage, for bulk-fill paths that
    /// read records directly from the backing store.
    pub fn raw_mut_data(&mut self) -> &mut [T] {
        &mut self.storage
    }

    /// Declares `count` records valid after a bulk fill and resets the read
    /// cursor. Fails if `count` exceeds the capacity.
    pub fn set_valid_count(&mut self, count: u64) -> Result<()> {
        if count as usize > self.capacity {
            return Err(SortError::InvalidArgument(format!(
                "valid count {} exceeds buffer capacity {}",
                count, self.capacity
            )));
        }
        self.valid = count as usize;
        self.cursor = 0;
        return Ok(());
    }

    /// Moves the next record out and advances the cursor.
    ///
    /// Returns a default value once drained; callers are expected to consult
    /// [`ElementBuffer::has_more`] first.
    pub fn read_next(&mut self) -> T {
        if self.cursor < self.valid {
            let element = mem::take(&mut self.storage[self.cursor]);
            self.cursor += 1;
            return element;
        }
        return T::default();
    }

    /// Checks whether unread records remain.
    pub fn has_more(&self) -> bool {
        self.cursor < self.valid
    }

    /// Maximum capacity in records.
    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    /// Checks whether the buffer holds no valid records.
    pub fn is_empty(&self) -> bool {
        self.valid == 0
    }

    /// Checks whether the buffer is at capacity.
    pub fn is_full(&self) -> bool {
        self.valid == self.capacity
    }

    /// Resets both the valid count and the read cursor.
    pub fn clear(&mut self) {
        self.valid = 0;
        self.cursor = 0;
    }
}

#[cfg(test)]
mod test {
    use super::ElementBuffer;

    #[test]
    fn test_push_until_full() {
        let mut buffer = ElementBuffer::new(2);

        assert!(buffer.is_empty());
        assert_eq!(buffer.push(10), false);
        assert_eq!(buffer.push(20), true);
        assert!(buffer.is_full());
        assert_eq!(buffer.data(), &[10, 20]);

        // full buffer: nothing stored, still reported full
        assert_eq!(buffer.push(30), true);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_capacity_floor() {
        let buffer: ElementBuffer<u8> = ElementBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
    }

    #[test]
    fn test_read_cursor() {
        let mut buffer = ElementBuffer::new(3);
        buffer.push(1);
        buffer.push(2);

        assert!(buffer.has_more());
        assert_eq!(buffer.read_next(), 1);
        assert_eq!(buffer.read_next(), 2);
        assert!(!buffer.has_more());
        assert_eq!(buffer.read_next(), i32::default());
    }

    #[test]
    fn test_set_valid_count() {
        let mut buffer: ElementBuffer<u64> = ElementBuffer::new(4);
        buffer.raw_mut_data()[..2].copy_from_slice(&[7, 8]);

        buffer.set_valid_count(2).unwrap();
        assert_eq!(buffer.read_next(), 7);

        // cursor resets on the next bulk fill
        buffer.set_valid_count(1).unwrap();
        assert_eq!(buffer.read_next(), 7);

        assert!(buffer.set_valid_count(5).is_err());
    }

    #[test]
    fn test_clear() {
        let mut buffer = ElementBuffer::new(2);
        buffer.push("a".to_string());
        buffer.push("b".to_string());
        buffer.read_next();

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(!buffer.has_more());
    }
}
