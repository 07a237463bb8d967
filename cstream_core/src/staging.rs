/// Fixed-capacity byte region owned by exclusively one adapter.
///
/// The region is split by a single cursor: `[0, used)` holds staged bytes and
/// `[used, capacity)` is free. `used + remaining == capacity` always holds.
/// Readers that consume staged bytes piecemeal keep their own consumed offset
/// and call [`StagingBuffer::discard_front`] to compact.
#[derive(Debug)]
pub struct StagingBuffer {
    data: Box<[u8]>,
    used: usize,
}

impl StagingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.used
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Staged bytes.
    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Free region, to be written and then [`commit`](Self::commit)ted.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.used..]
    }

    /// Mark `n` bytes of the free region as staged.
    ///
    /// Panics if `n` exceeds the free space; callers size their writes from
    /// [`spare_mut`](Self::spare_mut) so this is a logic error.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.remaining(), "commit past staging capacity");
        self.used += n;
    }

    /// Copy as much of `src` as fits; returns the number of bytes staged.
    pub fn push(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.used..self.used + n].copy_from_slice(&src[..n]);
        self.used += n;
        n
    }

    /// Drop the first `n` staged bytes and move the rest to the front.
    pub fn discard_front(&mut self, n: usize) {
        let n = n.min(self.used);
        if n == 0 {
            return;
        }
        self.data.copy_within(n..self.used, 0);
        self.used -= n;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_invariant() {
        let mut buf = StagingBuffer::with_capacity(16);
        assert_eq!(buf.used() + buf.remaining(), buf.capacity());

        buf.spare_mut()[..5].copy_from_slice(b"hello");
        buf.commit(5);
        assert_eq!(buf.filled(), b"hello");
        assert_eq!(buf.used() + buf.remaining(), 16);

        assert_eq!(buf.push(b"0123456789abcdef"), 11);
        assert_eq!(buf.remaining(), 0);
        assert_eq!(buf.used() + buf.remaining(), 16);
    }

    #[test]
    fn test_discard_front_keeps_tail() {
        let mut buf = StagingBuffer::with_capacity(32);
        buf.push(b"Hello, World!");
        buf.discard_front(7);
        assert_eq!(buf.filled(), b"World!");
        assert_eq!(buf.remaining(), 26);

        buf.discard_front(100);
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "commit past staging capacity")]
    fn test_commit_overrun_panics() {
        let mut buf = StagingBuffer::with_capacity(4);
        buf.commit(5);
    }
}
