use std::io::{Error, ErrorKind, Result};

/// Bounded FIFO of scheduler entries
///
/// A ring over a slot array allocated once: pushing never allocates, it fails
/// and hands the item back when the list is full.
pub struct ReadyList<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    len: usize,
}

impl<T: std::fmt::Debug> std::fmt::Debug for ReadyList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> ReadyList<T> {
    /// Returns a new empty list able to hold `capacity` items
    ///
    /// # Errors
    ///  * `ErrorKind::InvalidInput` when `capacity == 0`
    ///  * `ErrorKind::OutOfMemory` when the slots cannot be allocated
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "ready list capacity must be positive",
            ));
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| Error::from(ErrorKind::OutOfMemory))?;
        slots.resize_with(capacity, || None);
        Ok(Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            len: 0,
        })
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    #[inline(always)]
    fn slot(&self, index: usize) -> usize {
        (self.head + index) % self.slots.len()
    }

    /// Appends `item` at the back of the list
    ///
    /// # Returns
    ///  * `Ok(())` on success
    ///  * `Err(item)` when the list is full
    pub fn push_back(&mut self, item: T) -> std::result::Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let tail = self.slot(self.len);
        debug_assert!(self.slots[tail].is_none());
        self.slots[tail] = Some(item);
        self.len += 1;
        Ok(())
    }

    /// Removes the front of the list
    ///
    /// # Returns
    ///  * `Some(front)` when `!self.is_empty()`
    ///  * `None` when `self.is_empty()`
    pub fn pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let front = self.slots[self.head].take();
        debug_assert!(front.is_some());
        self.head = self.slot(1);
        self.len -= 1;
        front
    }

    /// Iterates from front to back
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.len).filter_map(move |index| self.slots[self.slot(index)].as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple() {
        let mut ready = ReadyList::with_capacity(3).unwrap();
        assert!(ready.pop_front().is_none());
        assert!(ready.is_empty());
        assert!(!ready.is_full());
        assert_eq!(ready.capacity(), 3);

        ready.push_back('a').unwrap();
        assert!(!ready.is_empty());
        assert_eq!(ready.pop_front(), Some('a'));
        assert!(ready.is_empty());

        ready.push_back('a').unwrap();
        ready.push_back('b').unwrap();
        ready.push_back('c').unwrap();
        assert!(ready.is_full());
        assert_eq!(ready.push_back('d'), Err('d'));
        assert_eq!(ready.len(), 3);

        assert_eq!(ready.pop_front(), Some('a'));
        assert_eq!(ready.pop_front(), Some('b'));
        assert_eq!(ready.pop_front(), Some('c'));
        assert!(ready.is_empty());
    }

    #[test]
    fn test_rotation_wraps_around() {
        let mut ready = ReadyList::with_capacity(4).unwrap();
        for i in 0..4 {
            ready.push_back(i).unwrap();
        }
        // Rotating the front to the back many times keeps the cyclic order
        for turn in 0..10 {
            let front = ready.pop_front().unwrap();
            assert_eq!(front, turn % 4);
            ready.push_back(front).unwrap();
        }
        assert_eq!(ready.iter().copied().collect::<Vec<_>>(), vec![2, 3, 0, 1]);
        assert_eq!(format!("{:?}", ready), "[2, 3, 0, 1]");
    }

    #[test]
    fn test_zero_capacity() {
        let err = ReadyList::<u8>::with_capacity(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
