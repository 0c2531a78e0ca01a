//! Fixed-capacity ring buffer indexed by unbounded sequence numbers.

/// A ring of `N` slots addressed by a monotonically increasing sequence.
///
/// `N` must be a power of two; the slot for sequence `s` is `s & (N - 1)`,
/// so storing at sequence `s` overwrites whatever lived at `s - N`. Callers
/// that care whether an old entry survived must re-check its stored sequence
/// after lookup (see the snapshot ring's validity rule).
#[derive(Debug)]
pub struct Ring<T, const N: usize> {
    slots: Box<[T]>,
}

impl<T: Default, const N: usize> Ring<T, N> {
    const CAPACITY_IS_POWER_OF_TWO: () = assert!(N.is_power_of_two());

    /// Create a ring with every slot default-initialized.
    pub fn new() -> Self {
        let () = Self::CAPACITY_IS_POWER_OF_TWO;
        Self {
            slots: (0..N).map(|_| T::default()).collect(),
        }
    }

    /// Reset every slot to its default value.
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = T::default();
        }
    }
}

impl<T, const N: usize> Ring<T, N> {
    /// Number of slots.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Slot index for a sequence number.
    pub const fn slot(seq: u64) -> usize {
        (seq as usize) & (N - 1)
    }

    /// Borrow the slot for `seq`.
    pub fn get(&self, seq: u64) -> &T {
        &self.slots[Self::slot(seq)]
    }

    /// Mutably borrow the slot for `seq`.
    pub fn get_mut(&mut self, seq: u64) -> &mut T {
        &mut self.slots[Self::slot(seq)]
    }
}

impl<T: Default, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
