/// Capacity of every VM's private stack, in 32-bit words.
pub const MAX_STACK: usize = 1 << 16;

/// Fixed-capacity word stack shared by call frames and pushed values.
///
/// The stack does not track its own top; the stack pointer lives in `r3` so
/// programs can inspect and adjust it. Callers check the pointer before
/// indexing.
pub(super) struct Stack {
    slots: Box<[i32]>,
}

impl Stack {
    pub(super) fn new() -> Self {
        Self {
            slots: vec![0; MAX_STACK].into_boxed_slice(),
        }
    }

    /// Returns the index for `sp` when a push there keeps `sp + 1` in range.
    pub(super) fn push_slot(sp: i32) -> Option<usize> {
        let idx = usize::try_from(sp).ok()?;
        (idx + 1 < MAX_STACK).then_some(idx)
    }

    /// Returns the index a pop from `sp` reads, i.e. `sp - 1`.
    pub(super) fn pop_slot(sp: i32) -> Option<usize> {
        let idx = usize::try_from(sp).ok()?;
        idx.checked_sub(1).filter(|i| *i < MAX_STACK)
    }

    /// Returns true when `sp` satisfies `0 <= sp < MAX_STACK`.
    pub(super) fn in_range(sp: i32) -> bool {
        usize::try_from(sp).is_ok_and(|idx| idx < MAX_STACK)
    }

    pub(super) fn write(&mut self, idx: usize, value: i32) {
        self.slots[idx] = value;
    }

    pub(super) fn read(&self, idx: usize) -> i32 {
        self.slots[idx]
    }
}
