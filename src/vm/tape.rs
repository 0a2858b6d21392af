//! The data tape.
//!
//! A fixed 32,768-byte zero-initialized buffer. The head is not stored
//! here: it travels through dispatch as a raw pointer, and `<`/`>` move it
//! with unchecked pointer arithmetic. Running the head off either end of
//! the buffer is undefined behavior by design; the language's semantics
//! leave it to the program to stay in bounds.

/// Tape length in cells.
pub const TAPE_LEN: usize = 32_768;

/// Zero-initialized cell storage for one run.
pub struct Tape {
    cells: Vec<u8>,
}

impl Tape {
    /// Allocate a zeroed tape.
    pub fn new() -> Tape {
        Tape {
            cells: vec![0u8; TAPE_LEN],
        }
    }

    /// Raw pointer to the initial head position, the middle of the tape,
    /// so programs can move in either direction.
    pub fn head_ptr(&mut self) -> *mut u8 {
        // Safety: TAPE_LEN / 2 is in bounds of the allocation.
        unsafe { self.cells.as_mut_ptr().add(TAPE_LEN / 2) }
    }

    /// Cell contents, for inspection after a run.
    pub fn cells(&self) -> &[u8] {
        &self.cells
    }
}

impl Default for Tape {
    fn default() -> Self {
        Tape::new()
    }
}
