//! tapetron - a tracing JIT runtime for the Brainfuck tape machine.
//!
//! The eight operations (`>`, `<`, `+`, `-`, `.`, `,`, `[`, `]`) run on a
//! threaded-dispatch interpreter whose per-pc handler table is mutable at
//! runtime. An adaptive tier watches execution:
//!
//! 1. **Profiling** — loop headers are counted in a small saturating
//!    histogram; crossing the threshold starts a recording.
//! 2. **Recording** — one pass from the hot header back to itself is
//!    captured into a trace buffer and committed into that header's trace
//!    tree (a binary tree branching at `[`).
//! 3. **Compilation** — the tree is lowered to native code with Cranelift
//!    and patched into the dispatch table; subsequent arrivals at the
//!    header run native code.
//! 4. **Extension** — when native code exits through a branch the tree
//!    has never seen, it arms the recorder; the interpreter records from
//!    the exit onward, grafts the new path onto the tree, and the whole
//!    tree is recompiled.
//!
//! Recording anomalies (buffer overflow, wandering traces, blacklisted
//! exits) silently return the machine to profiling: the program always
//! runs correctly, adaptivity only decides how fast.
//!
//! # Example
//!
//! ```rust
//! use tapetron::{Machine, TraceConfig};
//!
//! let mut machine = Machine::with_io(
//!     b"++++++++[>++++++++<-]>+.",
//!     TraceConfig::default(),
//!     Box::new(std::io::empty()),
//!     Box::new(std::io::sink()),
//! )
//! .unwrap();
//! machine.run();
//! ```

pub mod jit;
pub mod vm;

pub use jit::{TraceConfig, TraceStats, JIT_AVAILABLE};
pub use vm::{Exit, Machine, OpHandler, Program, ProgramError, Tape, HALT};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_run_smoke() {
        let mut machine = Machine::with_io(
            b"+++.",
            TraceConfig::default(),
            Box::new(std::io::empty()),
            Box::new(std::io::sink()),
        )
        .unwrap();
        machine.run();
        assert_eq!(machine.tape().cells()[vm::TAPE_LEN / 2], 3);
    }

    #[test]
    fn test_unbalanced_program_is_rejected() {
        assert!(Machine::new(b"[[", TraceConfig::default()).is_err());
    }
}
