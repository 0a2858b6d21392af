//! The adaptive execution tier: trace recording and native compilation.
//!
//! The interpreter reports every step here. Hot loop headers get their
//! execution recorded into per-header trace trees, trees get compiled to
//! native functions patched into the dispatch table, and side exits from
//! native code grow the trees through previously-untraced branches.
//!
//! # Modules
//!
//! - [`config`]: thresholds, buffer sizes, the master switch, run stats
//! - [`tree`]: trace trees, the extension blacklist, iteration counters
//! - [`recorder`]: the Profiling / Recording / Extension state machine
//! - [`compiler`]: Cranelift lowering of trace trees (feature `jit`)
//! - [`runtime`]: support functions callable from generated code

pub mod config;
pub mod recorder;
pub mod tree;

#[cfg(feature = "jit")]
pub mod compiler;
#[cfg(feature = "jit")]
pub mod runtime;

pub use config::{
    TraceConfig, TraceStats, BACKEDGE_THRESHOLD, ITERATION_BUF_SIZE, TRACE_BUF_SIZE,
    TRACE_THRESHOLD,
};
pub use recorder::TraceRecorder;
pub use tree::{Edge, NodeId, TraceNode, TraceTree, TraceTreeStore};

#[cfg(feature = "jit")]
pub use compiler::{JitError, JitResult, TraceCompiler};

/// Whether this build carries the native compilation tier. Without it the
/// recorder still profiles but committed traces are never compiled.
pub const JIT_AVAILABLE: bool = cfg!(feature = "jit");
