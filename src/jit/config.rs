//! Configuration and statistics for trace recording and compilation.

/// Size of the iteration-count histogram. Loop headers hash into this
/// table by `pc % ITERATION_BUF_SIZE`; collisions merely blur hotness
/// detection and never affect correctness.
pub const ITERATION_BUF_SIZE: usize = 1024;

/// Capacity of the trace buffer in `(opcode, pc)` steps. A trace that does
/// not close back to its header within this many steps is abandoned.
pub const TRACE_BUF_SIZE: usize = 256;

/// Default execution count a loop header must reach before a trace is
/// recorded. Aggressive on purpose: one recorded iteration plus one
/// compile amortizes quickly on any loop hot enough to reach it.
pub const TRACE_THRESHOLD: u8 = 100;

/// Default number of non-header loop closures tolerated while recording.
/// A trace that keeps closing inner loops without returning to its own
/// header is wandering and gets cut off.
pub const BACKEDGE_THRESHOLD: usize = 5;

/// Tunables for the trace recorder. Fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy)]
pub struct TraceConfig {
    /// Master switch; off means pure interpretation.
    pub jit_enabled: bool,
    /// Hot-loop threshold (saturating byte counter, so at most 254).
    pub trace_threshold: u8,
    /// Back-edge throttle while recording.
    pub backedge_threshold: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            jit_enabled: true,
            trace_threshold: TRACE_THRESHOLD,
            backedge_threshold: BACKEDGE_THRESHOLD,
        }
    }
}

impl TraceConfig {
    /// Configuration with the recorder switched off entirely.
    pub fn interpreter_only() -> Self {
        TraceConfig {
            jit_enabled: false,
            ..Default::default()
        }
    }

    /// Override the hot-loop threshold, clamped to the counter's
    /// saturation point.
    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.trace_threshold = threshold.min(254);
        self
    }
}

/// Counters for what the recorder and compiler did during a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceStats {
    /// Traces committed into a tree (initial recordings).
    pub traces_committed: u64,
    /// Extension traces committed into an existing tree.
    pub extensions_committed: u64,
    /// Successful native compiles (including recompiles after extension).
    pub traces_compiled: u64,
    /// Compiles that failed; the dispatch slot was left interpretive.
    pub compile_failures: u64,
    /// Recordings abandoned because the trace buffer filled up.
    pub buffer_aborts: u64,
    /// Recordings abandoned by the back-edge throttle.
    pub backedge_aborts: u64,
    /// Extension attempts refused because the landing pc was blacklisted.
    pub blacklist_hits: u64,
}

impl TraceStats {
    /// Fraction of commit events that reached native code, as a
    /// percentage.
    pub fn compile_rate(&self) -> f64 {
        let commits = self.traces_committed + self.extensions_committed;
        if commits == 0 {
            0.0
        } else {
            (self.traces_compiled as f64 / commits as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TraceConfig::default();
        assert!(config.jit_enabled);
        assert_eq!(config.trace_threshold, TRACE_THRESHOLD);
        assert_eq!(config.backedge_threshold, BACKEDGE_THRESHOLD);
    }

    #[test]
    fn test_interpreter_only() {
        assert!(!TraceConfig::interpreter_only().jit_enabled);
    }

    #[test]
    fn test_threshold_clamped_to_saturation() {
        let config = TraceConfig::default().with_threshold(255);
        assert_eq!(config.trace_threshold, 254);
    }

    #[test]
    fn test_compile_rate() {
        let mut stats = TraceStats::default();
        assert_eq!(stats.compile_rate(), 0.0);
        stats.traces_committed = 4;
        stats.traces_compiled = 3;
        assert_eq!(stats.compile_rate(), 75.0);
    }
}
