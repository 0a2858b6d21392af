//! The trace recorder state machine.
//!
//! The recorder watches every interpreted step and moves between four
//! modes:
//!
//! - **Profiling**: count loop-header executions; past the threshold,
//!   start recording a trace at that header.
//! - **Recording**: append every step to the trace buffer until the trace
//!   closes back to its header (commit + compile), the buffer fills, or
//!   the back-edge throttle trips (abort).
//! - **ExtensionBegin**: armed by a compiled trace's side exit; on the
//!   next step, either give up (blacklisted landing pc) or start an
//!   extension recording.
//! - **Extension**: like Recording, but the trace closes against the
//!   existing tree's root and is grafted onto the side-exit leaf, after
//!   which the whole tree is recompiled.
//!
//! Aborts are local recoveries: the recorder drops back to Profiling and
//! execution continues interpretively, costing only a missed compile.

use tracing::{debug, trace};

use super::config::{TraceConfig, TraceStats, TRACE_BUF_SIZE};
use super::tree::{NodeId, TraceTree, TraceTreeStore};

/// One recorded step.
#[derive(Debug, Clone, Copy, Default)]
struct TraceEntry {
    opcode: u8,
    pc: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Profiling,
    Recording,
    ExtensionBegin,
    Extension,
}

/// Watches interpreted execution and decides what to trace and when to
/// compile. Returns the header pc of a tree that wants (re)compilation
/// from the `record*` entry points; the machine owns the actual compile
/// and dispatch patch.
pub struct TraceRecorder {
    mode: Mode,
    buf: Box<[TraceEntry; TRACE_BUF_SIZE]>,
    len: usize,
    backedge_count: usize,
    /// Header pc of the tree being extended.
    ext_root: usize,
    /// The leaf whose untraced branch the side exit took.
    ext_leaf: NodeId,
    ext_leaf_depth: usize,
    /// First pc observed after the side exit; the blacklist key.
    ext_entry_pc: usize,
    config: TraceConfig,
    stats: TraceStats,
}

impl TraceRecorder {
    pub fn new(config: TraceConfig) -> TraceRecorder {
        TraceRecorder {
            mode: Mode::Profiling,
            buf: Box::new([TraceEntry::default(); TRACE_BUF_SIZE]),
            len: 0,
            backedge_count: 0,
            ext_root: 0,
            ext_leaf: NodeId::from_index(0),
            ext_leaf_depth: 0,
            ext_entry_pc: 0,
            config,
            stats: TraceStats::default(),
        }
    }

    /// Statistics accumulated so far.
    pub fn stats(&self) -> &TraceStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut TraceStats {
        &mut self.stats
    }

    /// Step notification from the branch handlers (`[` and `]`). Only
    /// this entry point drives hotness counting in Profiling mode.
    pub fn record(
        &mut self,
        pc: usize,
        opcode: u8,
        next_pc: usize,
        store: &mut TraceTreeStore,
    ) -> Option<usize> {
        match self.mode {
            Mode::Profiling => {
                self.profile(pc, opcode, store);
                None
            }
            Mode::Recording => self.recording_step(pc, opcode, next_pc, true, store),
            Mode::ExtensionBegin => self.extension_begin(pc, opcode, next_pc, true, store),
            Mode::Extension => self.extension_step(pc, opcode, next_pc, true, store),
        }
    }

    /// Step notification from the six simple-op handlers. Invisible to
    /// Profiling; identical to `record` in every other mode.
    pub fn record_simple(
        &mut self,
        pc: usize,
        opcode: u8,
        next_pc: usize,
        store: &mut TraceTreeStore,
    ) -> Option<usize> {
        match self.mode {
            Mode::Profiling => None,
            Mode::Recording => self.recording_step(pc, opcode, next_pc, false, store),
            Mode::ExtensionBegin => self.extension_begin(pc, opcode, next_pc, false, store),
            Mode::Extension => self.extension_step(pc, opcode, next_pc, false, store),
        }
    }

    /// Arm extension recording. Called (through the runtime hook) by a
    /// compiled trace's side exit, naming the tree and the leaf whose
    /// untraced branch was taken. Overwrites whatever the recorder was
    /// doing: a recording that silently crossed native code is torn and
    /// must not commit.
    pub fn arm_extension(&mut self, root_pc: usize, leaf: NodeId) {
        trace!(
            target: "tapetron::jit::recorder",
            root_pc,
            leaf = leaf.index(),
            "side exit armed extension"
        );
        self.mode = Mode::ExtensionBegin;
        self.ext_root = root_pc;
        self.ext_leaf = leaf;
        self.len = 0;
    }

    // =========================================================================
    // Profiling
    // =========================================================================

    fn profile(&mut self, pc: usize, opcode: u8, store: &mut TraceTreeStore) {
        let count = store.bump_count(pc);
        if count > self.config.trace_threshold {
            debug!(
                target: "tapetron::jit::recorder",
                pc,
                count,
                "hot header, recording trace"
            );
            self.buf[0] = TraceEntry { opcode, pc };
            self.len = 1;
            self.backedge_count = 0;
            self.mode = Mode::Recording;
        }
    }

    // =========================================================================
    // Recording
    // =========================================================================

    fn recording_step(
        &mut self,
        pc: usize,
        opcode: u8,
        next_pc: usize,
        is_branch: bool,
        store: &mut TraceTreeStore,
    ) -> Option<usize> {
        if self.len == TRACE_BUF_SIZE {
            // The pending step was never appended; it re-dispatches as a
            // Profiling step.
            self.stats.buffer_aborts += 1;
            trace!(target: "tapetron::jit::recorder", pc, "trace buffer full, aborting");
            self.mode = Mode::Profiling;
            self.len = 0;
            if is_branch {
                self.profile(pc, opcode, store);
            }
            return None;
        }

        self.buf[self.len] = TraceEntry { opcode, pc };
        self.len += 1;

        if next_pc == self.buf[0].pc {
            let root = self.commit(store);
            self.stats.traces_committed += 1;
            self.mode = Mode::Profiling;
            self.len = 0;
            return Some(root);
        }

        if opcode == b']' {
            // Closed an inner loop that is not our header.
            self.backedge_count += 1;
            if self.backedge_count > self.config.backedge_threshold {
                self.stats.backedge_aborts += 1;
                trace!(
                    target: "tapetron::jit::recorder",
                    header = self.buf[0].pc,
                    "back-edge throttle, aborting"
                );
                self.mode = Mode::Profiling;
                self.len = 0;
            }
        }
        None
    }

    /// Fold the buffered trace into the tree rooted at the buffer head,
    /// creating nodes for branches never walked before, and mark the
    /// closing edge back-to-root. Returns the header pc.
    fn commit(&mut self, store: &mut TraceTreeStore) -> usize {
        let head = self.buf[0];
        let tree = store.tree_or_insert(head.pc, head.opcode);
        let mut parent = TraceTree::ROOT;
        for i in 1..self.len {
            let entry = self.buf[i];
            parent = tree.extend(parent, entry.opcode, entry.pc);
        }
        tree.close_to_root(parent);
        debug!(
            target: "tapetron::jit::recorder",
            header = head.pc,
            steps = self.len,
            nodes = tree.len(),
            "committed trace"
        );
        head.pc
    }

    // =========================================================================
    // Extension
    // =========================================================================

    fn extension_begin(
        &mut self,
        pc: usize,
        opcode: u8,
        next_pc: usize,
        is_branch: bool,
        store: &mut TraceTreeStore,
    ) -> Option<usize> {
        if store.is_blacklisted(pc) {
            self.stats.blacklist_hits += 1;
            self.mode = Mode::Profiling;
            if is_branch {
                self.profile(pc, opcode, store);
            }
            return None;
        }
        // The leaf depth bounds how much buffer an extension may use; the
        // grafted path must still fit a full trace.
        let Some(depth) = store
            .tree(self.ext_root)
            .map(|tree| tree.node(self.ext_leaf).depth)
        else {
            self.mode = Mode::Profiling;
            return None;
        };
        self.ext_leaf_depth = depth;
        self.ext_entry_pc = pc;
        self.len = 0;
        self.backedge_count = 0;
        self.mode = Mode::Extension;
        self.extension_step(pc, opcode, next_pc, is_branch, store)
    }

    fn extension_step(
        &mut self,
        pc: usize,
        opcode: u8,
        next_pc: usize,
        is_branch: bool,
        store: &mut TraceTreeStore,
    ) -> Option<usize> {
        if self.len + self.ext_leaf_depth >= TRACE_BUF_SIZE {
            self.stats.buffer_aborts += 1;
            self.abort_extension(store);
            if is_branch {
                self.profile(pc, opcode, store);
            }
            return None;
        }

        self.buf[self.len] = TraceEntry { opcode, pc };
        self.len += 1;

        if next_pc == self.ext_root {
            let root = self.commit_extension(store);
            if root.is_some() {
                self.stats.extensions_committed += 1;
            }
            self.mode = Mode::Profiling;
            self.len = 0;
            return root;
        }

        if opcode == b']' {
            self.backedge_count += 1;
            if self.backedge_count > self.config.backedge_threshold {
                self.stats.backedge_aborts += 1;
                self.abort_extension(store);
            }
        }
        None
    }

    /// A failed extension blacklists its landing pc so the interpreter
    /// stops re-recording an exit path that never reconverges.
    fn abort_extension(&mut self, store: &mut TraceTreeStore) {
        trace!(
            target: "tapetron::jit::recorder",
            landing_pc = self.ext_entry_pc,
            "extension aborted, blacklisting landing pc"
        );
        store.blacklist(self.ext_entry_pc);
        self.mode = Mode::Profiling;
        self.len = 0;
    }

    /// Graft the buffered extension onto the side-exit leaf and request a
    /// recompile of the whole tree.
    fn commit_extension(&mut self, store: &mut TraceTreeStore) -> Option<usize> {
        let Some(tree) = store.tree_mut(self.ext_root) else {
            return None;
        };
        let mut parent = self.ext_leaf;
        for i in 0..self.len {
            let entry = self.buf[i];
            parent = tree.extend(parent, entry.opcode, entry.pc);
        }
        tree.close_to_root(parent);
        debug!(
            target: "tapetron::jit::recorder",
            header = self.ext_root,
            steps = self.len,
            nodes = tree.len(),
            "committed extension, recompiling tree"
        );
        Some(self.ext_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::tree::{Edge, TraceTree};

    fn hot_recorder(threshold: u8) -> (TraceRecorder, TraceTreeStore) {
        let config = TraceConfig::default().with_threshold(threshold);
        (TraceRecorder::new(config), TraceTreeStore::new())
    }

    /// Finish one `[ - ]` iteration at header 1 (program `+[-]`) after
    /// the seeding `[` step, and return the compile request. The header
    /// itself is already in the buffer; only the body follows it.
    fn record_clear_loop(recorder: &mut TraceRecorder, store: &mut TraceTreeStore) -> Option<usize> {
        let request = recorder.record_simple(2, b'-', 3, store);
        request.or(recorder.record(3, b']', 1, store))
    }

    #[test]
    fn test_profiling_triggers_at_threshold() {
        let (mut recorder, mut store) = hot_recorder(2);
        assert!(recorder.record(1, b'[', 2, &mut store).is_none());
        assert!(recorder.record(1, b'[', 2, &mut store).is_none());
        assert_eq!(recorder.mode, Mode::Profiling);
        // Third visit crosses the threshold and seeds the buffer.
        assert!(recorder.record(1, b'[', 2, &mut store).is_none());
        assert_eq!(recorder.mode, Mode::Recording);
        assert_eq!(recorder.len, 1);
    }

    #[test]
    fn test_simple_steps_invisible_to_profiling() {
        let (mut recorder, mut store) = hot_recorder(1);
        for _ in 0..100 {
            recorder.record_simple(0, b'+', 1, &mut store);
        }
        assert_eq!(recorder.mode, Mode::Profiling);
    }

    #[test]
    fn test_commit_builds_expected_tree() {
        let (mut recorder, mut store) = hot_recorder(0);
        recorder.record(1, b'[', 2, &mut store);
        assert_eq!(recorder.mode, Mode::Recording);
        let request = record_clear_loop(&mut recorder, &mut store);
        assert_eq!(request, Some(1));
        assert_eq!(recorder.mode, Mode::Profiling);
        assert_eq!(recorder.stats().traces_committed, 1);

        let tree = store.tree(1).unwrap();
        assert_eq!(tree.root().opcode, b'[');
        let Edge::Node(minus) = tree.root().left else {
            panic!("expected fallthrough child");
        };
        assert_eq!(tree.node(minus).opcode, b'-');
        let Edge::Node(close) = tree.node(minus).left else {
            panic!("expected close child");
        };
        assert_eq!(tree.node(close).opcode, b']');
        assert_eq!(tree.node(close).right, Edge::BackToRoot);
        assert_eq!(tree.root().right, Edge::Unset);
    }

    #[test]
    fn test_commit_twice_is_structurally_identical() {
        let (mut recorder, mut store) = hot_recorder(0);
        recorder.record(1, b'[', 2, &mut store);
        record_clear_loop(&mut recorder, &mut store);
        let first = store.tree(1).unwrap().clone();

        // Counter is still past the threshold, so recording restarts.
        recorder.record(1, b'[', 2, &mut store);
        assert_eq!(recorder.mode, Mode::Recording);
        record_clear_loop(&mut recorder, &mut store);
        assert_eq!(store.tree(1).unwrap(), &first);
    }

    #[test]
    fn test_buffer_full_aborts_and_redispatches() {
        let (mut recorder, mut store) = hot_recorder(0);
        recorder.record(1, b'[', 2, &mut store);
        // Fill the remaining buffer with non-closing simple steps.
        for _ in 1..TRACE_BUF_SIZE {
            assert!(recorder.record_simple(2, b'>', 3, &mut store).is_none());
        }
        assert_eq!(recorder.mode, Mode::Recording);
        // Next branch step finds the buffer full; the abort re-dispatches
        // it as a Profiling step, which (still past threshold) reseeds.
        recorder.record(5, b'[', 6, &mut store);
        assert_eq!(recorder.stats().buffer_aborts, 1);
        assert_eq!(recorder.mode, Mode::Recording);
        assert_eq!(recorder.buf[0].pc, 5);
    }

    #[test]
    fn test_backedge_throttle_aborts() {
        let (mut recorder, mut store) = hot_recorder(0);
        recorder.record(10, b'[', 11, &mut store);
        // Six inner-loop closures that never return to header 10.
        for i in 0..6 {
            let pc = 20 + i * 2;
            recorder.record(pc, b']', pc - 1, &mut store);
        }
        assert_eq!(recorder.mode, Mode::Profiling);
        assert_eq!(recorder.stats().backedge_aborts, 1);
        assert_eq!(recorder.stats().traces_committed, 0);
    }

    #[test]
    fn test_extension_grafts_onto_leaf() {
        let (mut recorder, mut store) = hot_recorder(0);
        // Committed tree for `[ - ]` at header 1.
        recorder.record(1, b'[', 2, &mut store);
        record_clear_loop(&mut recorder, &mut store);

        // Side exit through the root's zero branch, landing at pc 4.
        recorder.arm_extension(1, TraceTree::ROOT);
        assert_eq!(recorder.mode, Mode::ExtensionBegin);
        let mut request = None;
        request = request.or(recorder.record_simple(4, b'>', 5, &mut store));
        request = request.or(recorder.record_simple(5, b'<', 1, &mut store));
        assert_eq!(request, Some(1));
        assert_eq!(recorder.stats().extensions_committed, 1);

        let tree = store.tree(1).unwrap();
        let Edge::Node(right) = tree.root().right else {
            panic!("zero branch should be grafted");
        };
        assert_eq!(tree.node(right).opcode, b'>');
        assert_eq!(tree.node(right).depth, 1);
        let Edge::Node(left_shift) = tree.node(right).left else {
            panic!("expected '<' child");
        };
        // '<' at pc 5 closes to the root at pc 1 via its jump edge.
        assert_eq!(tree.node(left_shift).right, Edge::BackToRoot);
    }

    #[test]
    fn test_blacklisted_landing_pc_gives_up() {
        let (mut recorder, mut store) = hot_recorder(0);
        recorder.record(1, b'[', 2, &mut store);
        record_clear_loop(&mut recorder, &mut store);
        store.blacklist(4);

        recorder.arm_extension(1, TraceTree::ROOT);
        assert!(recorder.record_simple(4, b'>', 5, &mut store).is_none());
        assert_eq!(recorder.mode, Mode::Profiling);
        assert_eq!(recorder.stats().blacklist_hits, 1);
    }

    #[test]
    fn test_failed_extension_blacklists_landing_pc() {
        let (mut recorder, mut store) = hot_recorder(0);
        recorder.record(1, b'[', 2, &mut store);
        record_clear_loop(&mut recorder, &mut store);

        recorder.arm_extension(1, TraceTree::ROOT);
        // Wander through six foreign loop closures: throttle trips.
        recorder.record_simple(4, b'>', 5, &mut store);
        for i in 0..6 {
            let pc = 30 + i * 2;
            recorder.record(pc, b']', pc - 1, &mut store);
        }
        assert_eq!(recorder.mode, Mode::Profiling);
        assert!(store.is_blacklisted(4));
        assert_eq!(recorder.stats().backedge_aborts, 1);
    }

    #[test]
    fn test_arming_cancels_recording_in_progress() {
        let (mut recorder, mut store) = hot_recorder(0);
        recorder.record(1, b'[', 2, &mut store);
        recorder.record_simple(2, b'-', 3, &mut store);
        assert_eq!(recorder.mode, Mode::Recording);
        // Execution entered native code mid-recording; its side exit arms
        // the recorder and the torn buffer must not survive.
        recorder.arm_extension(9, TraceTree::ROOT);
        assert_eq!(recorder.mode, Mode::ExtensionBegin);
        assert_eq!(recorder.len, 0);
    }
}
