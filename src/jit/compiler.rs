//! Trace-tree to native code compilation.
//!
//! A committed trace tree is lowered to one Cranelift function with the
//! opcode-handler signature and installed into the dispatch table at the
//! tree's header pc. The function's shape:
//!
//! - an entry block receiving `(pc, head, machine)`,
//! - a header block whose single block parameter is the tape head — the
//!   join point every loop-closing edge jumps back to,
//! - straight-line code per recorded node, branching at `[` nodes,
//! - side-exit blocks for untraced branches, which arm the recorder for
//!   extension and return `(target_pc, head)` to the dispatch loop.
//!
//! Head movement (`<`/`>`) rebinds an SSA value for the sub-trace only,
//! so sibling branches see the unshifted head. Cranelift's `speed`
//! pipeline does the loop optimization on the result.

use std::fmt;
use std::mem;

use cranelift::codegen;
use cranelift::codegen::ir::{BlockArg, FuncRef};
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use tracing::debug;

use super::runtime;
use super::tree::{Edge, NodeId, TraceTree};
use crate::vm::{OpHandler, Program};

/// Errors from native compilation. Never fatal: a failed compile leaves
/// the dispatch slot interpretive.
#[derive(Debug, Clone)]
pub enum JitError {
    /// Cranelift setup or codegen error.
    Compilation(String),
}

impl fmt::Display for JitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitError::Compilation(msg) => write!(f, "compilation error: {}", msg),
        }
    }
}

impl std::error::Error for JitError {}

/// Result type for JIT operations.
pub type JitResult<T> = Result<T, JitError>;

/// Compiles trace trees into the dispatch table's native tier.
///
/// Owns the Cranelift JIT module; generated functions live as long as the
/// module, which lives as long as the machine.
pub struct TraceCompiler {
    module: JITModule,
    putchar_id: FuncId,
    getchar_id: FuncId,
    arm_id: FuncId,
    /// Per-compile suffix so recompiles after extension get fresh names.
    func_counter: u64,
}

impl TraceCompiler {
    /// Build the JIT module with aggressive optimization and the runtime
    /// support symbols registered.
    pub fn new() -> JitResult<TraceCompiler> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| JitError::Compilation(format!("failed to set opt_level: {}", e)))?;

        let isa_builder = cranelift_native::builder()
            .map_err(|msg| JitError::Compilation(format!("host ISA unavailable: {}", msg)))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Compilation(format!("failed to create ISA: {}", e)))?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        builder.symbol(
            "jit_runtime_putchar",
            runtime::jit_runtime_putchar as *const u8,
        );
        builder.symbol(
            "jit_runtime_getchar",
            runtime::jit_runtime_getchar as *const u8,
        );
        builder.symbol(
            "jit_runtime_arm_extension",
            runtime::jit_runtime_arm_extension as *const u8,
        );

        let mut module = JITModule::new(builder);

        // jit_runtime_putchar: fn(machine, byte) -> byte
        let mut putchar_sig = module.make_signature();
        putchar_sig.params.push(AbiParam::new(types::I64));
        putchar_sig.params.push(AbiParam::new(types::I64));
        putchar_sig.returns.push(AbiParam::new(types::I64));
        let putchar_id = module
            .declare_function("jit_runtime_putchar", Linkage::Import, &putchar_sig)
            .map_err(|e| JitError::Compilation(format!("failed to declare putchar: {}", e)))?;

        // jit_runtime_getchar: fn(machine) -> byte or -1
        let mut getchar_sig = module.make_signature();
        getchar_sig.params.push(AbiParam::new(types::I64));
        getchar_sig.returns.push(AbiParam::new(types::I64));
        let getchar_id = module
            .declare_function("jit_runtime_getchar", Linkage::Import, &getchar_sig)
            .map_err(|e| JitError::Compilation(format!("failed to declare getchar: {}", e)))?;

        // jit_runtime_arm_extension: fn(machine, root_pc, leaf)
        let mut arm_sig = module.make_signature();
        arm_sig.params.push(AbiParam::new(types::I64));
        arm_sig.params.push(AbiParam::new(types::I64));
        arm_sig.params.push(AbiParam::new(types::I64));
        let arm_id = module
            .declare_function("jit_runtime_arm_extension", Linkage::Import, &arm_sig)
            .map_err(|e| JitError::Compilation(format!("failed to declare arm hook: {}", e)))?;

        Ok(TraceCompiler {
            module,
            putchar_id,
            getchar_id,
            arm_id,
            func_counter: 0,
        })
    }

    /// Lower `tree` to native code and return a function pointer with the
    /// opcode-handler signature, ready to install at the tree's header.
    pub fn compile(&mut self, tree: &TraceTree, program: &Program) -> JitResult<OpHandler> {
        let root_pc = tree.root().pc;
        let name = format!("trace_{}_{}", root_pc, self.func_counter);
        self.func_counter += 1;

        let mut sig = self.module.make_signature();
        sig.params.push(AbiParam::new(types::I64)); // pc
        sig.params.push(AbiParam::new(types::I64)); // tape head
        sig.params.push(AbiParam::new(types::I64)); // machine pointer
        sig.returns.push(AbiParam::new(types::I64)); // exit pc
        sig.returns.push(AbiParam::new(types::I64)); // tape head at exit

        let func_id = self
            .module
            .declare_function(&name, Linkage::Local, &sig)
            .map_err(|e| JitError::Compilation(format!("failed to declare function: {}", e)))?;

        let mut ctx = self.module.make_context();
        ctx.func.signature = sig;

        self.build_trace(&mut ctx, tree, program);

        self.module
            .define_function(func_id, &mut ctx)
            .map_err(|e| JitError::Compilation(format!("failed to define function: {}", e)))?;
        self.module
            .finalize_definitions()
            .map_err(|e| JitError::Compilation(format!("failed to finalize: {}", e)))?;

        let code = self.module.get_finalized_function(func_id);
        debug!(
            target: "tapetron::jit::compiler",
            root_pc,
            nodes = tree.len(),
            func = %name,
            "compiled trace tree"
        );
        // Safety: the function was generated with exactly the handler
        // signature on the host's C calling convention.
        Ok(unsafe { mem::transmute::<*const u8, OpHandler>(code) })
    }

    fn build_trace(&mut self, ctx: &mut codegen::Context, tree: &TraceTree, program: &Program) {
        let mut func_ctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut func_ctx);

        let putchar = self.module.declare_func_in_func(self.putchar_id, builder.func);
        let getchar = self.module.declare_func_in_func(self.getchar_id, builder.func);
        let arm = self.module.declare_func_in_func(self.arm_id, builder.func);

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        let head_in = builder.block_params(entry)[1];
        let vm = builder.block_params(entry)[2];

        // Header: the join point. Its block parameter is the tape head;
        // every back-to-root edge jumps here with its own head value.
        let header = builder.create_block();
        builder.append_block_param(header, types::I64);
        builder.ins().jump(header, &[BlockArg::Value(head_in)]);

        builder.switch_to_block(header);
        let head = builder.block_params(header)[0];

        {
            let mut lowering = TraceLowering {
                builder: &mut builder,
                tree,
                program,
                header,
                vm,
                putchar,
                getchar,
                arm,
                root_pc: tree.root().pc,
            };
            lowering.node(TraceTree::ROOT, head);
        }

        // The header's predecessor set is only complete once every
        // back-to-root edge has been lowered.
        builder.seal_block(header);
        builder.finalize();
    }
}

/// A branch arm of a `[` node whose block still needs filling after the
/// conditional branch terminates the current block.
enum Arm {
    /// Recurse into a recorded child.
    Lower(NodeId),
    /// Untraced branch: side-exit to this pc.
    Exit(usize),
}

struct TraceLowering<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    tree: &'a TraceTree,
    program: &'a Program,
    header: Block,
    vm: Value,
    putchar: FuncRef,
    getchar: FuncRef,
    arm: FuncRef,
    root_pc: usize,
}

impl TraceLowering<'_, '_> {
    fn node(&mut self, id: NodeId, head: Value) {
        let opcode = self.tree.node(id).opcode;
        match opcode {
            b'+' => self.cell_step(id, head, 1),
            b'-' => self.cell_step(id, head, -1),
            b'<' => self.shift(id, head, -1),
            b'>' => self.shift(id, head, 1),
            b'.' => self.put(id, head),
            b',' => self.get(id, head),
            b'[' => self.branch(id, head),
            b']' => self.close(id, head),
            _ => debug_assert!(false, "unrecordable opcode {:#x}", opcode),
        }
    }

    /// `+` / `-`: wrapping byte update in place.
    fn cell_step(&mut self, id: NodeId, head: Value, delta: i64) {
        let cell = self.load_cell(head);
        let updated = self.builder.ins().iadd_imm(cell, delta);
        self.builder
            .ins()
            .store(MemFlags::trusted(), updated, head, 0);
        self.fallthrough(id, head);
    }

    /// `<` / `>`: rebind the head for the sub-trace. The shift is local
    /// to this path; sibling branches keep their own SSA head value.
    fn shift(&mut self, id: NodeId, head: Value, delta: i64) {
        let shifted = self.builder.ins().iadd_imm(head, delta);
        self.fallthrough(id, shifted);
    }

    fn put(&mut self, id: NodeId, head: Value) {
        let cell = self.load_cell(head);
        let wide = self.builder.ins().sextend(types::I64, cell);
        self.builder.ins().call(self.putchar, &[self.vm, wide]);
        self.fallthrough(id, head);
    }

    fn get(&mut self, id: NodeId, head: Value) {
        let call = self.builder.ins().call(self.getchar, &[self.vm]);
        let got = self.builder.inst_results(call)[0];
        let narrow = self.builder.ins().ireduce(types::I8, got);
        self.builder
            .ins()
            .store(MemFlags::trusted(), narrow, head, 0);
        self.fallthrough(id, head);
    }

    /// Continue below a straight-line node along its fallthrough edge.
    fn fallthrough(&mut self, id: NodeId, head: Value) {
        let node = *self.tree.node(id);
        match node.left {
            Edge::Node(child) => self.node(child, head),
            Edge::BackToRoot => self.jump_header(head),
            Edge::Unset => self.side_exit(id, node.pc + 1, head),
        }
    }

    /// `[`: test the cell and split. `left` is the non-zero branch
    /// (fallthrough into the body), `right` the zero branch (over the
    /// loop). Untraced arms become side exits.
    fn branch(&mut self, id: NodeId, head: Value) {
        let node = *self.tree.node(id);

        if node.left == Edge::BackToRoot && node.right == Edge::BackToRoot {
            // Loop bottom: either way execution rejoins the header.
            self.jump_header(head);
            return;
        }

        if self.clear_loop(id, head) {
            return;
        }

        let zero_target = self.program.jump(node.pc) + 1;
        let mut pending: Vec<(Block, Arm)> = Vec::new();
        let (nonzero_block, nonzero_args) = self.arm_target(node.left, node.pc + 1, head, &mut pending);
        let (zero_block, zero_args) = self.arm_target(node.right, zero_target, head, &mut pending);

        let cell = self.load_cell(head);
        let is_zero = self.builder.ins().icmp_imm(IntCC::Equal, cell, 0);
        self.builder
            .ins()
            .brif(is_zero, zero_block, &zero_args, nonzero_block, &nonzero_args);

        for (block, arm) in pending {
            self.builder.switch_to_block(block);
            self.builder.seal_block(block);
            match arm {
                Arm::Lower(child) => self.node(child, head),
                Arm::Exit(target) => self.side_exit(id, target, head),
            }
        }
    }

    /// Resolve one `[` arm to a branch target, queueing any new block for
    /// filling once the conditional branch is emitted.
    fn arm_target(
        &mut self,
        edge: Edge,
        target_pc: usize,
        head: Value,
        pending: &mut Vec<(Block, Arm)>,
    ) -> (Block, Vec<BlockArg>) {
        match edge {
            Edge::BackToRoot => (self.header, vec![BlockArg::Value(head)]),
            Edge::Node(child) => {
                let block = self.builder.create_block();
                pending.push((block, Arm::Lower(child)));
                (block, vec![])
            }
            Edge::Unset => {
                let block = self.builder.create_block();
                pending.push((block, Arm::Exit(target_pc)));
                (block, vec![])
            }
        }
    }

    /// `]`: unconditional close; the continuation (out through the
    /// matching `[`) hangs off the jump edge.
    fn close(&mut self, id: NodeId, head: Value) {
        let node = *self.tree.node(id);
        match node.right {
            Edge::Node(child) => self.node(child, head),
            Edge::BackToRoot => self.jump_header(head),
            Edge::Unset => self.side_exit(id, self.program.jump(node.pc), head),
        }
    }

    /// The `[-]` (or `[+]`) clear-loop idiom. When the root loop's entire
    /// body is a single decrement or increment closing straight back, its
    /// only observable effect is zeroing the cell — wrapping arithmetic
    /// reaches zero from either direction. Store zero and continue along
    /// the zero branch without emitting the loop at all.
    fn clear_loop(&mut self, id: NodeId, head: Value) -> bool {
        if id != TraceTree::ROOT {
            return false;
        }
        let node = *self.tree.node(id);
        let Edge::Node(body) = node.left else {
            return false;
        };
        let body_node = *self.tree.node(body);
        if !matches!(body_node.opcode, b'-' | b'+') || body_node.right != Edge::Unset {
            return false;
        }
        let Edge::Node(close) = body_node.left else {
            return false;
        };
        let close_node = *self.tree.node(close);
        if close_node.opcode != b']'
            || close_node.right != Edge::BackToRoot
            || close_node.left != Edge::Unset
            || self.program.jump(close_node.pc) != node.pc
        {
            return false;
        }

        let zero = self.builder.ins().iconst(types::I8, 0);
        self.builder.ins().store(MemFlags::trusted(), zero, head, 0);
        match node.right {
            Edge::Node(child) => self.node(child, head),
            Edge::BackToRoot => self.jump_header(head),
            Edge::Unset => self.side_exit(id, self.program.jump(node.pc) + 1, head),
        }
        true
    }

    fn load_cell(&mut self, head: Value) -> Value {
        self.builder
            .ins()
            .load(types::I8, MemFlags::trusted(), head, 0)
    }

    fn jump_header(&mut self, head: Value) {
        self.builder
            .ins()
            .jump(self.header, &[BlockArg::Value(head)]);
    }

    /// Leave the trace: arm the recorder to grow the tree through this
    /// leaf on a later visit, then hand `(target_pc, head)` back to the
    /// dispatch loop.
    fn side_exit(&mut self, leaf: NodeId, target_pc: usize, head: Value) {
        let root = self.builder.ins().iconst(types::I64, self.root_pc as i64);
        let leaf_index = self
            .builder
            .ins()
            .iconst(types::I64, leaf.index() as i64);
        self.builder.ins().call(self.arm, &[self.vm, root, leaf_index]);
        let target = self.builder.ins().iconst(types::I64, target_pc as i64);
        self.builder.ins().return_(&[target, head]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::config::TraceConfig;
    use crate::vm::Machine;

    fn dummy_machine(source: &[u8]) -> Machine {
        Machine::with_io(
            source,
            TraceConfig::interpreter_only(),
            Box::new(std::io::empty()),
            Box::new(std::io::sink()),
        )
        .unwrap()
    }

    fn clear_loop_tree() -> TraceTree {
        let mut tree = TraceTree::new(b'[', 1);
        let minus = tree.extend(TraceTree::ROOT, b'-', 2);
        let close = tree.extend(minus, b']', 3);
        tree.close_to_root(close);
        tree
    }

    #[test]
    fn test_compile_clear_loop_zeroes_cell() {
        let program = Program::load(b"+[-]").unwrap();
        let mut machine = dummy_machine(b"+[-]");
        let mut compiler = TraceCompiler::new().unwrap();
        let func = compiler.compile(&clear_loop_tree(), &program).unwrap();

        let mut cells = [5u8, 0, 0];
        let exit = unsafe { func(1, cells.as_mut_ptr(), &mut machine) };
        assert_eq!(cells[0], 0);
        // Zero branch of the root is untraced: exit past the ']'.
        assert_eq!(exit.pc, 4);
        assert_eq!(exit.head, cells.as_mut_ptr());
    }

    #[test]
    fn test_compile_increment_clear_loop_zeroes_cell() {
        // `[+]` clears by wrapping upward; same peephole as `[-]`.
        let program = Program::load(b"+[+]").unwrap();
        let mut machine = dummy_machine(b"+[+]");
        let mut compiler = TraceCompiler::new().unwrap();

        let mut tree = TraceTree::new(b'[', 1);
        let plus = tree.extend(TraceTree::ROOT, b'+', 2);
        let close = tree.extend(plus, b']', 3);
        tree.close_to_root(close);

        let func = compiler.compile(&tree, &program).unwrap();
        let mut cells = [7u8, 0, 0];
        let exit = unsafe { func(1, cells.as_mut_ptr(), &mut machine) };
        assert_eq!(cells[0], 0);
        assert_eq!(exit.pc, 4);
        assert_eq!(exit.head, cells.as_mut_ptr());
    }

    #[test]
    fn test_compile_move_loop() {
        // +[->+<] : drain cell 0 into cell 1.
        let source = b"+[->+<]";
        let program = Program::load(source).unwrap();
        let mut machine = dummy_machine(source);
        let mut compiler = TraceCompiler::new().unwrap();

        let mut tree = TraceTree::new(b'[', 1);
        let minus = tree.extend(TraceTree::ROOT, b'-', 2);
        let right = tree.extend(minus, b'>', 3);
        let plus = tree.extend(right, b'+', 4);
        let left = tree.extend(plus, b'<', 5);
        let close = tree.extend(left, b']', 6);
        tree.close_to_root(close);

        let func = compiler.compile(&tree, &program).unwrap();
        let mut cells = [3u8, 0];
        let exit = unsafe { func(1, cells.as_mut_ptr(), &mut machine) };
        assert_eq!(cells, [0, 3]);
        assert_eq!(exit.pc, 7);
        // The head is back where the loop started.
        assert_eq!(exit.head, cells.as_mut_ptr());
    }

    #[test]
    fn test_compile_countdown_print_loop() {
        // [-.] : decrement and print until the cell hits zero.
        use std::cell::RefCell;
        use std::io::Write;
        use std::rc::Rc;

        #[derive(Clone, Default)]
        struct SharedOutput(Rc<RefCell<Vec<u8>>>);
        impl Write for SharedOutput {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let source = b"+[-.]";
        let program = Program::load(source).unwrap();
        let output = SharedOutput::default();
        let mut machine = Machine::with_io(
            source,
            TraceConfig::interpreter_only(),
            Box::new(std::io::empty()),
            Box::new(output.clone()),
        )
        .unwrap();
        let mut compiler = TraceCompiler::new().unwrap();

        let mut tree = TraceTree::new(b'[', 1);
        let minus = tree.extend(TraceTree::ROOT, b'-', 2);
        let put = tree.extend(minus, b'.', 3);
        let close = tree.extend(put, b']', 4);
        tree.close_to_root(close);

        let func = compiler.compile(&tree, &program).unwrap();
        let mut cells = [5u8];
        let exit = unsafe { func(1, cells.as_mut_ptr(), &mut machine) };
        assert_eq!(cells[0], 0);
        assert_eq!(exit.pc, 5);
        assert_eq!(*output.0.borrow(), vec![4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_compile_read_loop() {
        // [>,] : read bytes until a zero arrives.
        let source = b"+[>,]";
        let program = Program::load(source).unwrap();
        let mut machine = Machine::with_io(
            source,
            TraceConfig::interpreter_only(),
            Box::new(&b"AB\x00"[..]),
            Box::new(std::io::sink()),
        )
        .unwrap();
        let mut compiler = TraceCompiler::new().unwrap();

        let mut tree = TraceTree::new(b'[', 1);
        let right = tree.extend(TraceTree::ROOT, b'>', 2);
        let get = tree.extend(right, b',', 3);
        let close = tree.extend(get, b']', 4);
        tree.close_to_root(close);

        let func = compiler.compile(&tree, &program).unwrap();
        let mut cells = [1u8, 0, 0, 0];
        let exit = unsafe { func(1, cells.as_mut_ptr(), &mut machine) };
        assert_eq!(cells, [1, b'A', b'B', 0]);
        assert_eq!(exit.pc, 5);
    }
}
