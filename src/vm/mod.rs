//! The threaded-dispatch interpreter.
//!
//! Execution is driven by a per-pc table of opcode handlers. Rust gives no
//! tail-call guarantee, so dispatch is a return-address trampoline: every
//! handler returns `(next_pc, head)` and the driver loop re-dispatches.
//! The table is mutable at runtime — when the recorder commits a hot
//! trace, the compiled function (same signature) is patched into the
//! slot of the trace's header, and the loop starts calling native code at
//! that pc without noticing.
//!
//! Handlers report every step to the trace recorder before performing
//! their effect; `[` and `]` use the counting entry point, everything
//! else the simple one.

use std::io::{self, Read, Write};

use tracing::debug;
#[cfg(feature = "jit")]
use tracing::warn;

pub mod program;
pub mod tape;

pub use program::{Program, ProgramError};
pub use tape::{Tape, TAPE_LEN};

#[cfg(feature = "jit")]
use crate::jit::compiler::TraceCompiler;
use crate::jit::config::{TraceConfig, TraceStats};
use crate::jit::recorder::TraceRecorder;
use crate::jit::tree::TraceTreeStore;

/// Where a handler sends execution next: the pc to dispatch and the tape
/// head to carry there.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exit {
    pub pc: u64,
    pub head: *mut u8,
}

/// Sentinel pc returned by the terminator handler to stop the loop.
pub const HALT: u64 = u64::MAX;

/// The dispatch signature shared by interpretive handlers and compiled
/// traces. `vm` is the machine driving the run; compiled code forwards it
/// to the runtime support calls and never inspects it.
pub type OpHandler = unsafe extern "C" fn(pc: u64, head: *mut u8, vm: *mut Machine) -> Exit;

/// One run of one program: the program and its dispatch table, the tape,
/// and the adaptive-execution machinery watching the run.
pub struct Machine {
    program: Program,
    dispatch: Vec<OpHandler>,
    tape: Tape,
    recorder: TraceRecorder,
    store: TraceTreeStore,
    #[cfg(feature = "jit")]
    compiler: Option<TraceCompiler>,
    config: TraceConfig,
    input: Box<dyn Read>,
    output: Box<dyn Write>,
}

impl Machine {
    /// Machine wired to the process's standard streams.
    pub fn new(source: &[u8], config: TraceConfig) -> Result<Machine, ProgramError> {
        Machine::with_io(
            source,
            config,
            Box::new(io::stdin()),
            Box::new(io::stdout()),
        )
    }

    /// Machine with explicit host streams.
    pub fn with_io(
        source: &[u8],
        config: TraceConfig,
        input: Box<dyn Read>,
        output: Box<dyn Write>,
    ) -> Result<Machine, ProgramError> {
        let program = Program::load(source)?;

        let mut dispatch: Vec<OpHandler> = Vec::with_capacity(program.len() + 1);
        for pc in 0..program.len() {
            dispatch.push(handler_for(program.op(pc)));
        }
        // Trailing terminator: running off the end stops the loop.
        dispatch.push(op_halt);

        #[cfg(feature = "jit")]
        let compiler = if config.jit_enabled {
            match TraceCompiler::new() {
                Ok(compiler) => Some(compiler),
                Err(e) => {
                    warn!(
                        target: "tapetron::vm",
                        error = %e,
                        "JIT backend unavailable, running interpretively"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Machine {
            program,
            dispatch,
            tape: Tape::new(),
            recorder: TraceRecorder::new(config),
            store: TraceTreeStore::new(),
            #[cfg(feature = "jit")]
            compiler,
            config,
            input,
            output,
        })
    }

    /// Run the program to completion.
    pub fn run(&mut self) {
        debug!(
            target: "tapetron::vm",
            opcodes = self.program.len(),
            jit = self.config.jit_enabled,
            "run started"
        );
        let mut pc: u64 = 0;
        let mut head = self.tape.head_ptr();
        let vm: *mut Machine = self;
        loop {
            // Re-read the slot every step: the previous handler may have
            // patched a compiled trace into the pc it just sent us to.
            let handler = unsafe { (&(*vm).dispatch)[pc as usize] };
            let exit = unsafe { handler(pc, head, vm) };
            if exit.pc == HALT {
                break;
            }
            pc = exit.pc;
            head = exit.head;
        }
        let _ = self.output.flush();
        debug!(
            target: "tapetron::vm",
            trees = self.store.tree_count(),
            compiled = self.recorder.stats().traces_compiled,
            "run finished"
        );
    }

    /// Trace-recording statistics for this run.
    pub fn trace_stats(&self) -> &TraceStats {
        self.recorder.stats()
    }

    /// The loaded program.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The tape, for inspection after a run.
    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    pub(crate) fn recorder_mut(&mut self) -> &mut TraceRecorder {
        &mut self.recorder
    }

    /// Write one byte to the output stream. Stream errors follow the host
    /// stream's own conventions and are not surfaced here.
    pub(crate) fn write_byte(&mut self, byte: u8) {
        let _ = self.output.write_all(&[byte]);
    }

    /// Read one byte from the input stream; -1 past end of input.
    pub(crate) fn read_byte(&mut self) -> i64 {
        let mut buf = [0u8; 1];
        match self.input.read(&mut buf) {
            Ok(1) => buf[0] as i64,
            _ => -1,
        }
    }

    #[inline]
    fn note_simple(&mut self, pc: usize, opcode: u8, next_pc: usize) {
        if !self.config.jit_enabled {
            return;
        }
        if let Some(root) = self
            .recorder
            .record_simple(pc, opcode, next_pc, &mut self.store)
        {
            self.install_trace(root);
        }
    }

    #[inline]
    fn note_branch(&mut self, pc: usize, opcode: u8, next_pc: usize) {
        if !self.config.jit_enabled {
            return;
        }
        if let Some(root) = self.recorder.record(pc, opcode, next_pc, &mut self.store) {
            self.install_trace(root);
        }
    }

    /// Compile the (re)committed tree at `root` and patch its dispatch
    /// slot. Runs on a handler's return path, never under a native frame,
    /// so the slot rewrite is safe and visible to the very next dispatch.
    #[cfg(feature = "jit")]
    fn install_trace(&mut self, root: usize) {
        let Some(compiler) = self.compiler.as_mut() else {
            return;
        };
        let Some(tree) = self.store.tree(root) else {
            return;
        };
        match compiler.compile(tree, &self.program) {
            Ok(func) => {
                self.dispatch[root] = func;
                self.recorder.stats_mut().traces_compiled += 1;
            }
            Err(e) => {
                // Keep interpreting; the slot is untouched.
                self.recorder.stats_mut().compile_failures += 1;
                warn!(
                    target: "tapetron::vm",
                    root,
                    error = %e,
                    "trace compilation failed, staying interpretive"
                );
            }
        }
    }

    #[cfg(not(feature = "jit"))]
    fn install_trace(&mut self, _root: usize) {}
}

fn handler_for(opcode: u8) -> OpHandler {
    match opcode {
        b'+' => op_plus,
        b'-' => op_minus,
        b'<' => op_left,
        b'>' => op_right,
        b'.' => op_put,
        b',' => op_get,
        b'[' => op_loop,
        b']' => op_back,
        _ => unreachable!("non-opcode byte survived program loading"),
    }
}

// =============================================================================
// Opcode handlers
// =============================================================================
//
// All handlers have the dispatch signature and report to the recorder
// before performing their effect. `head` is trusted: the tape has no
// bounds, by the language's own rules.

unsafe extern "C" fn op_plus(pc: u64, head: *mut u8, vm: *mut Machine) -> Exit {
    let machine = unsafe { &mut *vm };
    let pc = pc as usize;
    machine.note_simple(pc, b'+', pc + 1);
    unsafe { *head = (*head).wrapping_add(1) };
    Exit {
        pc: (pc + 1) as u64,
        head,
    }
}

unsafe extern "C" fn op_minus(pc: u64, head: *mut u8, vm: *mut Machine) -> Exit {
    let machine = unsafe { &mut *vm };
    let pc = pc as usize;
    machine.note_simple(pc, b'-', pc + 1);
    unsafe { *head = (*head).wrapping_sub(1) };
    Exit {
        pc: (pc + 1) as u64,
        head,
    }
}

unsafe extern "C" fn op_left(pc: u64, head: *mut u8, vm: *mut Machine) -> Exit {
    let machine = unsafe { &mut *vm };
    let pc = pc as usize;
    machine.note_simple(pc, b'<', pc + 1);
    Exit {
        pc: (pc + 1) as u64,
        head: unsafe { head.sub(1) },
    }
}

unsafe extern "C" fn op_right(pc: u64, head: *mut u8, vm: *mut Machine) -> Exit {
    let machine = unsafe { &mut *vm };
    let pc = pc as usize;
    machine.note_simple(pc, b'>', pc + 1);
    Exit {
        pc: (pc + 1) as u64,
        head: unsafe { head.add(1) },
    }
}

unsafe extern "C" fn op_put(pc: u64, head: *mut u8, vm: *mut Machine) -> Exit {
    let machine = unsafe { &mut *vm };
    let pc = pc as usize;
    machine.note_simple(pc, b'.', pc + 1);
    machine.write_byte(unsafe { *head });
    Exit {
        pc: (pc + 1) as u64,
        head,
    }
}

unsafe extern "C" fn op_get(pc: u64, head: *mut u8, vm: *mut Machine) -> Exit {
    let machine = unsafe { &mut *vm };
    let pc = pc as usize;
    machine.note_simple(pc, b',', pc + 1);
    let byte = machine.read_byte();
    unsafe { *head = byte as u8 };
    Exit {
        pc: (pc + 1) as u64,
        head,
    }
}

/// `[`: fall into the body on a non-zero cell, jump past the matching
/// `]` otherwise. The branch decision is what the recorder traces.
unsafe extern "C" fn op_loop(pc: u64, head: *mut u8, vm: *mut Machine) -> Exit {
    let machine = unsafe { &mut *vm };
    let pc = pc as usize;
    let next = if unsafe { *head } != 0 {
        pc + 1
    } else {
        machine.program.jump(pc) + 1
    };
    machine.note_branch(pc, b'[', next);
    Exit {
        pc: next as u64,
        head,
    }
}

/// `]`: return to the matching `[`, which re-tests the cell.
unsafe extern "C" fn op_back(pc: u64, head: *mut u8, vm: *mut Machine) -> Exit {
    let machine = unsafe { &mut *vm };
    let pc = pc as usize;
    let next = machine.program.jump(pc);
    machine.note_branch(pc, b']', next);
    Exit {
        pc: next as u64,
        head,
    }
}

unsafe extern "C" fn op_halt(_pc: u64, head: *mut u8, _vm: *mut Machine) -> Exit {
    Exit { pc: HALT, head }
}
