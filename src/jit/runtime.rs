//! Runtime support functions callable from generated code.
//!
//! Compiled traces cannot reach the machine's I/O streams or recorder
//! directly; they call these `extern "C"` functions instead, registered
//! as symbols on the JIT module at construction. Every function takes
//! the machine pointer first, the same pointer the trace received as its
//! third argument.

use crate::jit::tree::NodeId;
use crate::vm::Machine;

/// Write one byte to the machine's output stream. Mirrors the `.`
/// handler exactly so interpreted and compiled output interleave on the
/// same stream.
///
/// # Safety
/// `vm` must be the live machine executing the calling trace.
pub unsafe extern "C" fn jit_runtime_putchar(vm: *mut Machine, byte: i64) -> i64 {
    let vm = unsafe { &mut *vm };
    vm.write_byte(byte as u8);
    byte
}

/// Read one byte from the machine's input stream; -1 on end of input,
/// mirroring the `,` handler.
///
/// # Safety
/// `vm` must be the live machine executing the calling trace.
pub unsafe extern "C" fn jit_runtime_getchar(vm: *mut Machine) -> i64 {
    let vm = unsafe { &mut *vm };
    vm.read_byte()
}

/// Arm the recorder for extension recording. Called by every side-exit
/// block just before it returns control to the interpreter, naming the
/// tree root and the leaf whose untraced branch the exit took.
///
/// # Safety
/// `vm` must be the live machine executing the calling trace; `leaf`
/// must be an arena index of the tree rooted at `root_pc`.
pub unsafe extern "C" fn jit_runtime_arm_extension(vm: *mut Machine, root_pc: i64, leaf: i64) {
    let vm = unsafe { &mut *vm };
    vm.recorder_mut()
        .arm_extension(root_pc as usize, NodeId::from_index(leaf as usize));
}
