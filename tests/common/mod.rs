//! Shared helpers for end-to-end tests: run a program with captured
//! streams and hand back its output and trace statistics.
//!
//! Not every test file uses every helper.
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use tapetron::{Machine, TraceConfig, TraceStats};

/// A `Write` handle the test can keep while the machine owns a clone.
#[derive(Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `source` to completion and return `(output, stats)`.
pub fn run_with_config(
    source: &[u8],
    input: &'static [u8],
    config: TraceConfig,
) -> (Vec<u8>, TraceStats) {
    let output = SharedOutput::default();
    let mut machine = Machine::with_io(source, config, Box::new(input), Box::new(output.clone()))
        .expect("test program should load");
    machine.run();
    (output.bytes(), *machine.trace_stats())
}

/// Run purely interpretively.
pub fn run_interpreted(source: &[u8], input: &'static [u8]) -> Vec<u8> {
    run_with_config(source, input, TraceConfig::interpreter_only()).0
}

/// Run with the JIT enabled at a lowered hotness threshold.
pub fn run_jit(source: &[u8], input: &'static [u8], threshold: u8) -> (Vec<u8>, TraceStats) {
    run_with_config(
        source,
        input,
        TraceConfig::default().with_threshold(threshold),
    )
}
