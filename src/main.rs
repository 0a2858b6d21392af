/// tapetron - tracing JIT runtime CLI
use std::env;
use std::fs;
use std::io::{self, Read};
use std::process;

use tapetron::{Machine, TraceConfig};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("tapetron v{}", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    tapetron [OPTIONS] <INPUT>");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -h, --help           Print this help message");
    eprintln!("    -v, --version        Print version information");
    eprintln!("    --no-jit             Run purely interpretively");
    eprintln!("    --threshold <N>      Hot-loop threshold before tracing (default 100)");
    eprintln!("    --stats              Print trace statistics to stderr on exit");
    eprintln!();
    eprintln!("ARGUMENTS:");
    eprintln!("    <INPUT>              Program file (use '-' for stdin)");
    eprintln!();
    eprintln!("EXAMPLES:");
    eprintln!("    tapetron hello.bf");
    eprintln!("    tapetron --no-jit hello.bf");
    eprintln!("    cat hello.bf | tapetron -");
}

fn print_version() {
    println!("tapetron {}", VERSION);
}

struct Options {
    input: Option<String>,
    no_jit: bool,
    threshold: Option<u8>,
    stats: bool,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();

    let mut input = None;
    let mut no_jit = false;
    let mut threshold = None;
    let mut stats = false;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                process::exit(0);
            }
            "--no-jit" => {
                no_jit = true;
            }
            "--threshold" => {
                i += 1;
                if i >= args.len() {
                    return Err("Missing value after --threshold".to_string());
                }
                let value: u8 = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid threshold: {}", args[i]))?;
                threshold = Some(value);
            }
            "--stats" => {
                stats = true;
            }
            arg if arg.starts_with('-') && arg != "-" => {
                return Err(format!("Unknown option: {}", arg));
            }
            arg => {
                if input.is_some() {
                    return Err("Multiple input files specified".to_string());
                }
                input = Some(arg.to_string());
            }
        }
        i += 1;
    }

    Ok(Options {
        input,
        no_jit,
        threshold,
        stats,
    })
}

fn read_input(input: &str) -> Result<Vec<u8>, String> {
    if input == "-" {
        let mut buffer = Vec::new();
        io::stdin()
            .read_to_end(&mut buffer)
            .map_err(|e| format!("Failed to read from stdin: {}", e))?;
        Ok(buffer)
    } else {
        fs::read(input).map_err(|e| format!("Failed to read file '{}': {}", input, e))
    }
}

fn main() {
    // Program output owns stdout; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let options = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            process::exit(1);
        }
    };

    let Some(input) = options.input else {
        eprintln!("Error: Missing input file");
        eprintln!();
        print_usage();
        process::exit(1);
    };

    let source = match read_input(&input) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    let mut config = if options.no_jit {
        TraceConfig::interpreter_only()
    } else {
        TraceConfig::default()
    };
    if let Some(threshold) = options.threshold {
        config = config.with_threshold(threshold);
    }

    let mut machine = match Machine::new(&source, config) {
        Ok(machine) => machine,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    machine.run();

    if options.stats {
        let stats = machine.trace_stats();
        eprintln!(
            "traces: {} committed, {} extended, {} compiled ({:.0}%), {} failed",
            stats.traces_committed,
            stats.extensions_committed,
            stats.traces_compiled,
            stats.compile_rate(),
            stats.compile_failures,
        );
        eprintln!(
            "aborts: {} buffer, {} back-edge, {} blacklisted",
            stats.buffer_aborts, stats.backedge_aborts, stats.blacklist_hits,
        );
    }
}
