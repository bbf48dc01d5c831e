//! `srvsh`: a shell-script interpreter whose commands run as child
//! processes wired into a server/client IPC tree over unix-domain
//! sockets, rather than the byte pipes of a traditional shell.
//!
//! The library surface is deliberately small: [`run_script`] is the
//! whole entrypoint (spec §2 — memory-map the script, parse/execute
//! it, reap and aggregate exit codes); everything else is exposed for
//! the integration tests in `tests/`.

pub mod config;
pub mod error;
mod fd_mapping;
pub mod frame;
pub mod launch;
pub mod lexer;
pub mod opcode;
mod parser;
pub mod poll;
pub mod reaper;

use error::Result;
use std::path::Path;
use tracing::error;

/// Memory-maps `path` and interprets it as a script: the entrypoint's
/// "memory-map the script, call `F`, then call `G`" (spec §2). A parse
/// failure does not propagate as an `Err` here — spec §7 treats it as
/// a controlled nonzero exit folded into the worst-exit aggregate
/// (spec §8's `exit_code_of_interpreter = max({parser_status} ∪ …)`),
/// so it is logged and contributes `1` rather than aborting outright.
/// Any processes the parser had already spawned before the failure
/// are still reaped and still count toward the final code. Only a
/// failure to even open or map the script file is a hard `Err`.
pub fn run_script(path: &Path) -> Result<i32> {
    let file = std::fs::File::open(path)?;
    // Safety: the file was just opened read-only by this process and
    // is not expected to be written concurrently for the duration of
    // the parse — the same assumption `opcode::OpcodeDb::open` makes
    // of the database file.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };

    let (outcome, pids) = parser::interpret(&mmap);
    let parser_status = match outcome {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            1
        }
    };
    let children_status = reaper::reap_all(&pids)?;
    Ok(parser_status.max(children_status))
}

/// Initializes the interpreter's own `tracing` subscriber (spec
/// §10.2). All output goes to this process's stderr; spawned
/// commands' stdio is left untouched, so script output is never
/// interleaved with interpreter diagnostics.
pub fn init_logging(level: tracing_subscriber::filter::LevelFilter) {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}
