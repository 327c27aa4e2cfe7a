use std::process::Command;

use tracing::{debug, warn};

use crate::builder::ClassifierProgram;
use crate::error::{Result, TcError};

/// Runs one already-tokenized `tc` command line. Implementations other than
/// `ShellExecutor` exist only in tests (a recording no-op); `tc`/iptables
/// programming is treated as an external collaborator throughout this crate.
pub trait Executor {
    fn run(&self, argv: &[&str]) -> Result<()>;
}

/// Shells out to the host's `tc` binary, one line per command, aborting on
/// the first non-zero exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellExecutor;

impl Executor for ShellExecutor {
    fn run(&self, argv: &[&str]) -> Result<()> {
        let output = Command::new("tc").args(argv).output().map_err(|e| TcError::Spawn(e.to_string()))?;
        if !output.status.success() {
            return Err(TcError::CommandFailed {
                command: argv.join(" "),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

/// Installs `program` line by line, stopping at the first failure. A
/// partially applied program must never be left behind on error; callers
/// should pair this with `flush` (or `flush_then_install`) rather than
/// retrying in place.
pub fn install(executor: &dyn Executor, program: &ClassifierProgram) -> Result<()> {
    for line in program.to_command_lines() {
        debug!(cmd = %line, "installing tc record");
        let argv: Vec<&str> = line.split_whitespace().collect();
        executor.run(&argv)?;
    }
    Ok(())
}

/// Tears down `program` in reverse order. Errors are logged, not
/// propagated: a flush is itself a best-effort cleanup step, and failing
/// to flush a line that was never installed (e.g. a retry after a partial
/// failure) is expected.
pub fn flush(executor: &dyn Executor, program: &ClassifierProgram) {
    for line in program.to_teardown_lines() {
        let argv: Vec<&str> = line.split_whitespace().collect();
        if let Err(err) = executor.run(&argv) {
            warn!(cmd = %line, %err, "tc teardown line failed, continuing");
        }
    }
}

/// Flushes any previously installed program before installing `program`.
pub fn flush_then_install(executor: &dyn Executor, previous: Option<&ClassifierProgram>, program: &ClassifierProgram) -> Result<()> {
    if let Some(previous) = previous {
        flush(executor, previous);
    }
    install(executor, program)
}
