//! Prints device results for a human at a terminal.
//!
//! [PrintSink] is a thin shell around testable functions that write to any [Write]r. The real
//! sink locks stdout or stderr for the duration of one write, so concurrent jobs never interleave
//! the output of two devices.

use crate::collector::Sink;
use crate::core::{Outcome, ResultSet, SessionResult};
use async_trait::async_trait;
use std::io::{self, Write};
use std::ops::DerefMut;

/// The indentation applied to a device's output under its id.
const INDENT: &str = "    ";

/// A [Sink] that prints each result to stdout and a summary to stderr.
#[derive(Clone, Debug, Default)]
pub struct PrintSink {
    delivered: usize,
    failed: usize,
}

impl PrintSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sink for PrintSink {
    async fn deliver(&mut self, result: &SessionResult) -> io::Result<()> {
        self.delivered += 1;
        if !result.outcome.is_success() {
            self.failed += 1;
        }
        _print(&mut io::stdout().lock(), result)
    }

    async fn finish(&mut self) -> io::Result<()> {
        _summary(&mut io::stderr().lock(), self.delivered, self.failed)
    }
}

/// Prints every result in `results`, in id order, to stdout.
pub fn print_results(results: &ResultSet) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    for (id, outcome) in results.iter() {
        write_result(&mut stdout, id, outcome)?;
    }
    _summary(&mut io::stderr().lock(), results.len(), results.failures())
}

/// A testable function containing the logic for printing one device's result.
pub fn _print<OT: Write, O: DerefMut<Target = OT>>(
    mut stdout: O,
    result: &SessionResult,
) -> io::Result<()> {
    write_result(&mut *stdout, &result.id, &result.outcome)?;
    stdout.flush()
}

fn write_result(stdout: &mut impl Write, id: &str, outcome: &Outcome) -> io::Result<()> {
    let body = serde_yaml::to_string(outcome).map_err(io::Error::other)?;
    writeln!(stdout, "{id}:")?;
    for line in body.lines() {
        writeln!(stdout, "{INDENT}{line}")?;
    }
    Ok(())
}

/// A testable function containing the logic for summarizing a job.
pub fn _summary<ET: Write, E: DerefMut<Target = ET>>(
    mut stderr: E,
    delivered: usize,
    failed: usize,
) -> io::Result<()> {
    let noun = if delivered == 1 { "device" } else { "devices" };
    if failed == 0 {
        writeln!(stderr, "{delivered} {noun} succeeded")
    } else {
        writeln!(stderr, "{delivered} {noun} finished, {failed} failed")
    }
}
