pub mod prompt;

pub use prompt::Prompt;

// println! can panic on a broken pipe, and built-ins running under a
// redirection need every byte flushed while the target descriptor is still
// in place, so all user-visible output funnels through these two.

use std::io::{self, Write};

pub fn write_to_stdout(output: &str) -> anyhow::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(output.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

pub fn write_to_stderr(output: &str) -> anyhow::Result<()> {
    let mut stderr = io::stderr();
    stderr.write_all(output.as_bytes())?;
    stderr.flush()?;
    Ok(())
}
