use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};

use git_cinnabar::context::EngineContext;
use git_cinnabar::dispatch;

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("fatal: {e}");
            process::exit(128);
        }
    }
}

fn run() -> Result<i32> {
    let git_dir = git_dir()?;
    let mut ctx = EngineContext::new(&git_dir)
        .with_context(|| format!("opening repository at {}", git_dir.display()))?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    dispatch::run(&mut ctx, BufReader::new(stdin.lock()), stdout.lock())
        .context("command stream")?;
    io::stdout().flush().ok();
    Ok(0)
}

/// Resolve the repository's `.git` directory the same way the donor's
/// fast-import-alike helpers do: trust `GIT_DIR` if set, else assume the
/// process was started from inside one.
fn git_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("GIT_DIR") {
        return Ok(PathBuf::from(dir));
    }
    Ok(PathBuf::from(".git"))
}
