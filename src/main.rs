mod builtins;
mod command;
mod engine;
mod errors;
mod frontend;
mod jobs;


use std::env;
use std::process;

use getopts::Options;
use tracing::{debug, Level};

use errors::ShellError;
use frontend::{write_to_stderr, Prompt};

// Debug bit-flags for -d: print the parsed tree, trace the evaluator.
const DBG_CMD: u8 = 1 << 0;
const DBG_TRACE: u8 = 1 << 1;

fn main() -> anyhow::Result<()> {
    let dbg_level = parse_args();
    init_tracing(dbg_level);

    jobs::install_signal_policy()?;

    // cd reinitializes OLDPWD lazily on its first successful call
    env::remove_var("OLDPWD");

    repl()
}

// Read one line, parse, evaluate, drop the tree; EOF ends the shell with
// success. Syntax rejects abandon the line; an oversized argv and any
// shell-side syscall failure are fatal.
fn repl() -> anyhow::Result<()> {
    let prompt = Prompt::new();

    loop {
        let Some(line) = prompt.read_line()? else {
            return Ok(());
        };

        let cmd = match command::parse(&line) {
            Ok(cmd) => cmd,
            Err(err @ ShellError::TooManyArgs) => return Err(err.into()),
            Err(err) => {
                write_to_stderr(&format!("{}\n", err))?;
                continue;
            }
        };

        debug!(tree = %cmd, "parsed command");

        engine::run_cmd(&cmd)?;
    }
}

fn parse_args() -> u8 {
    let args: Vec<String> = env::args().collect();

    let mut opts = Options::new();
    opts.optopt("d", "", "fija el nivel de depuración a N", "N");
    opts.optflag("h", "", "ayuda");

    let matches = match opts.parse(&args[1..]) {
        Ok(matches) => matches,
        Err(_) => {
            help(&args[0]);
            process::exit(0);
        }
    };

    if matches.opt_present("h") {
        help(&args[0]);
        process::exit(0);
    }

    matches
        .opt_str("d")
        .and_then(|level| level.parse().ok())
        .unwrap_or(0)
}

fn help(program: &str) {
    println!(
        "Usage: {} [-d N] [-h]\n\
         shell simplesh v{}\n\
         Options:\n\
         -d set debug level to N\n\
         -h help\n",
        program,
        env!("CARGO_PKG_VERSION")
    );
}

fn init_tracing(dbg_level: u8) {
    let level = if dbg_level & DBG_TRACE != 0 {
        Level::TRACE
    } else if dbg_level & DBG_CMD != 0 {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}
