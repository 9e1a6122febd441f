pub mod psplit;

use std::env;
use std::path::PathBuf;

use anyhow::Context;
use getopts::Options;
use nix::{
    sys::signal::{kill, Signal},
    unistd::{chdir, getcwd, Pid},
};

use crate::{
    frontend::{write_to_stderr, write_to_stdout},
    jobs,
};

pub const BUILTINS: [&str; 5] = ["cwd", "cd", "exit", "psplit", "bjobs"];

const BJOBS_USAGE: &str = "Uso: bjobs [-k] [-h]\n\
                           Opciones:\n\
                           -k Mata todos los procesos en segundo plano.\n\
                           -h Ayuda\n";

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

// The caller decides where a built-in runs (shell process or forked child);
// here the name is already known to be in the table.
pub fn dispatch(argv: &[String]) -> anyhow::Result<()> {
    match argv[0].as_str() {
        "cwd" => run_cwd(),
        "cd" => run_cd(argv),
        "exit" => run_exit(),
        "psplit" => psplit::run_psplit(argv),
        "bjobs" => run_bjobs(argv),
        other => anyhow::bail!("'{}' no es un comando interno", other),
    }
}

fn run_cwd() -> anyhow::Result<()> {
    let cwd = getcwd().context("getcwd")?;
    write_to_stdout(&format!("cwd: {}\n", cwd.display()))
}

fn run_exit() -> anyhow::Result<()> {
    // The line and its tree are process-owned memory, reclaimed at exit
    std::process::exit(0);
}

// OLDPWD is defined iff at least one prior cd succeeded: it is unset at
// startup and written only after a successful chdir.
fn run_cd(argv: &[String]) -> anyhow::Result<()> {
    if argv.len() > 2 {
        return write_to_stdout("run_cd: Demasiados argumentos\n");
    }

    let previous = getcwd().context("getcwd")?;

    let target: PathBuf = match argv.get(1).map(|arg| arg.as_str()) {
        None => match env::var_os("HOME") {
            Some(home) => home.into(),
            None => return write_to_stdout("run_cd: Variable HOME no definida\n"),
        },
        Some("-") => match env::var_os("OLDPWD") {
            Some(oldpwd) => oldpwd.into(),
            None => return write_to_stdout("run_cd: Variable OLDPWD no definida\n"),
        },
        Some(dir) => dir.into(),
    };

    match chdir(&target) {
        Ok(()) => {
            env::set_var("OLDPWD", previous);
            Ok(())
        }
        Err(_) => write_to_stdout(&format!(
            "run_cd: No existe el directorio '{}'\n",
            target.display()
        )),
    }
}

fn run_bjobs(argv: &[String]) -> anyhow::Result<()> {
    let mut opts = Options::new();
    opts.optflag("k", "", "mata todos los procesos en segundo plano");
    opts.optflag("h", "", "ayuda");

    let matches = match opts.parse(&argv[1..]) {
        Ok(matches) => matches,
        Err(fail) => {
            return write_to_stderr(&format!("bjobs: {}\n", fail));
        }
    };

    if matches.opt_present("k") {
        for pid in jobs::JOBS.pids() {
            kill(Pid::from_raw(pid), Signal::SIGTERM).context("kill SIGTERM")?;
        }
    } else if matches.opt_present("h") {
        write_to_stdout(BJOBS_USAGE)?;
    } else {
        for pid in jobs::JOBS.pids() {
            write_to_stdout(&format!("[{}]\n", pid))?;
        }
    }

    Ok(())
}
