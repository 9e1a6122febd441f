use std::ffi::CString;

use anyhow::Context;
use nix::{
    fcntl::open,
    sys::wait::waitpid,
    unistd::{close, dup, dup2, execvp, fork, ForkResult},
};
use tracing::trace;

use crate::{
    builtins,
    command::{Cmd, ExecCmd, RedrCmd},
    frontend::{write_to_stderr, write_to_stdout},
    jobs,
};

// Walks the tree forking children and wiring descriptors. Stateless: the
// only evolving state is the background table in `jobs`. Syscall failures
// in the shell process propagate with context and are fatal to the caller;
// failures in a child that has not exec'd yet are fatal to the child only.
pub fn run_cmd(cmd: &Cmd) -> anyhow::Result<()> {
    trace!(node = %cmd, "run_cmd");

    match cmd {
        Cmd::Exec(exec) => run_exec(exec),
        Cmd::Redr(redr) => run_redr(redr),
        Cmd::Pipe { left, right } => run_pipe(left, right),
        Cmd::List { left, right } => {
            run_cmd(left)?;
            run_cmd(right)
        }
        Cmd::Back(cmd) => run_back(cmd),
        Cmd::Subs(cmd) => run_subs(cmd),
    }
}

// Brackets a synchronous fork+wait region so the SIGCHLD handler cannot
// reap the child before our waitpid is issued.
fn with_sigchld_blocked<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    jobs::block_sigchld().context("sigprocmask SIG_BLOCK")?;
    let result = f();
    jobs::unblock_sigchld().context("sigprocmask SIG_UNBLOCK")?;
    result
}

fn run_exec(exec: &ExecCmd) -> anyhow::Result<()> {
    if exec.argv.is_empty() {
        return Ok(());
    }

    with_sigchld_blocked(|| {
        if builtins::is_builtin(&exec.argv[0]) {
            return builtins::dispatch(&exec.argv);
        }

        match unsafe { fork() }.context("fork EXEC")? {
            ForkResult::Parent { child } => {
                waitpid(child, None).context("waitpid EXEC")?;
                Ok(())
            }
            ForkResult::Child => exec_child(exec),
        }
    })
}

fn run_redr(redr: &RedrCmd) -> anyhow::Result<()> {
    // A built-in under a redirection stays in the shell process; only its
    // target descriptor is swapped out around the call.
    if let Cmd::Exec(exec) = redr.cmd.as_ref() {
        if !exec.argv.is_empty() && builtins::is_builtin(&exec.argv[0]) {
            return with_sigchld_blocked(|| redirect_builtin(redr, exec));
        }
    }

    with_sigchld_blocked(|| {
        match unsafe { fork() }.context("fork REDR")? {
            ForkResult::Parent { child } => {
                waitpid(child, None).context("waitpid REDR")?;
                Ok(())
            }
            ForkResult::Child => {
                if let Err(err) = close(redr.fd) {
                    child_fatal("close REDR", &err.to_string());
                }
                // open picks the lowest free descriptor: the one just closed
                if let Err(err) = open(redr.file.as_str(), redr.flags, redr.mode) {
                    child_fatal(&format!("open '{}'", redr.file), &err.to_string());
                }
                eval_in_child(&redr.cmd)
            }
        }
    })
}

fn redirect_builtin(redr: &RedrCmd, exec: &ExecCmd) -> anyhow::Result<()> {
    let saved = dup(redr.fd).context("dup REDR")?;
    close(redr.fd).context("close REDR")?;

    let result = match open(redr.file.as_str(), redr.flags, redr.mode) {
        Ok(_) => builtins::dispatch(&exec.argv),
        Err(err) => Err(err).context(format!("open '{}'", redr.file)),
    };

    // dup2 also closes the file currently occupying the target slot
    dup2(saved, redr.fd).context("dup2 REDR")?;
    close(saved).context("close REDR")?;

    result
}

fn run_pipe(left: &Cmd, right: &Cmd) -> anyhow::Result<()> {
    with_sigchld_blocked(|| {
        let (read_end, write_end) = nix::unistd::pipe().context("pipe")?;

        let left_pid = match unsafe { fork() }.context("fork PIPE left")? {
            ForkResult::Parent { child } => child,
            ForkResult::Child => {
                plug_pipe_end(libc::STDOUT_FILENO, write_end, read_end);
                eval_in_child(left)
            }
        };

        let right_pid = match unsafe { fork() }.context("fork PIPE right")? {
            ForkResult::Parent { child } => child,
            ForkResult::Child => {
                plug_pipe_end(libc::STDIN_FILENO, read_end, write_end);
                eval_in_child(right)
            }
        };

        close(read_end).context("close PIPE")?;
        close(write_end).context("close PIPE")?;

        waitpid(left_pid, None).context("waitpid PIPE left")?;
        waitpid(right_pid, None).context("waitpid PIPE right")?;

        Ok(())
    })
}

// Child-side: moves `keep` onto `target_fd` and closes both pipe ends.
fn plug_pipe_end(target_fd: i32, keep: i32, other: i32) {
    if let Err(err) = close(target_fd) {
        child_fatal("close PIPE", &err.to_string());
    }
    // dup returns the lowest free descriptor, which is the one just closed
    match dup(keep) {
        Ok(fd) if fd == target_fd => {}
        Ok(_) => child_fatal("dup PIPE", "unexpected descriptor"),
        Err(err) => child_fatal("dup PIPE", &err.to_string()),
    }
    if let Err(err) = close(keep).and_then(|_| close(other)) {
        child_fatal("close PIPE", &err.to_string());
    }
}

fn run_back(cmd: &Cmd) -> anyhow::Result<()> {
    // Blocking SIGCHLD across fork+insert keeps the handler from reaping a
    // short-lived child before its PID lands in the table.
    with_sigchld_blocked(|| {
        match unsafe { fork() }.context("fork BACK")? {
            ForkResult::Parent { child } => {
                jobs::JOBS.insert(child.as_raw());
                write_to_stdout(&format!("[{}]\n", child.as_raw()))?;
                Ok(())
            }
            ForkResult::Child => eval_in_child(cmd),
        }
    })
}

fn run_subs(cmd: &Cmd) -> anyhow::Result<()> {
    with_sigchld_blocked(|| {
        match unsafe { fork() }.context("fork SUBS")? {
            ForkResult::Parent { child } => {
                waitpid(child, None).context("waitpid SUBS")?;
                Ok(())
            }
            ForkResult::Child => {
                let status = match run_cmd(cmd) {
                    Ok(()) => 0,
                    Err(err) => {
                        let _ = write_to_stderr(&format!("simplesh: {:#}\n", err));
                        1
                    }
                };
                unsafe { libc::_exit(status) }
            }
        }
    })
}

// Runs a subtree on the child side of a fork. Plain commands take the exec
// fast path (or dispatch their built-in right here); anything else is
// evaluated recursively. Never returns to the caller's stack.
fn eval_in_child(cmd: &Cmd) -> ! {
    match cmd {
        Cmd::Exec(exec) if exec.argv.first().is_some_and(|a| builtins::is_builtin(a)) => {
            let status = match builtins::dispatch(&exec.argv) {
                Ok(()) => 0,
                Err(err) => {
                    let _ = write_to_stderr(&format!("simplesh: {:#}\n", err));
                    1
                }
            };
            unsafe { libc::_exit(status) }
        }
        Cmd::Exec(exec) => exec_child(exec),
        cmd => {
            let status = match run_cmd(cmd) {
                Ok(()) => 0,
                Err(err) => {
                    let _ = write_to_stderr(&format!("simplesh: {:#}\n", err));
                    1
                }
            };
            unsafe { libc::_exit(status) }
        }
    }
}

// Replaces the child image via execvp; only returns into _exit.
fn exec_child(exec: &ExecCmd) -> ! {
    if exec.argv.is_empty() {
        unsafe { libc::_exit(0) }
    }

    let args: Vec<CString> = exec
        .argv
        .iter()
        .filter_map(|arg| CString::new(arg.as_str()).ok())
        .collect();

    if args.len() == exec.argv.len() {
        let _ = execvp(&args[0], &args);
    }

    let _ = write_to_stderr(&format!(
        "simplesh: no se encontró el comando '{}'\n",
        exec.argv[0]
    ));
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

fn child_fatal(what: &str, detail: &str) -> ! {
    let _ = write_to_stderr(&format!("simplesh: {}: {}\n", what, detail));
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}
