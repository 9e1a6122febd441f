use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::Context;
use nix::sys::signal::{
    sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

pub const MAX_PIDS: usize = 8;

const EMPTY_SLOT: i32 = -1;

// Flat table of live background PIDs. Slots are atomics because the SIGCHLD
// handler clears them while the evaluator (under a blocked SIGCHLD) fills
// them; no ordering between slots is needed.
pub struct JobTable {
    slots: [AtomicI32; MAX_PIDS],
}

pub static JOBS: JobTable = JobTable::new();

impl JobTable {
    pub const fn new() -> Self {
        const EMPTY: AtomicI32 = AtomicI32::new(EMPTY_SLOT);
        Self {
            slots: [EMPTY; MAX_PIDS],
        }
    }

    // First free slot wins; with the table full the record is dropped and
    // the process runs on unreachable from bjobs.
    pub fn insert(&self, pid: i32) {
        for slot in &self.slots {
            if slot
                .compare_exchange(EMPTY_SLOT, pid, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
        }
    }

    pub fn remove(&self, pid: i32) {
        for slot in &self.slots {
            let _ = slot.compare_exchange(pid, EMPTY_SLOT, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    pub fn pids(&self) -> Vec<i32> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|pid| *pid != EMPTY_SLOT)
            .collect()
    }
}

// Established once at startup: reap-and-report SIGCHLD handler (restart
// interrupted syscalls, no notifications for stopped children), SIGQUIT
// ignored, SIGINT blocked so Ctrl-C at the prompt is swallowed. Children
// inherit the SIGINT mask and never unblock it.
pub fn install_signal_policy() -> anyhow::Result<()> {
    let reaper = SigAction::new(
        SigHandler::Handler(handle_sigchld),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &reaper) }.context("sigaction SIGCHLD")?;

    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGQUIT, &ignore) }.context("sigaction SIGQUIT")?;

    let mut blocked = SigSet::empty();
    blocked.add(Signal::SIGINT);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&blocked), None).context("sigprocmask SIGINT")?;

    Ok(())
}

pub fn block_sigchld() -> nix::Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&set), None)
}

pub fn unblock_sigchld() -> nix::Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)
}

// Async-signal-safe: only waitpid, atomic stores and a single write per
// reaped child; errno is preserved across the whole handler.
extern "C" fn handle_sigchld(_sig: libc::c_int) {
    unsafe {
        let saved_errno = *libc::__errno_location();

        loop {
            let pid = libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG);
            if pid <= 0 {
                break;
            }

            JOBS.remove(pid);

            let mut buf = [0u8; 16];
            let len = format_reaped(&mut buf, pid);
            let _ = libc::write(libc::STDOUT_FILENO, buf.as_ptr().cast(), len);
        }

        *libc::__errno_location() = saved_errno;
    }
}

// Renders "[<pid>]\n" without allocating; pid is a positive waitpid result.
fn format_reaped(buf: &mut [u8; 16], pid: i32) -> usize {
    let mut digits = [0u8; 10];
    let mut n = pid;
    let mut ndigits = 0;
    while n > 0 {
        digits[ndigits] = b'0' + (n % 10) as u8;
        n /= 10;
        ndigits += 1;
    }

    buf[0] = b'[';
    for i in 0..ndigits {
        buf[1 + i] = digits[ndigits - 1 - i];
    }
    buf[1 + ndigits] = b']';
    buf[2 + ndigits] = b'\n';
    3 + ndigits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_takes_first_free_slot() {
        let table = JobTable::new();
        table.insert(100);
        table.insert(200);
        assert_eq!(table.pids(), vec![100, 200]);

        table.remove(100);
        table.insert(300);
        assert_eq!(table.pids(), vec![300, 200]);
    }

    #[test]
    fn test_remove_unknown_pid_is_a_no_op() {
        let table = JobTable::new();
        table.insert(100);
        table.remove(999);
        assert_eq!(table.pids(), vec![100]);
    }

    #[test]
    fn test_full_table_drops_the_record() {
        let table = JobTable::new();
        for pid in 1..=MAX_PIDS as i32 {
            table.insert(pid);
        }
        table.insert(999);
        assert_eq!(table.pids().len(), MAX_PIDS);
        assert!(!table.pids().contains(&999));
    }

    #[test]
    fn test_format_reaped() {
        let mut buf = [0u8; 16];
        let len = format_reaped(&mut buf, 7);
        assert_eq!(&buf[..len], b"[7]\n");

        let len = format_reaped(&mut buf, 4194304);
        assert_eq!(&buf[..len], b"[4194304]\n");
    }
}
