//! ptrace-mediated remote operations on a live [`Task`] (§4.4, C4).
//!
//! Attach/detach and register save/restore are expressed as nested RAII
//! guards so every exit path — success, an early `?`, or a panic unwinding
//! through this stack — still leaves the target's registers and scratch
//! bytes exactly as they were found.

use crate::error::{Result, UlpError};
use crate::target::Task;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// Guards a `PTRACE_ATTACH`'d target. `Drop` always detaches, regardless of
/// how the guard's scope is exited.
pub struct AttachGuard<'t> {
    task: &'t Task,
    pid: Pid,
}

impl<'t> AttachGuard<'t> {
    pub(crate) fn new(task: &'t Task) -> Result<Self> {
        let pid = Pid::from_raw(task.pid);
        ptrace::attach(pid).map_err(|e| UlpError::PtraceFailed {
            op: "PTRACE_ATTACH",
            errno: e as i32,
        })?;
        wait_for_attach_stop(pid)?;
        Ok(AttachGuard { task, pid })
    }

    pub fn task(&self) -> &Task {
        self.task
    }

    /// Executes a remote syscall in the attached target (§4.4 steps 1-7).
    pub fn syscall(&self, nr: i64, args: [u64; 6]) -> Result<i64> {
        task_syscall(self.task, self.pid, nr, args)
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        let _ = ptrace::detach(self.pid, None);
    }
}

/// Waits for the post-`PTRACE_ATTACH` stop. A `SIGSTOP` is the expected
/// case; `SIGTRAP` is accepted too (the execve-exit race, §4.4); any other
/// signal is re-delivered via `PTRACE_CONT` and waited on again.
fn wait_for_attach_stop(pid: Pid) -> Result<()> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => return Ok(()),
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => return Ok(()),
            Ok(WaitStatus::Stopped(_, sig)) => {
                ptrace::cont(pid, Some(sig)).map_err(|e| UlpError::PtraceFailed {
                    op: "PTRACE_CONT",
                    errno: e as i32,
                })?;
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(UlpError::PtraceFailed {
                    op: "waitpid",
                    errno: e as i32,
                })
            }
        }
    }
}

/// Single-steps the target through the `PTRACE_CONT` + `waitpid` pair that
/// carries it from "registers loaded, libc-base patched with a syscall
/// instruction" to "syscall executed, re-stopped". A `SIGSEGV` here means
/// the instrumented region was unexecutable in some unexpected way — fatal.
fn wait_for_syscall_stop(pid: Pid) -> Result<()> {
    ptrace::cont(pid, None).map_err(|e| UlpError::PtraceFailed {
        op: "PTRACE_CONT",
        errno: e as i32,
    })?;
    match waitpid(pid, None) {
        Ok(WaitStatus::Stopped(_, Signal::SIGSEGV)) => Err(UlpError::Inconsistent(
            "target received SIGSEGV during remote syscall execution".into(),
        )),
        Ok(WaitStatus::Stopped(_, _)) => Ok(()),
        Ok(other) => Err(UlpError::Inconsistent(format!(
            "unexpected wait status during remote syscall: {other:?}"
        ))),
        Err(e) => Err(UlpError::PtraceFailed {
            op: "waitpid",
            errno: e as i32,
        }),
    }
}

fn getregset(pid: Pid, arch: crate::arch::Arch) -> Result<Vec<u8>> {
    let ops = arch.ops();
    let mut buf = vec![0u8; ops.regs_size()];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            libc::NT_PRSTATUS as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if ret < 0 {
        return Err(UlpError::PtraceFailed {
            op: "PTRACE_GETREGSET",
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        });
    }
    Ok(buf)
}

fn setregset(pid: Pid, raw: &mut [u8]) -> Result<()> {
    let mut iov = libc::iovec {
        iov_base: raw.as_mut_ptr() as *mut libc::c_void,
        iov_len: raw.len(),
    };
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            libc::NT_PRSTATUS as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if ret < 0 {
        return Err(UlpError::PtraceFailed {
            op: "PTRACE_SETREGSET",
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Guards a saved register set and scratch bytes, restoring both on drop
/// (§4.4 step 7, the `poke_back` teardown of §7).
struct RegsGuard {
    pid: Pid,
    saved_regs: Vec<u8>,
    scratch_addr: u64,
    saved_scratch: Vec<u8>,
}

impl RegsGuard {
    fn restore(&self, task: &Task) {
        let mut regs = self.saved_regs.clone();
        let _ = setregset(self.pid, &mut regs);
        let _ = task.memcpy_to_task(self.scratch_addr, &self.saved_scratch);
    }
}

fn task_syscall(task: &Task, pid: Pid, nr: i64, args: [u64; 6]) -> Result<i64> {
    let ops = task.arch.ops();
    let scratch_addr = task.libc_base();
    let scratch_len = ops.syscall_instr_bytes().len().max(ops.nop_replace().len());

    let saved_regs = getregset(pid, task.arch)?;
    let mut saved_scratch = vec![0u8; scratch_len];
    task.memcpy_from_task(scratch_addr, &mut saved_scratch)?;

    let guard = RegsGuard {
        pid,
        saved_regs: saved_regs.clone(),
        scratch_addr,
        saved_scratch: saved_scratch.clone(),
    };

    let result = (|| -> Result<i64> {
        task.memcpy_to_task(scratch_addr, ops.syscall_instr_bytes())?;

        let mut regs = saved_regs.clone();
        ops.regs_prepare(&mut regs, nr, args);
        ops.set_ip(&mut regs, scratch_addr);
        setregset(pid, &mut regs)?;

        wait_for_syscall_stop(pid)?;

        let after = getregset(pid, task.arch)?;
        Ok(ops.get_ret(&after))
    })();

    guard.restore(task);

    let ret = result?;
    if ret < 0 {
        return Err(UlpError::RemoteSyscall {
            nr,
            errno: (-ret) as i32,
        });
    }
    Ok(ret)
}

/// Syscall numbers, Linux x86-64/AArch64-shared where the ABI agrees; the
/// handful that diverge (`open` vs `openat`) are picked per `task.arch`.
mod nr {
    pub const MMAP: i64 = 9;
    pub const MPROTECT: i64 = 10;
    pub const MUNMAP: i64 = 11;
    pub const MSYNC: i64 = 26;
    pub const OPEN: i64 = 2;
    pub const OPENAT: i64 = 257;
    pub const CLOSE: i64 = 3;
    pub const FTRUNCATE: i64 = 77;
    pub const FSTAT: i64 = 5;
    pub const PRCTL: i64 = 157;

    pub const MMAP_AARCH64: i64 = 222;
    pub const MPROTECT_AARCH64: i64 = 226;
    pub const MUNMAP_AARCH64: i64 = 215;
    pub const MSYNC_AARCH64: i64 = 227;
    pub const OPENAT_AARCH64: i64 = 56;
    pub const CLOSE_AARCH64: i64 = 57;
    pub const FTRUNCATE_AARCH64: i64 = 46;
    pub const FSTAT_AARCH64: i64 = 80;
    pub const PRCTL_AARCH64: i64 = 167;
}

impl<'t> AttachGuard<'t> {
    fn sys_nr(&self, x86: i64, aarch64: i64) -> i64 {
        match self.task.arch {
            crate::arch::Arch::X86_64 => x86,
            crate::arch::Arch::AArch64 => aarch64,
        }
    }

    pub fn task_mmap(&self, addr: u64, len: u64, prot: i32, flags: i32, fd: i32, offset: u64) -> Result<u64> {
        let nr = self.sys_nr(nr::MMAP, nr::MMAP_AARCH64);
        let ret = self.syscall(
            nr,
            [addr, len, prot as u64, flags as u64, fd as u64, offset],
        )?;
        Ok(ret as u64)
    }

    pub fn task_mprotect(&self, addr: u64, len: u64, prot: i32) -> Result<()> {
        let nr = self.sys_nr(nr::MPROTECT, nr::MPROTECT_AARCH64);
        self.syscall(nr, [addr, len, prot as u64, 0, 0, 0])?;
        Ok(())
    }

    pub fn task_munmap(&self, addr: u64, len: u64) -> Result<()> {
        let nr = self.sys_nr(nr::MUNMAP, nr::MUNMAP_AARCH64);
        self.syscall(nr, [addr, len, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn task_msync(&self, addr: u64, len: u64, flags: i32) -> Result<()> {
        let nr = self.sys_nr(nr::MSYNC, nr::MSYNC_AARCH64);
        self.syscall(nr, [addr, len, flags as u64, 0, 0, 0])?;
        Ok(())
    }

    /// Writes `path`, canonicalized on the controller side, into a scratch
    /// allocation inside the target, then opens it there (§4.4: `open` on
    /// x86-64, `openat(AT_FDCWD, ...)` on AArch64; both exposed uniformly).
    pub fn task_open(&self, path: &std::path::Path, flags: i32, mode: u32) -> Result<i32> {
        let resolved = std::fs::canonicalize(path).map_err(|e| crate::error::io_err(path, e))?;
        let mut bytes = resolved.as_os_str().as_encoded_bytes().to_vec();
        bytes.push(0);

        let scratch = self.task_malloc(bytes.len() as u64)?;
        self.task.memcpy_to_task(scratch, &bytes)?;

        let ret = match self.task.arch {
            crate::arch::Arch::X86_64 => {
                self.syscall(nr::OPEN, [scratch, flags as u64, mode as u64, 0, 0, 0])?
            }
            crate::arch::Arch::AArch64 => self.syscall(
                nr::OPENAT_AARCH64,
                [libc::AT_FDCWD as u64, scratch, flags as u64, mode as u64, 0, 0],
            )?,
        };

        self.task_free(scratch, bytes.len() as u64)?;
        Ok(ret as i32)
    }

    pub fn task_close(&self, fd: i32) -> Result<()> {
        let nr = self.sys_nr(nr::CLOSE, nr::CLOSE_AARCH64);
        self.syscall(nr, [fd as u64, 0, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn task_ftruncate(&self, fd: i32, len: u64) -> Result<()> {
        let nr = self.sys_nr(nr::FTRUNCATE, nr::FTRUNCATE_AARCH64);
        self.syscall(nr, [fd as u64, len, 0, 0, 0, 0])?;
        Ok(())
    }

    /// Reads back a raw `struct stat` from a scratch allocation; callers
    /// that only need `st_size` can slice it out at the platform-specific offset.
    pub fn task_fstat(&self, fd: i32, statbuf_scratch: u64) -> Result<()> {
        let nr = self.sys_nr(nr::FSTAT, nr::FSTAT_AARCH64);
        self.syscall(nr, [fd as u64, statbuf_scratch, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn task_prctl(&self, option: i32, arg2: u64, arg3: u64, arg4: u64, arg5: u64) -> Result<i64> {
        let nr = self.sys_nr(nr::PRCTL, nr::PRCTL_AARCH64);
        self.syscall(nr, [option as u64, arg2, arg3, arg4, arg5, 0])
    }

    /// Anonymous RW mapping used as scratch space for syscall arguments that
    /// must live in target memory (paths, stat buffers).
    pub fn task_malloc(&self, len: u64) -> Result<u64> {
        self.task_mmap(
            0,
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    }

    pub fn task_free(&self, addr: u64, len: u64) -> Result<()> {
        self.task_munmap(addr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_nr_picks_per_arch() {
        // Exercised indirectly through Task in integration tests (requires a
        // live attachable child); this just pins the constant table down.
        assert_eq!(nr::OPEN, 2);
        assert_eq!(nr::OPENAT_AARCH64, 56);
    }
}
