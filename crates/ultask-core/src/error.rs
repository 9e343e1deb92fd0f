//! The error taxonomy for the patch engine.
//!
//! Variants carry enough context to render a useful message on their own;
//! callers compose them with `anyhow::Context` rather than matching strings.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum UlpError {
    NotElf(PathBuf),
    WrongClass(PathBuf),
    WrongMachine(PathBuf),
    NoSuchPid(i32),
    PermissionDenied(String),
    MissingLibc,
    MissingStack,
    PtraceFailed { op: &'static str, errno: i32 },
    RemoteSyscall { nr: i64, errno: i32 },
    UndefinedSymbol(String),
    UnsupportedReloc(u32),
    DisplacementOutOfRange,
    Io { path: PathBuf, errno: i32 },
    Inconsistent(String),
}

impl fmt::Display for UlpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UlpError::NotElf(path) => write!(f, "{}: not an ELF file", path.display()),
            UlpError::WrongClass(path) => write!(f, "{}: not a 64-bit ELF", path.display()),
            UlpError::WrongMachine(path) => {
                write!(f, "{}: unsupported ELF machine (need x86-64 or aarch64)", path.display())
            }
            UlpError::NoSuchPid(pid) => write!(f, "no such process: {pid}"),
            UlpError::PermissionDenied(what) => write!(f, "permission denied: {what}"),
            UlpError::MissingLibc => write!(f, "target has no libc mapping"),
            UlpError::MissingStack => write!(f, "target has no stack mapping"),
            UlpError::PtraceFailed { op, errno } => {
                write!(f, "ptrace({op}) failed: errno {errno}")
            }
            UlpError::RemoteSyscall { nr, errno } => {
                write!(f, "remote syscall {nr} failed: errno {errno}")
            }
            UlpError::UndefinedSymbol(name) => write!(f, "undefined symbol: {name}"),
            UlpError::UnsupportedReloc(r_type) => write!(f, "unsupported relocation type {r_type}"),
            UlpError::DisplacementOutOfRange => write!(f, "branch displacement out of range"),
            UlpError::Io { path, errno } => write!(f, "{}: I/O error (errno {errno})", path.display()),
            UlpError::Inconsistent(state) => write!(f, "target left in an inconsistent state: {state}"),
        }
    }
}

impl std::error::Error for UlpError {}

impl From<nix::Error> for UlpError {
    fn from(err: nix::Error) -> Self {
        UlpError::PtraceFailed {
            op: "ptrace",
            errno: err as i32,
        }
    }
}

impl From<std::io::Error> for UlpError {
    fn from(err: std::io::Error) -> Self {
        UlpError::Io {
            path: PathBuf::new(),
            errno: err.raw_os_error().unwrap_or(-1),
        }
    }
}

pub type Result<T> = std::result::Result<T, UlpError>;

/// Wraps an I/O error with the path that caused it, for a more useful [`UlpError::Io`].
pub fn io_err(path: impl Into<PathBuf>, err: std::io::Error) -> UlpError {
    UlpError::Io {
        path: path.into(),
        errno: err.raw_os_error().unwrap_or(-1),
    }
}
