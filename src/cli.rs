//! CLI argument surface for the `ultask` binary (§4.7).

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ultask")]
#[command(version, about = "Userspace live-patch a running process", long_about = None)]
pub struct Cli {
    /// Target process ID.
    #[arg(short, long)]
    pub pid: i32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print the target's VMA map.
    Vmas,
    /// Print the target's threads.
    Threads,
    /// Print the target's open file descriptors.
    Fds,
    /// Print the target's auxv.
    Auxv,
    /// Print the target's /proc/PID/status fields.
    Status,
    /// Print the target's resolved symbol index.
    Symbols,
    /// Dump memory: a VMA (`vma,addr=A`), raw bytes (`addr=A,size=S`), or a
    /// byte-level disassembly stand-in (`disasm,addr=A,size=S`).
    Dump {
        #[arg(value_name = "SPEC")]
        spec: String,
        /// Write the dumped bytes here instead of a hex dump to stdout.
        #[arg(short, long, value_name = "FILE")]
        output: Option<std::path::PathBuf>,
    },
    /// Load a relocatable patch object into the target:
    /// `file=PATH[,ro][,noexec]`.
    Map {
        #[arg(value_name = "SPEC")]
        spec: String,
    },
    /// Remove a previously loaded patch by index.
    Unmap {
        /// Index into the target's loaded-patch list.
        index: usize,
    },
    /// Install a call-site diversion: `from=ADDR,to=ADDR` or
    /// `old_name=NAME,new_name=NAME` `[,kind=jump|ftrace|nop]` (`jump`, a
    /// direct branch at `from`/`old_name`, is the default).
    Jmp {
        #[arg(value_name = "SPEC")]
        spec: String,
    },
}
