mod cli;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use log::{debug, info};
use std::collections::HashMap;
use ultask_core::rewrite::RewriteKind;
use ultask_core::{Controller, FtoFlags};

fn main() {
    env_logger::builder()
        .parse_env(env_logger::Env::new().filter_or("ULTASK_LOG", "info"))
        .format_timestamp(None)
        .init();

    if let Err(err) = run() {
        for cause in err.chain() {
            log::error!("{cause}");
        }
        std::process::exit(exit_code(&err));
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(ulp) = err.downcast_ref::<ultask_core::UlpError>() {
        return match ulp {
            ultask_core::UlpError::Io { errno, .. } => *errno,
            ultask_core::UlpError::RemoteSyscall { errno, .. } => (*errno).min(255),
            _ => 1,
        };
    }
    1
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let root_dir = std::env::var("ULTASK_ROOT_DIR").unwrap_or_else(|_| "/var/run/ultask".to_string());
    let controller = Controller::new(root_dir);

    let flags = match cli.command {
        Command::Symbols | Command::Map { .. } | Command::Jmp { .. } => {
            FtoFlags::VMA_ELF | FtoFlags::VMA_ELF_SYMBOLS
        }
        _ => FtoFlags::VMA_ELF,
    };

    let mut task = controller
        .open_task(cli.pid, flags)
        .with_context(|| format!("failed to open pid {}", cli.pid))?;
    info!("opened pid {} ({})", task.pid, task.comm);

    match cli.command {
        Command::Vmas => dump_vmas(&task),
        Command::Threads => dump_threads(cli.pid)?,
        Command::Fds => dump_fds(cli.pid)?,
        Command::Auxv => dump_auxv(cli.pid)?,
        Command::Status => dump_status(cli.pid)?,
        Command::Symbols => dump_symbols(&task),
        Command::Dump { spec, output } => dump_memory(&task, &spec, output.as_deref())?,
        Command::Map { spec } => {
            let fields = parse_spec(&spec);
            let object = fields
                .get("file")
                .ok_or_else(|| anyhow!("missing file="))
                .map(std::path::PathBuf::from)?;
            let ro = fields.contains_key("ro");
            let noexec = fields.contains_key("noexec");
            let idx = ultask_core::patch::load_patch(&mut task, &object, ro, noexec)
                .with_context(|| format!("failed to load patch {}", object.display()))?;
            println!("loaded patch {idx} at {:#x}", task.load_infos[idx].patch_base);
        }
        Command::Unmap { index } => {
            ultask_core::patch::delete_patch(&mut task, index)
                .with_context(|| format!("failed to delete patch {index}"))?;
            println!("removed patch {index}");
        }
        Command::Jmp { spec } => install_jmp(&task, &spec)?,
    }

    Ok(())
}

fn parse_spec(spec: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for part in spec.split(',') {
        if let Some((k, v)) = part.split_once('=') {
            map.insert(k.to_string(), v.to_string());
        } else if !part.is_empty() {
            map.insert(part.to_string(), String::new());
        }
    }
    map
}

fn parse_addr(s: &str) -> Result<u64> {
    let s = s.trim();
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| anyhow!("invalid address '{s}': {e}"))
}

fn dump_vmas(task: &ultask_core::Task) {
    for vma in &task.vmas {
        println!(
            "{:016x}-{:016x} {}{}{} {:?} {}",
            vma.start,
            vma.end,
            if vma.perms.read { 'r' } else { '-' },
            if vma.perms.write { 'w' } else { '-' },
            if vma.perms.exec { 'x' } else { '-' },
            vma.vma_type,
            vma.pathname.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
        );
    }
}

fn dump_symbols(task: &ultask_core::Task) {
    for sym in task.symbols() {
        if let Some(addr) = task.resolve_symbol_addr(&sym.name) {
            println!("{addr:016x} {}", sym.name);
        }
    }
}

fn dump_threads(pid: i32) -> Result<()> {
    let proc = procfs::process::Process::new(pid).context("failed to open /proc/PID")?;
    for t in proc.tasks().context("failed to read /proc/PID/task")?.flatten() {
        println!("{}", t.tid);
    }
    Ok(())
}

fn dump_fds(pid: i32) -> Result<()> {
    let proc = procfs::process::Process::new(pid).context("failed to open /proc/PID")?;
    for fd in proc.fd().context("failed to read /proc/PID/fd")?.flatten() {
        println!("{} -> {:?}", fd.fd, fd.target);
    }
    Ok(())
}

fn dump_auxv(pid: i32) -> Result<()> {
    let proc = procfs::process::Process::new(pid).context("failed to open /proc/PID")?;
    for (key, value) in proc.auxv().context("failed to read /proc/PID/auxv")? {
        println!("{key:#x} = {value:#x}");
    }
    Ok(())
}

fn dump_status(pid: i32) -> Result<()> {
    let proc = procfs::process::Process::new(pid).context("failed to open /proc/PID")?;
    let status = proc.status().context("failed to read /proc/PID/status")?;
    println!("Name: {}", status.name);
    println!("State: {}", status.state);
    println!("Pid: {}", status.pid);
    println!("PPid: {}", status.ppid);
    println!("Threads: {}", status.threads);
    Ok(())
}

/// Renders raw bytes with offsets. No disassembler is built here; a future
/// collaborator can swap this out without touching the core. `output`
/// writes the raw bytes to a file instead of a hex dump to stdout (§6).
fn dump_memory(task: &ultask_core::Task, spec: &str, output: Option<&std::path::Path>) -> Result<()> {
    let fields = parse_spec(spec);
    let is_vma = fields.contains_key("vma");
    let is_disasm = fields.contains_key("disasm");

    let (base, buf) = if is_vma {
        let addr = parse_addr(fields.get("addr").ok_or_else(|| anyhow!("missing addr="))?)?;
        let vma = task.vma_at(addr).ok_or_else(|| anyhow!("no VMA contains {addr:#x}"))?;
        let size = (vma.end - vma.start).min(4096) as usize;
        let mut buf = vec![0u8; size];
        task.memcpy_from_task(vma.start, &mut buf)?;
        (vma.start, buf)
    } else {
        let addr = parse_addr(fields.get("addr").ok_or_else(|| anyhow!("missing addr="))?)?;
        let size: usize = fields
            .get("size")
            .map(|s| s.parse())
            .transpose()
            .map_err(|e| anyhow!("invalid size=: {e}"))?
            .unwrap_or(64);
        let mut buf = vec![0u8; size];
        task.memcpy_from_task(addr, &mut buf)?;
        if is_disasm {
            debug!("disassembly formatting is out of scope; rendering raw bytes");
        }
        (addr, buf)
    };

    match output {
        Some(path) => std::fs::write(path, &buf).with_context(|| format!("failed to write {}", path.display()))?,
        None => hex_dump(base, &buf),
    }
    Ok(())
}

fn hex_dump(base: u64, buf: &[u8]) {
    for (i, chunk) in buf.chunks(16).enumerate() {
        let offset = base + (i * 16) as u64;
        let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        println!("{offset:016x}  {}", hex.join(" "));
    }
}

/// Resolves an address field given directly (`addr_key`) or by name
/// (`name_key`), the latter looked up through the target's symbol index —
/// this is what lets `--jmp old_name=foo,new_name=bar` patch a function by
/// name instead of requiring the caller to look up addresses themselves.
fn resolve_site(task: &ultask_core::Task, fields: &HashMap<String, String>, addr_key: &str, name_key: &str) -> Result<u64> {
    if let Some(addr) = fields.get(addr_key) {
        return parse_addr(addr);
    }
    let name = fields
        .get(name_key)
        .ok_or_else(|| anyhow!("missing {addr_key}= or {name_key}="))?;
    task.resolve_symbol_addr(name)
        .ok_or_else(|| anyhow!("undefined symbol: {name}"))
}

fn install_jmp(task: &ultask_core::Task, spec: &str) -> Result<()> {
    let fields = parse_spec(spec);
    let from = resolve_site(task, &fields, "from", "old_name")?;
    let to = resolve_site(task, &fields, "to", "new_name")?;
    let kind = match fields.get("kind").map(String::as_str) {
        Some("nop") => RewriteKind::Nop,
        Some("ftrace") => RewriteKind::FtraceRedirect,
        _ => RewriteKind::DirectJump,
    };

    let saved = ultask_core::rewrite::install_rewrite(task, from, to, kind)
        .with_context(|| format!("failed to install rewrite at {from:#x}"))?;
    println!("installed {kind:?} at {:#x}, saved {} bytes", saved.addr, saved.original_bytes.len());
    Ok(())
}
