//! The VMA model (§3, §4.3).

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaType {
    Self_,
    Libc,
    LibElf,
    Heap,
    Ld,
    Stack,
    Vvar,
    Vdso,
    Vsyscall,
    OtherLib,
    Anon,
    None,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
    pub shared: bool,
}

impl Perms {
    pub fn parse(s: &str) -> Self {
        let bytes = s.as_bytes();
        Perms {
            read: bytes.first() == Some(&b'r'),
            write: bytes.get(1) == Some(&b'w'),
            exec: bytes.get(2) == Some(&b'x'),
            shared: bytes.get(3) == Some(&b's'),
        }
    }
}

/// A parsed ELF header + program headers peeked from a live VMA (§4.3 "Peek ELF").
#[derive(Debug, Clone)]
pub struct ElfPeek {
    pub e_type: u16,
    pub phdrs: Vec<ProgramHeaderPeek>,
    pub load_offset: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramHeaderPeek {
    pub p_type: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

#[derive(Debug, Clone)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub perms: Perms,
    pub file_offset: u64,
    /// `p_vaddr` of the PT_LOAD that produced this particular mapping; `None`
    /// until `update_task_vmas` walks the leader's program headers.
    pub file_voffset: Option<u64>,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    pub pathname: Option<PathBuf>,
    pub vma_type: VmaType,
    pub is_elf: bool,
    pub is_shared_lib: bool,
    pub elf_peek: Option<ElfPeek>,
    /// Index, into the owning task's VMA arena, of this file's leader VMA
    /// (the first, lowest-address mapping of the same path). `None` for
    /// anonymous VMAs or the leader itself.
    pub leader: Option<usize>,
    /// Populated only on a leader: indices of the other mappings of the same file.
    pub siblings: Vec<usize>,
}

impl Vma {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn basename(&self) -> Option<&str> {
        self.pathname.as_deref().and_then(Path::file_name).and_then(|n| n.to_str())
    }
}

/// Classifies a VMA from its `/proc/PID/maps` pathname field, per §4.3.
pub fn classify(pathname: Option<&str>, self_exe: &Path) -> VmaType {
    let Some(path) = pathname else {
        return VmaType::Anon;
    };

    match path {
        "[heap]" => return VmaType::Heap,
        "[stack]" | "[stack:tid]" => return VmaType::Stack,
        "[vdso]" => return VmaType::Vdso,
        "[vvar]" => return VmaType::Vvar,
        "[vsyscall]" => return VmaType::Vsyscall,
        _ => {}
    }
    if path.starts_with('[') {
        return VmaType::None;
    }

    if Path::new(path) == self_exe {
        return VmaType::Self_;
    }

    let basename = Path::new(path).file_name().and_then(|n| n.to_str()).unwrap_or("");
    if is_libc_basename(basename) {
        return VmaType::Libc;
    }
    if is_ld_basename(basename) {
        return VmaType::Ld;
    }
    if path.ends_with(".so") || basename.contains(".so.") {
        return VmaType::OtherLib;
    }
    VmaType::LibElf
}

fn is_libc_basename(basename: &str) -> bool {
    basename.starts_with("libc.so") || basename.starts_with("libc-")
}

fn is_ld_basename(basename: &str) -> bool {
    basename.starts_with("ld-linux") || basename.starts_with("ld-")
}

/// Libraries that legitimately carry `PT_INTERP` yet are still libraries
/// (§4.3: "interp-exceptions"), matched by basename prefix.
pub fn is_interp_exception(basename: &str) -> bool {
    is_libc_basename(basename)
        || basename.starts_with("libpthread")
        || basename.starts_with("libdl")
        || basename.starts_with("libssp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_pseudo_paths() {
        let exe = Path::new("/usr/bin/demo");
        assert_eq!(classify(Some("[heap]"), exe), VmaType::Heap);
        assert_eq!(classify(Some("[stack]"), exe), VmaType::Stack);
        assert_eq!(classify(Some("[vdso]"), exe), VmaType::Vdso);
        assert_eq!(classify(None, exe), VmaType::Anon);
    }

    #[test]
    fn classifies_libc_and_ld() {
        let exe = Path::new("/usr/bin/demo");
        assert_eq!(
            classify(Some("/lib/x86_64-linux-gnu/libc.so.6"), exe),
            VmaType::Libc
        );
        assert_eq!(
            classify(Some("/lib64/ld-linux-x86-64.so.2"), exe),
            VmaType::Ld
        );
    }

    #[test]
    fn classifies_self_exe() {
        let exe = Path::new("/usr/bin/demo");
        assert_eq!(classify(Some("/usr/bin/demo"), exe), VmaType::Self_);
    }

    #[test]
    fn interp_exceptions_cover_expected_libraries() {
        assert!(is_interp_exception("libc.so.6"));
        assert!(is_interp_exception("libpthread.so.0"));
        assert!(!is_interp_exception("libfoo.so.1"));
    }
}
