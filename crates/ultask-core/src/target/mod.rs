//! The target-process model (C3, §4.3): opening a live PID, building its VMA
//! map and symbol index, and resolving symbol addresses.

pub mod symbol;
pub mod vma;

use crate::arch::Arch;
use crate::elf::ElfFile;
use crate::error::{Result, UlpError};
use crate::patch::LoadInfo;
use crate::remote::AttachGuard;
use procfs::process::{MMapPath, Process};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use symbol::TargetSymbol;
use vma::{ElfPeek, ProgramHeaderPeek, Vma, VmaType};

bitflags::bitflags! {
    /// `FTO_*` flags from the distilled spec's `open_task(pid, flags)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FtoFlags: u32 {
        /// Peek each leader VMA's ELF header and program headers.
        const VMA_ELF = 0b0001;
        /// Additionally load defined/dynamic symbols into the symbol index.
        const VMA_ELF_SYMBOLS = 0b0011;
    }
}

/// A live process under patch-engine control (§3 "Task").
#[derive(Debug)]
pub struct Task {
    pub pid: i32,
    pub comm: String,
    pub exe_path: PathBuf,
    mem_file: File,
    pub vmas: Vec<Vma>,
    /// Non-overlapping `[start, end)` ranges keyed by `start`, mirroring the
    /// distilled spec's interval tree: a sorted map gives O(log n) gap/point
    /// queries without a bespoke tree structure.
    vma_index: BTreeMap<u64, usize>,
    pub self_elf: Option<ElfFile>,
    pub libc_elf: Option<ElfFile>,
    pub libc_vma: usize,
    pub stack_vma: usize,
    symbols: BTreeMap<String, Vec<TargetSymbol>>,
    /// Symbols defined by a loaded patch, keyed by name to an already-live
    /// absolute address (the patch mapping isn't tracked as a VMA, so these
    /// bypass `symbol::resolve`'s leader/sibling lookup entirely).
    patch_symbols: BTreeMap<String, u64>,
    pub fto_flags: FtoFlags,
    pub arch: Arch,
    pub work_dir: PathBuf,
    pub load_infos: Vec<LoadInfo>,
    lock_file: Option<File>,
}

impl Task {
    /// Opens a live PID (§4.3 "Open"), failing if libc or the stack VMA are absent.
    pub fn open(pid: i32, flags: FtoFlags, root_dir: &Path) -> Result<Self> {
        let proc = Process::new(pid).map_err(|_| UlpError::NoSuchPid(pid))?;

        let mem_path = format!("/proc/{pid}/mem");
        let mem_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&mem_path)
            .map_err(|e| crate::error::io_err(&mem_path, e))?;

        let comm = proc
            .stat()
            .map(|s| s.comm)
            .unwrap_or_else(|_| "<unknown>".to_string());
        let exe_path = proc.exe().unwrap_or_default();

        let maps = proc
            .maps()
            .map_err(|_| UlpError::PermissionDenied(format!("/proc/{pid}/maps")))?;

        let mut vmas = Vec::new();
        let mut by_path: BTreeMap<PathBuf, usize> = BTreeMap::new();
        for map in maps.iter() {
            let pathname = match &map.pathname {
                MMapPath::Path(p) => Some(p.clone()),
                _ => None,
            };
            let pseudo = pseudo_path(&map.pathname);
            let classify_path = pathname.clone().or_else(|| pseudo.clone());
            let vma_type = vma::classify(
                classify_path.as_ref().and_then(|p| p.to_str()),
                &exe_path,
            );

            let (start, end) = map.address;
            let idx = vmas.len();
            let mut v = Vma {
                start,
                end,
                perms: vma::Perms {
                    read: map.perms.contains(procfs::process::MMPermissions::READ),
                    write: map.perms.contains(procfs::process::MMPermissions::WRITE),
                    exec: map.perms.contains(procfs::process::MMPermissions::EXECUTE),
                    shared: map.perms.contains(procfs::process::MMPermissions::SHARED),
                },
                file_offset: map.offset,
                file_voffset: None,
                dev_major: map.dev.0 as u32,
                dev_minor: map.dev.1 as u32,
                inode: map.inode,
                pathname: pathname.clone(),
                vma_type,
                is_elf: false,
                is_shared_lib: false,
                elf_peek: None,
                leader: None,
                siblings: Vec::new(),
            };

            if let Some(path) = &pathname {
                if let Some(&leader_idx) = by_path.get(path) {
                    v.leader = Some(leader_idx);
                    vmas.push(v);
                    vmas[leader_idx].siblings.push(idx);
                } else {
                    by_path.insert(path.clone(), idx);
                    vmas.push(v);
                }
            } else {
                vmas.push(v);
            }
        }

        let vma_index: BTreeMap<u64, usize> = vmas.iter().enumerate().map(|(i, v)| (v.start, i)).collect();

        let libc_vma = vmas
            .iter()
            .position(|v| v.vma_type == VmaType::Libc)
            .ok_or(UlpError::MissingLibc)?;
        let stack_vma = vmas
            .iter()
            .position(|v| v.vma_type == VmaType::Stack)
            .ok_or(UlpError::MissingStack)?;

        if proc.tasks().map(|t| t.count()).unwrap_or(1) > 1 {
            log::warn!("pid {pid} has more than one thread; only the leader is ptrace-attached");
        }

        let work_dir = root_dir.join(pid.to_string());
        std::fs::create_dir_all(work_dir.join("map_files")).map_err(|e| crate::error::io_err(&work_dir, e))?;
        std::fs::write(work_dir.join("comm"), &comm).map_err(|e| crate::error::io_err(&work_dir, e))?;

        let lock_path = work_dir.join(".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| crate::error::io_err(&lock_path, e))?;
        lock_exclusive(&lock_file, pid)?;

        let mut task = Task {
            pid,
            comm,
            exe_path,
            mem_file,
            vmas,
            vma_index,
            self_elf: None,
            libc_elf: None,
            libc_vma,
            stack_vma,
            symbols: BTreeMap::new(),
            patch_symbols: BTreeMap::new(),
            fto_flags: flags,
            arch: Arch::current(),
            work_dir,
            load_infos: Vec::new(),
            lock_file: Some(lock_file),
        };

        if flags.contains(FtoFlags::VMA_ELF) {
            task.update_task_vmas()?;
        }

        Ok(task)
    }

    /// Peeks ELF headers (and, if requested, symbols) for every leader VMA (§4.3).
    pub fn update_task_vmas(&mut self) -> Result<()> {
        let leader_indices: Vec<usize> = (0..self.vmas.len())
            .filter(|&i| self.vmas[i].leader.is_none())
            .collect();

        for idx in leader_indices {
            let vma_type = self.vmas[idx].vma_type;
            if matches!(vma_type, VmaType::Stack | VmaType::Vvar | VmaType::Vsyscall | VmaType::Anon) {
                continue;
            }
            self.peek_elf(idx)?;
        }

        if self.fto_flags.contains(FtoFlags::VMA_ELF_SYMBOLS) {
            self.load_symbols()?;
        }
        Ok(())
    }

    fn peek_elf(&mut self, idx: usize) -> Result<()> {
        let start = self.vmas[idx].start;
        let header_size = std::mem::size_of::<object::elf::FileHeader64<object::NativeEndian>>();
        let mut buf = vec![0u8; header_size];
        if self.memcpy_from_task(start, &mut buf).is_err() {
            return Ok(());
        }
        if buf.len() < 20 || &buf[0..4] != b"\x7fELF" {
            return Ok(());
        }

        let raw = match crate::elf::raw::RawElf::parse(&buf) {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };
        let e_type = raw.e_type();
        let e_phoff = raw.header().e_phoff.get(object::NativeEndian);
        let e_phnum = raw.header().e_phnum.get(object::NativeEndian) as usize;
        let e_phentsize = raw.header().e_phentsize.get(object::NativeEndian) as usize;
        if e_phnum == 0 {
            return Ok(());
        }

        let mut phdr_buf = vec![0u8; e_phentsize * e_phnum];
        self.memcpy_from_task(start + e_phoff, &mut phdr_buf)?;

        let mut phdrs = Vec::with_capacity(e_phnum);
        for i in 0..e_phnum {
            let chunk = &phdr_buf[i * e_phentsize..i * e_phentsize + e_phentsize];
            phdrs.push(ProgramHeaderPeek {
                p_type: u32::from_ne_bytes(chunk[0..4].try_into().unwrap()),
                p_offset: u64::from_ne_bytes(chunk[8..16].try_into().unwrap()),
                p_vaddr: u64::from_ne_bytes(chunk[16..24].try_into().unwrap()),
                p_filesz: u64::from_ne_bytes(chunk[32..40].try_into().unwrap()),
                p_memsz: u64::from_ne_bytes(chunk[40..48].try_into().unwrap()),
                p_align: u64::from_ne_bytes(chunk[48..56].try_into().unwrap()),
            });
        }

        const PT_LOAD: u32 = object::elf::PT_LOAD;
        const PT_INTERP: u32 = object::elf::PT_INTERP;
        let min_vaddr = phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .map(|p| p.p_vaddr)
            .min()
            .unwrap_or(0);
        let load_offset = start as i64 - min_vaddr as i64;

        let has_interp = phdrs.iter().any(|p| p.p_type == PT_INTERP);
        let basename = self.vmas[idx].basename().unwrap_or("").to_string();
        let is_shared_lib =
            e_type == object::elf::ET_DYN as u16 && (!has_interp || vma::is_interp_exception(&basename));

        self.vmas[idx].is_elf = true;
        self.vmas[idx].is_shared_lib = is_shared_lib;
        self.vmas[idx].elf_peek = Some(ElfPeek {
            e_type,
            phdrs: phdrs.clone(),
            load_offset,
        });

        let sibling_indices = self.vmas[idx].siblings.clone();
        for sib_idx in sibling_indices {
            let file_offset = self.vmas[sib_idx].file_offset;
            for p in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
                let align = p.p_align.max(1);
                if align_down(p.p_offset, align) == file_offset {
                    self.vmas[sib_idx].file_voffset = Some(p.p_vaddr);
                    break;
                }
            }
        }
        // The leader's own `file_voffset` is the PT_LOAD matching its own file offset.
        let leader_offset = self.vmas[idx].file_offset;
        for p in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
            let align = p.p_align.max(1);
            if align_down(p.p_offset, align) == leader_offset {
                self.vmas[idx].file_voffset = Some(p.p_vaddr);
                break;
            }
        }

        Ok(())
    }

    fn load_symbols(&mut self) -> Result<()> {
        // Self-VMA: import every defined symbol from the on-disk ELF.
        let self_idx = self.vmas.iter().position(|v| v.vma_type == VmaType::Self_);
        if let Some(idx) = self_idx {
            if let Ok(elf) = ElfFile::open(&self.exe_path) {
                for sym in elf.symbols() {
                    if sym.is_undefined || sym.name.is_empty() {
                        continue;
                    }
                    self.insert_symbol(TargetSymbol {
                        name: sym.name,
                        st_value: sym.value,
                        st_size: sym.size,
                        st_info: 0,
                        st_shndx: 1,
                        leader: idx,
                    });
                }
                self.self_elf = Some(elf);
            }
        }

        let leader_indices: Vec<usize> = (0..self.vmas.len())
            .filter(|&i| self.vmas[i].leader.is_none() && i != self_idx.unwrap_or(usize::MAX))
            .filter(|&i| self.vmas[i].elf_peek.is_some())
            .collect();

        for idx in leader_indices {
            if let Err(e) = self.load_dynamic_symbols(idx) {
                log::debug!("failed to load dynamic symbols for VMA {idx}: {e}");
            }
        }

        Ok(())
    }

    fn load_dynamic_symbols(&mut self, idx: usize) -> Result<()> {
        let peek = self.vmas[idx].elf_peek.clone().ok_or(UlpError::MissingLibc)?;
        let start = self.vmas[idx].start;
        let load_offset = peek.load_offset;
        const PT_DYNAMIC: u32 = object::elf::PT_DYNAMIC;
        let Some(dyn_phdr) = peek.phdrs.iter().find(|p| p.p_type == PT_DYNAMIC) else {
            return Ok(());
        };

        let dyn_addr = (dyn_phdr.p_vaddr as i64 + load_offset) as u64;
        let dyn_count = (dyn_phdr.p_memsz / 16) as usize;
        let mut dyn_buf = vec![0u8; dyn_count * 16];
        self.memcpy_from_task(dyn_addr, &mut dyn_buf)?;

        let mut symtab_addr = None;
        let mut strtab_addr = None;
        let mut strsz = None;
        let mut syment = None;
        for chunk in dyn_buf.chunks_exact(16) {
            let tag = i64::from_ne_bytes(chunk[0..8].try_into().unwrap());
            let val = u64::from_ne_bytes(chunk[8..16].try_into().unwrap());
            match tag as u32 {
                object::elf::DT_SYMTAB => symtab_addr = Some(val),
                object::elf::DT_STRTAB => strtab_addr = Some(val),
                object::elf::DT_STRSZ => strsz = Some(val),
                object::elf::DT_SYMENT => syment = Some(val),
                _ => {}
            }
        }
        let (Some(mut symtab_addr), Some(strtab_addr), Some(strsz_val), Some(syment)) =
            (symtab_addr, strtab_addr, strsz, syment)
        else {
            return Ok(());
        };
        if syment as usize != std::mem::size_of::<object::elf::Sym64<object::NativeEndian>>() {
            return Ok(());
        }

        // vdso's DYNAMIC addresses are link-time; the live symtab/strtab
        // addresses need the VMA's load offset added first (§4.3).
        if self.vmas[idx].vma_type == VmaType::Vdso {
            symtab_addr = (symtab_addr as i64 + load_offset) as u64;
        }

        // §9 Open Question: the symbol-table size is inferred from the gap
        // to the string table, a common-but-fragile Linux layout assumption.
        if strtab_addr <= symtab_addr {
            return Ok(());
        }
        let symtab_sz = strtab_addr - symtab_addr;
        let mut sym_buf = vec![0u8; symtab_sz as usize];
        self.memcpy_from_task(symtab_addr, &mut sym_buf)?;
        let mut str_buf = vec![0u8; 65536.min(strsz_val as usize).max(1)];
        let _ = self.memcpy_from_task(strtab_addr, &mut str_buf);

        let count = sym_buf.len() / syment as usize;
        for i in 0..count {
            let chunk = &sym_buf[i * syment as usize..i * syment as usize + syment as usize];
            let st_name = u32::from_ne_bytes(chunk[0..4].try_into().unwrap());
            let st_info = chunk[4];
            let st_shndx = u16::from_ne_bytes(chunk[6..8].try_into().unwrap());
            let st_value = u64::from_ne_bytes(chunk[8..16].try_into().unwrap());
            let st_size = u64::from_ne_bytes(chunk[16..24].try_into().unwrap());

            if st_shndx == 0 {
                continue; // SHN_UNDEF
            }
            let name = read_cstr(&str_buf, st_name as usize);
            let Some(name) = name else { continue };
            if name.is_empty() {
                continue;
            }

            self.insert_symbol(TargetSymbol {
                name,
                st_value,
                st_size,
                st_info,
                st_shndx,
                leader: idx,
            });
        }

        let _ = start;
        Ok(())
    }

    fn insert_symbol(&mut self, sym: TargetSymbol) {
        // First writer wins (§4.3); log duplicates at debug.
        let entry = self.symbols.entry(sym.name.clone()).or_default();
        if entry.is_empty() {
            entry.push(sym);
        } else {
            log::debug!("duplicate symbol '{}' ignored", sym.name);
        }
    }

    /// Looks up a symbol by name and resolves its live address (§3). Patch-
    /// defined symbols (§4.5's `.upatch.info` name lookup) take priority,
    /// since a patch is expected to shadow the function it replaces.
    pub fn resolve_symbol_addr(&self, name: &str) -> Option<u64> {
        if let Some(&addr) = self.patch_symbols.get(name) {
            return Some(addr);
        }
        let sym = self.symbols.get(name)?.first()?;
        symbol::resolve(sym, &self.vmas)
    }

    /// Registers a symbol defined by a loaded patch at its already-resolved
    /// live address, so later callers can reach it by name (§4.5, C6).
    pub fn register_patch_symbol(&mut self, name: String, addr: u64) {
        if self.patch_symbols.insert(name.clone(), addr).is_some() {
            log::debug!("duplicate patch symbol '{name}' overwritten");
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &TargetSymbol> {
        self.symbols.values().flat_map(|v| v.iter())
    }

    /// Span search (§4.3): end of the first VMA followed by a gap `>= size`, else 0.
    pub fn find_vma_span_area(&self, size: u64) -> u64 {
        let mut sorted: Vec<&Vma> = self.vmas.iter().collect();
        sorted.sort_by_key(|v| v.start);
        for pair in sorted.windows(2) {
            let gap = pair[1].start.saturating_sub(pair[0].end);
            if gap >= size {
                return pair[0].end;
            }
        }
        0
    }

    pub fn vma_at(&self, addr: u64) -> Option<&Vma> {
        self.vma_index
            .range(..=addr)
            .next_back()
            .map(|(_, &idx)| &self.vmas[idx])
            .filter(|v| v.contains(addr))
    }

    pub fn memcpy_from_task(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.mem_file
            .read_exact_at(buf, addr)
            .map_err(|e| crate::error::io_err(format!("/proc/{}/mem", self.pid), e))
    }

    pub fn memcpy_to_task(&self, addr: u64, buf: &[u8]) -> Result<()> {
        self.mem_file
            .write_all_at(buf, addr)
            .map_err(|e| crate::error::io_err(format!("/proc/{}/mem", self.pid), e))
    }

    pub fn attach(&self) -> Result<AttachGuard<'_>> {
        AttachGuard::new(self)
    }

    /// Start of libc's executable mapping, used as the scratch trampoline
    /// site for remote syscalls (§4.4): a few bytes of libc's text are
    /// saved, patched with the architecture's syscall instruction, and
    /// restored afterward. The syscall instruction must land on an `x`
    /// page, so this walks the leader's siblings rather than assuming the
    /// leader itself (usually the read-only first segment) is executable.
    pub fn libc_base(&self) -> u64 {
        let leader = &self.vmas[self.libc_vma];
        if leader.perms.exec {
            return leader.start;
        }
        leader
            .siblings
            .iter()
            .filter_map(|&i| self.vmas.get(i))
            .find(|v| v.perms.exec)
            .map(|v| v.start)
            .unwrap_or(leader.start)
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(lock) = self.lock_file.take() {
            let _ = unlock(&lock);
        }
        // Work-directory teardown: remove any files this run created under
        // ROOT_DIR/PID, leaving a clean tree for the round-trip invariant in §8.
        let _ = std::fs::remove_file(self.work_dir.join(".lock"));
        let _ = std::fs::remove_dir_all(&self.work_dir);
    }
}

fn pseudo_path(p: &MMapPath) -> Option<PathBuf> {
    match p {
        MMapPath::Heap => Some("[heap]".into()),
        MMapPath::Stack => Some("[stack]".into()),
        MMapPath::Vdso => Some("[vdso]".into()),
        MMapPath::Vvar => Some("[vvar]".into()),
        MMapPath::Vsyscall => Some("[vsyscall]".into()),
        MMapPath::TStack(_) => Some("[stack:tid]".into()),
        _ => None,
    }
}

fn align_down(value: u64, align: u64) -> u64 {
    if align == 0 { value } else { value & !(align - 1) }
}

fn read_cstr(buf: &[u8], offset: usize) -> Option<String> {
    if offset >= buf.len() {
        return None;
    }
    let end = buf[offset..].iter().position(|&b| b == 0)? + offset;
    Some(String::from_utf8_lossy(&buf[offset..end]).into_owned())
}

fn lock_exclusive(file: &File, pid: i32) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        return Err(UlpError::PermissionDenied(format!(
            "another controller already holds the work-directory lock for pid {pid}"
        )));
    }
    Ok(())
}

fn unlock(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vma::{Perms, VmaType};

    fn vma(start: u64, end: u64) -> Vma {
        Vma {
            start,
            end,
            perms: Perms::default(),
            file_offset: 0,
            file_voffset: None,
            dev_major: 0,
            dev_minor: 0,
            inode: 0,
            pathname: None,
            vma_type: VmaType::Anon,
            is_elf: false,
            is_shared_lib: false,
            elf_peek: None,
            leader: None,
            siblings: Vec::new(),
        }
    }

    fn span_search(vmas: &[Vma], size: u64) -> u64 {
        let mut sorted: Vec<&Vma> = vmas.iter().collect();
        sorted.sort_by_key(|v| v.start);
        for pair in sorted.windows(2) {
            let gap = pair[1].start.saturating_sub(pair[0].end);
            if gap >= size {
                return pair[0].end;
            }
        }
        0
    }

    #[test]
    fn span_search_single_gap() {
        let vmas = vec![vma(0x400000, 0x401000), vma(0x500000, 0x501000)];
        assert_eq!(span_search(&vmas, 0x80000), 0x401000);
        assert_eq!(span_search(&vmas, 0x200000), 0);
    }
}
