//! The patch loader (C5, §4.5): stages an ET_REL object into the target,
//! relocates it against the target's live symbol index, and installs it.

pub mod reloc;

use crate::arch::Arch;
use crate::elf::raw::{rela_sym, rela_type, RawElf};
use crate::error::{Result, UlpError};
use crate::target::Task;
use object::NativeEndian as E;
use object::elf::{SectionHeader64, SHF_ALLOC, SHT_RELA, SHT_SYMTAB, SHN_UNDEF};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::PathBuf;

/// `.upatch.info` metadata, when the patch object carries one (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpatchInfo {
    pub old_name: String,
    pub new_name: String,
    pub author: String,
}

/// A patch installed into a target's address space, enough to reverse it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadInfo {
    pub build_id: Option<String>,
    pub patch_base: u64,
    pub size: u64,
    pub source_path: PathBuf,
    pub tmpfile_path: PathBuf,
    /// Parsed `.upatch.info`, when the object carries one, so a caller can
    /// address the patched function by name (§4.5) instead of by address.
    pub upatch_info: Option<UpatchInfo>,
}

/// Loads a relocatable object into `task`'s address space (§4.5 steps 1-6).
/// `ro` drops `PROT_WRITE` and `noexec` drops `PROT_EXEC` from the final
/// mapping, applied with `mprotect` after relocation writes have landed.
pub fn load_patch(task: &mut Task, object_path: &std::path::Path, ro: bool, noexec: bool) -> Result<usize> {
    let data = std::fs::read(object_path).map_err(|e| crate::error::io_err(object_path, e))?;
    let raw = RawElf::parse(&data)?;
    if Arch::from_elf_machine(raw.e_machine()).map_err(|_| UlpError::WrongMachine(object_path.to_path_buf()))? != task.arch {
        return Err(UlpError::WrongMachine(object_path.to_path_buf()));
    }
    let upatch_info = read_upatch_info(&raw);

    let size = data.len() as u64;
    let map_files_dir = task.work_dir.join("map_files");
    let mut staged = tempfile::Builder::new()
        .prefix("patch-")
        .tempfile_in(&map_files_dir)
        .map_err(|e| crate::error::io_err(&map_files_dir, e))?;
    staged
        .write_all(&data)
        .map_err(|e| crate::error::io_err(staged.path(), e))?;
    let (_file, tmpfile_path) = staged
        .keep()
        .map_err(|e| crate::error::io_err(&map_files_dir, e.error))?;

    let patch_base = {
        let attach = task.attach()?;
        let fd = attach.task_open(&tmpfile_path, libc::O_RDWR, 0)?;
        attach.task_ftruncate(fd, size)?;
        let base = attach.task_mmap(
            0,
            size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE,
            fd,
            0,
        )?;
        attach.task_close(fd)?;
        base
    };

    resolve_and_relocate(task, &raw, patch_base)?;

    if ro || noexec {
        let mut prot = libc::PROT_READ;
        if !ro {
            prot |= libc::PROT_WRITE;
        }
        if !noexec {
            prot |= libc::PROT_EXEC;
        }
        let attach = task.attach()?;
        attach.task_mprotect(patch_base, size, prot)?;
    }

    let build_id = crate::elf::ElfFile::from_bytes(data.clone()).ok().and_then(|e| e.build_id());
    let info = LoadInfo {
        build_id,
        patch_base,
        size,
        source_path: object_path.to_path_buf(),
        tmpfile_path,
        upatch_info,
    };
    task.load_infos.push(info);
    persist_patches(task)?;
    Ok(task.load_infos.len() - 1)
}

/// Reverses [`load_patch`]: unmaps the patch and drops its bookkeeping.
pub fn delete_patch(task: &mut Task, index: usize) -> Result<()> {
    if index >= task.load_infos.len() {
        return Err(UlpError::Inconsistent(format!("no loaded patch at index {index}")));
    }
    let info = task.load_infos.remove(index);
    {
        let attach = task.attach()?;
        attach.task_munmap(info.patch_base, info.size)?;
    }
    let _ = std::fs::remove_file(&info.tmpfile_path);
    persist_patches(task)
}

fn persist_patches(task: &Task) -> Result<()> {
    let path = task.work_dir.join("patches.json");
    let json = serde_json::to_string_pretty(&task.load_infos)
        .map_err(|e| UlpError::Inconsistent(format!("failed to serialize patches.json: {e}")))?;
    std::fs::write(&path, json).map_err(|e| crate::error::io_err(&path, e))
}

fn section_name<'d>(raw: &RawElf<'d>, strtab: &SectionHeader64<E>, sh: &SectionHeader64<E>) -> &'d str {
    raw.section_name(strtab, sh).unwrap_or("")
}

fn resolve_and_relocate(task: &mut Task, raw: &RawElf<'_>, patch_base: u64) -> Result<()> {
    let sections = raw.sections()?;

    let symtab_idx = sections
        .iter()
        .position(|sh| sh.sh_type.get(E) == SHT_SYMTAB)
        .ok_or_else(|| UlpError::Inconsistent("patch object has no symbol table".into()))?;
    let symtab_sh = sections[symtab_idx];
    let strtab_idx = symtab_sh.sh_link.get(E) as usize;
    let strtab_sh = *sections
        .get(strtab_idx)
        .ok_or_else(|| UlpError::Inconsistent("patch object symtab has no linked strtab".into()))?;

    let symbols = raw.symbols(symtab_sh)?;

    // Step 4: resolve every undefined symbol against the target's live index,
    // and register every patch-defined symbol into the target's own index so
    // C6 can later address it by name (e.g. `--jmp old_name=...,new_name=...`).
    let mut resolved = vec![0u64; symbols.len()];
    for (i, sym) in symbols.iter().enumerate() {
        let shndx = sym.st_shndx.get(E);
        let name = raw.string_at(strtab_sh, sym.st_name.get(E)).unwrap_or("");
        if shndx == SHN_UNDEF as u16 {
            if name.is_empty() {
                continue;
            }
            let addr = task
                .resolve_symbol_addr(name)
                .ok_or_else(|| UlpError::UndefinedSymbol(name.to_string()))?;
            resolved[i] = addr;
        } else {
            // Patch-local symbol: its live address is the patch mapping plus
            // the defining section's file offset plus the symbol's value.
            let sec = sections.get(shndx as usize);
            let sec_off = sec.map(|s| s.sh_offset.get(E)).unwrap_or(0);
            resolved[i] = patch_base + sec_off + sym.st_value.get(E);
            if !name.is_empty() {
                task.register_patch_symbol(name.to_string(), resolved[i]);
            }
        }
    }

    // Step 4.5: GOTPCREL needs a GOT slot synthesized in the target before any
    // relocation write lands, since the patch object carries no GOT of its
    // own. One slot per distinct referenced symbol, allocated in a single
    // remote mmap.
    let mut got_syms = BTreeSet::new();
    for sh in sections.iter() {
        if sh.sh_type.get(E) != SHT_RELA {
            continue;
        }
        let target_idx = sh.sh_info.get(E) as usize;
        if sections.get(target_idx).map(|s| s.sh_flags.get(E) & SHF_ALLOC as u64 != 0) != Some(true) {
            continue;
        }
        if task.arch != Arch::X86_64 {
            continue;
        }
        for rela in raw.relas(*sh)? {
            if reloc::is_gotpcrel(rela_type(rela)) {
                got_syms.insert(rela_sym(rela));
            }
        }
    }

    let mut got_slots: BTreeMap<u32, u64> = BTreeMap::new();
    if !got_syms.is_empty() {
        let got_base = {
            let attach = task.attach()?;
            attach.task_malloc((got_syms.len() * 8) as u64)?
        };
        for (i, sym_idx) in got_syms.iter().enumerate() {
            let addr = got_base + (i as u64) * 8;
            let sym_val = resolved.get(*sym_idx as usize).copied().ok_or_else(|| {
                UlpError::Inconsistent(format!("GOTPCREL relocation references out-of-range symbol {sym_idx}"))
            })?;
            task.memcpy_to_task(addr, &sym_val.to_le_bytes())?;
            got_slots.insert(*sym_idx, addr);
        }
    }

    // Step 5: apply every SHT_RELA section targeting an allocated section.
    for sh in sections.iter() {
        if sh.sh_type.get(E) != SHT_RELA {
            continue;
        }
        let target_idx = sh.sh_info.get(E) as usize;
        let Some(target_sh) = sections.get(target_idx) else {
            continue;
        };
        if target_sh.sh_flags.get(E) & SHF_ALLOC as u64 == 0 {
            continue;
        }
        let relas = raw.relas(*sh)?;
        for rela in relas {
            let sym_idx = rela_sym(rela) as usize;
            let r_type = rela_type(rela);
            let sym_val = resolved
                .get(sym_idx)
                .copied()
                .ok_or_else(|| UlpError::Inconsistent(format!("relocation references out-of-range symbol {sym_idx}")))?;
            let r_offset = rela.r_offset.get(E);
            let addend = rela.r_addend.get(E);
            let loc = patch_base + target_sh.sh_offset.get(E) + r_offset;

            let bytes = match task.arch {
                Arch::X86_64 => {
                    let got_addr = got_slots.get(&(sym_idx as u32)).copied();
                    reloc::apply_x86_64(r_type, loc, sym_val, addend, got_addr)?
                }
                Arch::AArch64 => {
                    let mut insn_buf = [0u8; 4];
                    task.memcpy_from_task(loc, &mut insn_buf)?;
                    let insn = u32::from_le_bytes(insn_buf);
                    reloc::apply_aarch64(r_type, loc, sym_val, addend, insn)?
                }
            };
            task.memcpy_to_task(loc, &bytes)?;
        }
    }

    Ok(())
}

/// Parses the optional `.upatch.info` / `.upatch.strtab` sections (§4.5),
/// surfaced so C6 can address a patched function by name.
pub fn read_upatch_info(raw: &RawElf<'_>) -> Option<UpatchInfo> {
    let sections = raw.sections().ok()?;
    let shstrtab_idx = raw.header().e_shstrndx.get(E) as usize;
    let shstrtab = *sections.get(shstrtab_idx)?;

    let info_sh = sections
        .iter()
        .find(|sh| section_name(raw, shstrtab, sh) == ".upatch.info")?;
    let strtab_sh = sections
        .iter()
        .find(|sh| section_name(raw, shstrtab, sh) == ".upatch.strtab")?;

    let bytes = raw.section_bytes(info_sh);
    if bytes.len() < 12 {
        return None;
    }
    let old_off = u32::from_ne_bytes(bytes[0..4].try_into().ok()?);
    let new_off = u32::from_ne_bytes(bytes[4..8].try_into().ok()?);
    let author_off = u32::from_ne_bytes(bytes[8..12].try_into().ok()?);

    let str_bytes = raw.section_bytes(strtab_sh);
    let read = |off: u32| -> String {
        let off = off as usize;
        if off >= str_bytes.len() {
            return String::new();
        }
        let end = str_bytes[off..].iter().position(|&b| b == 0).map(|p| p + off).unwrap_or(str_bytes.len());
        String::from_utf8_lossy(&str_bytes[off..end]).into_owned()
    };

    Some(UpatchInfo {
        old_name: read(old_off),
        new_name: read(new_off),
        author: read(author_off),
    })
}
