//! Raw ELF section/symbol/relocation access for the patch loader (C5).
//!
//! `object::File`'s high-level `Object` trait (used by [`super::ElfFile`])
//! resolves symbols and segments for us, but applying relocations needs the
//! *raw* section table — `sh_info`/`sh_link`, exact file offsets, and the
//! untouched `Rela64` records — so this submodule reads the ELF structures
//! directly via `object::elf`'s zero-copy POD types instead.

use crate::error::{Result, UlpError};
use object::NativeEndian as E;
use object::elf::{FileHeader64, Rela64, SectionHeader64, Sym64};
use object::pod::{from_bytes, slice_from_bytes};
use std::path::PathBuf;

pub struct RawElf<'d> {
    data: &'d [u8],
    header: &'d FileHeader64<E>,
}

impl<'d> RawElf<'d> {
    pub fn parse(data: &'d [u8]) -> Result<Self> {
        if data.len() < 20 || &data[0..4] != b"\x7fELF" {
            return Err(UlpError::NotElf(PathBuf::new()));
        }
        let (header, _) = from_bytes::<FileHeader64<E>>(data)
            .map_err(|_| UlpError::NotElf(PathBuf::new()))?;
        Ok(RawElf { data, header })
    }

    pub fn header(&self) -> &'d FileHeader64<E> {
        self.header
    }

    pub fn e_type(&self) -> u16 {
        self.header.e_type.get(E)
    }

    pub fn e_machine(&self) -> u16 {
        self.header.e_machine.get(E)
    }

    pub fn sections(&self) -> Result<Vec<&'d SectionHeader64<E>>> {
        let off = self.header.e_shoff.get(E) as usize;
        let count = self.header.e_shnum.get(E) as usize;
        if count == 0 {
            return Ok(Vec::new());
        }
        let (slice, _) = slice_from_bytes::<SectionHeader64<E>>(&self.data[off..], count)
            .map_err(|_| UlpError::NotElf(PathBuf::new()))?;
        Ok(slice.iter().collect())
    }

    pub fn section_bytes(&self, sh: &SectionHeader64<E>) -> &'d [u8] {
        let off = sh.sh_offset.get(E) as usize;
        let size = sh.sh_size.get(E) as usize;
        &self.data[off..off + size]
    }

    pub fn section_name<'a>(&self, strtab: &'a SectionHeader64<E>, sh: &SectionHeader64<E>) -> Option<&'d str> {
        self.string_at(strtab, sh.sh_name.get(E))
    }

    pub fn string_at(&self, strtab: &SectionHeader64<E>, offset: u32) -> Option<&'d str> {
        let bytes = self.section_bytes(strtab);
        let start = offset as usize;
        if start >= bytes.len() {
            return None;
        }
        let end = bytes[start..].iter().position(|&b| b == 0)? + start;
        std::str::from_utf8(&bytes[start..end]).ok()
    }

    pub fn symbols(&self, symtab: &SectionHeader64<E>) -> Result<&'d [Sym64<E>]> {
        let bytes = self.section_bytes(symtab);
        let count = bytes.len() / std::mem::size_of::<Sym64<E>>();
        let (slice, _) =
            slice_from_bytes::<Sym64<E>>(bytes, count).map_err(|_| UlpError::NotElf(PathBuf::new()))?;
        Ok(slice)
    }

    pub fn relas(&self, rela_section: &SectionHeader64<E>) -> Result<&'d [Rela64<E>]> {
        let bytes = self.section_bytes(rela_section);
        let count = bytes.len() / std::mem::size_of::<Rela64<E>>();
        let (slice, _) =
            slice_from_bytes::<Rela64<E>>(bytes, count).map_err(|_| UlpError::NotElf(PathBuf::new()))?;
        Ok(slice)
    }
}

pub fn rela_sym(rela: &Rela64<E>) -> u32 {
    (rela.r_info.get(E) >> 32) as u32
}

pub fn rela_type(rela: &Rela64<E>) -> u32 {
    (rela.r_info.get(E) & 0xffff_ffff) as u32
}

pub fn sym_bind(sym: &Sym64<E>) -> u8 {
    sym.st_info >> 4
}

pub fn sym_type(sym: &Sym64<E>) -> u8 {
    sym.st_info & 0xf
}
