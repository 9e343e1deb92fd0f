//! ELF reading (§4.2), built on the `object` crate's zero-copy reader — the
//! same crate the teacher stack already leans on for its own ELF/build-id
//! introspection (see `elf_helper.rs`, `perf_map.rs`, `unwind_data.rs`).

pub mod raw;

use crate::error::{Result, UlpError};
use object::{Object, ObjectSymbol, ObjectSymbolTable};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
    Other,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
    pub kind: SymbolKind,
    pub is_undefined: bool,
    pub is_global: bool,
}

/// A read-only, memory-resident view of an ELF file — on disk or peeked out
/// of a live process's address space.
#[derive(Debug)]
pub struct ElfFile {
    path: Option<PathBuf>,
    data: Vec<u8>,
}

impl ElfFile {
    /// Opens and validates an on-disk ELF file (§4.2: `NotElf`/`WrongClass`/`WrongMachine`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| crate::error::io_err(path, e))?;
        let file = Self {
            path: Some(path.to_path_buf()),
            data,
        };
        file.validate()?;
        Ok(file)
    }

    /// Validates bytes peeked out of a remote process's memory.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let file = Self { path: None, data };
        file.validate()?;
        Ok(file)
    }

    fn path_for_errors(&self) -> PathBuf {
        self.path.clone().unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        if self.data.len() < 20 || &self.data[0..4] != b"\x7fELF" {
            return Err(UlpError::NotElf(self.path_for_errors()));
        }
        if self.data[4] != 2 {
            // ELFCLASS64
            return Err(UlpError::WrongClass(self.path_for_errors()));
        }
        let object = object::File::parse(&*self.data).map_err(|_| UlpError::NotElf(self.path_for_errors()))?;
        match object.architecture() {
            object::Architecture::X86_64 | object::Architecture::Aarch64 => Ok(()),
            _ => Err(UlpError::WrongMachine(self.path_for_errors())),
        }
    }

    fn object(&self) -> object::File<'_> {
        // `validate` already proved this parses; unwrap is safe here and
        // avoids threading a parse error through every accessor.
        object::File::parse(&*self.data).expect("validated at construction")
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Yields every symbol-table entry, static and dynamic.
    pub fn symbols(&self) -> Vec<Symbol> {
        let object = self.object();
        let mut out = Vec::new();
        if let Some(table) = object.symbol_table() {
            out.extend(table.symbols().filter_map(symbol_from_object));
        }
        if let Some(table) = object.dynamic_symbol_table() {
            out.extend(table.symbols().filter_map(symbol_from_object));
        }
        out
    }

    pub fn find_symbol(&self, name: &str) -> Option<Symbol> {
        self.symbols()
            .into_iter()
            .find(|s| s.name == name && !s.is_undefined)
    }

    pub fn find_undef_symbol(&self, name: &str) -> Option<Symbol> {
        self.symbols()
            .into_iter()
            .find(|s| s.name == name && s.is_undefined)
    }

    /// GNU build-ID, lower-hex-encoded (§4.2).
    pub fn build_id(&self) -> Option<String> {
        let object = self.object();
        let id = object.build_id().ok().flatten()?;
        Some(id.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn architecture(&self) -> object::Architecture {
        self.object().architecture()
    }

    pub fn entry(&self) -> u64 {
        self.object().entry()
    }
}

fn symbol_from_object(sym: object::Symbol<'_, '_>) -> Option<Symbol> {
    let name = sym.name().ok()?.to_string();
    let kind = match sym.kind() {
        object::SymbolKind::Text => SymbolKind::Function,
        object::SymbolKind::Data => SymbolKind::Object,
        _ => SymbolKind::Other,
    };
    Some(Symbol {
        name,
        value: sym.address(),
        size: sym.size(),
        kind,
        is_undefined: sym.is_undefined(),
        is_global: sym.is_global(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_elf_bytes() {
        let err = ElfFile::from_bytes(b"not an elf".to_vec()).unwrap_err();
        assert!(matches!(err, UlpError::NotElf(_)));
    }

    #[test]
    fn rejects_32_bit_class() {
        let mut bytes = vec![0u8; 64];
        bytes[0..4].copy_from_slice(b"\x7fELF");
        bytes[4] = 1; // ELFCLASS32
        let err = ElfFile::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, UlpError::WrongClass(_)));
    }
}
