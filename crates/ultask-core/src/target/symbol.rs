//! Target symbol index and resolution (§3 "TargetSymbol").

use crate::target::vma::Vma;

#[derive(Debug, Clone)]
pub struct TargetSymbol {
    pub name: String,
    pub st_value: u64,
    pub st_size: u64,
    pub st_info: u8,
    pub st_shndx: u16,
    /// Index into the task's VMA arena of the symbol's owning leader VMA.
    pub leader: usize,
}

/// Resolves a symbol's live address in the target, following §3's formula.
///
/// For a shared-library leader, finds the sibling segment whose
/// `file_voffset` range contains `st_value` and rebases onto that segment's
/// live `start`. For the main executable (or vdso, whose `st_value` must
/// already have had `load_offset` added by the caller), `st_value` is used
/// directly.
pub fn resolve(symbol: &TargetSymbol, arena: &[Vma]) -> Option<u64> {
    let leader = arena.get(symbol.leader)?;
    if !leader.is_shared_lib {
        return Some(symbol.st_value);
    }

    let mut siblings: Vec<&Vma> = std::iter::once(leader)
        .chain(leader.siblings.iter().filter_map(|&i| arena.get(i)))
        .collect();
    siblings.sort_by_key(|v| v.file_voffset.unwrap_or(0));

    let mut owning = None;
    for (idx, sib) in siblings.iter().enumerate() {
        let Some(voff) = sib.file_voffset else { continue };
        let next_voff = siblings
            .get(idx + 1)
            .and_then(|s| s.file_voffset)
            .unwrap_or(u64::MAX);
        if voff <= symbol.st_value && symbol.st_value < next_voff {
            owning = Some(*sib);
            break;
        }
    }

    let owning = owning?;
    let voff = owning.file_voffset?;
    Some(owning.start + (symbol.st_value - voff))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::vma::{Perms, VmaType};

    fn lib_vma(start: u64, end: u64, file_voffset: u64, is_shared_lib: bool, leader: Option<usize>) -> Vma {
        Vma {
            start,
            end,
            perms: Perms::default(),
            file_offset: 0,
            file_voffset: Some(file_voffset),
            dev_major: 0,
            dev_minor: 0,
            inode: 0,
            pathname: Some("/lib/libc.so.6".into()),
            vma_type: VmaType::Libc,
            is_elf: true,
            is_shared_lib,
            elf_peek: None,
            leader,
            siblings: Vec::new(),
        }
    }

    #[test]
    fn resolves_printf_in_libc() {
        // libc r-- @ 0x7f0000000000 off 0, r-x @ 0x7f0000028000 off 0x28000 (p_vaddr 0x28000)
        let mut ro = lib_vma(0x7f00_0000_0000, 0x7f00_0000_2000, 0x0, true, None);
        ro.siblings = vec![1];
        let rx = lib_vma(0x7f00_0002_8000, 0x7f00_0010_0000, 0x28000, true, Some(0));
        let arena = vec![ro, rx];

        let symbol = TargetSymbol {
            name: "printf".into(),
            st_value: 0x6f3d0,
            st_size: 0,
            st_info: 0,
            st_shndx: 1,
            leader: 0,
        };

        assert_eq!(resolve(&symbol, &arena), Some(0x7f00_0006_f3d0));
    }

    #[test]
    fn non_shared_lib_resolves_directly() {
        let mut vma = lib_vma(0x400000, 0x401000, 0, false, None);
        vma.is_shared_lib = false;
        let arena = vec![vma];
        let symbol = TargetSymbol {
            name: "main".into(),
            st_value: 0x401136,
            st_size: 0,
            st_info: 0,
            st_shndx: 1,
            leader: 0,
        };
        assert_eq!(resolve(&symbol, &arena), Some(0x401136));
    }
}
