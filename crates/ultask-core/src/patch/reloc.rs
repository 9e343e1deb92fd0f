//! RELA relocation application for the staged patch object (§4.5 step 5).

use crate::error::{Result, UlpError};

/// x86-64 relocation type constants (`elf.h`, not re-exported by `object::elf`
/// under these exact names for every variant we need).
mod r_x86_64 {
    pub const R_64: u32 = 1;
    pub const PC32: u32 = 2;
    pub const PLT32: u32 = 4;
    pub const R_32S: u32 = 11;
    pub const GOTPCREL: u32 = 9;
}

mod r_aarch64 {
    pub const ABS64: u32 = 257;
    pub const CALL26: u32 = 283;
    pub const JUMP26: u32 = 282;
    pub const ADR_PREL_PG_HI21: u32 = 275;
    pub const ADD_ABS_LO12_NC: u32 = 277;
    pub const LDST8_ABS_LO12_NC: u32 = 278;
    pub const LDST16_ABS_LO12_NC: u32 = 284;
    pub const LDST32_ABS_LO12_NC: u32 = 285;
    pub const LDST64_ABS_LO12_NC: u32 = 286;
}

/// Reports whether `r_type` is `R_X86_64_GOTPCREL`, so the loader knows to
/// synthesize a GOT slot for the referenced symbol before applying it.
pub fn is_gotpcrel(r_type: u32) -> bool {
    r_type == r_x86_64::GOTPCREL
}

/// Computes the relocated value to write at `loc` (the relocation's live
/// target address), given the symbol's resolved address and the addend.
/// `got_addr` is the address of the GOT slot the loader synthesized for this
/// relocation's symbol (see `patch::resolve_and_relocate`); every variant but
/// `GOTPCREL` ignores it.
pub fn apply_x86_64(r_type: u32, loc: u64, sym_val: u64, addend: i64, got_addr: Option<u64>) -> Result<Vec<u8>> {
    match r_type {
        r_x86_64::R_64 => {
            let val = (sym_val as i64).wrapping_add(addend) as u64;
            Ok(val.to_le_bytes().to_vec())
        }
        r_x86_64::R_32S => {
            let val = (sym_val as i64).wrapping_add(addend);
            let val32: i32 = val.try_into().map_err(|_| UlpError::DisplacementOutOfRange)?;
            Ok(val32.to_le_bytes().to_vec())
        }
        r_x86_64::PC32 | r_x86_64::PLT32 => {
            let val = (sym_val as i64).wrapping_add(addend).wrapping_sub(loc as i64);
            let val32: i32 = val.try_into().map_err(|_| UlpError::DisplacementOutOfRange)?;
            Ok(val32.to_le_bytes().to_vec())
        }
        r_x86_64::GOTPCREL => {
            let got = got_addr.ok_or_else(|| {
                UlpError::Inconsistent("GOTPCREL relocation applied without a synthesized GOT slot".into())
            })?;
            let val = (got as i64).wrapping_add(addend).wrapping_sub(loc as i64);
            let val32: i32 = val.try_into().map_err(|_| UlpError::DisplacementOutOfRange)?;
            Ok(val32.to_le_bytes().to_vec())
        }
        _ => Err(UlpError::UnsupportedReloc(r_type)),
    }
}

/// AArch64 relocations. `CALL26`/`JUMP26` reuse [`crate::arch::aarch64::branch_imm`]'s
/// word-displacement encoding; the `ADRP`/`ADD`/`LDST` page-relative forms
/// patch only the instruction's immediate bitfield, leaving the opcode bits untouched.
pub fn apply_aarch64(r_type: u32, loc: u64, sym_val: u64, addend: i64, insn: u32) -> Result<Vec<u8>> {
    match r_type {
        r_aarch64::ABS64 => {
            let val = (sym_val as i64).wrapping_add(addend) as u64;
            Ok(val.to_le_bytes().to_vec())
        }
        r_aarch64::CALL26 | r_aarch64::JUMP26 => {
            let target = (sym_val as i64).wrapping_add(addend) as u64;
            let link = if r_type == r_aarch64::CALL26 {
                crate::arch::Link::Link
            } else {
                crate::arch::Link::NoLink
            };
            let bytes = crate::arch::aarch64::branch_imm(loc, target, link)?;
            Ok(bytes.to_vec())
        }
        r_aarch64::ADR_PREL_PG_HI21 => {
            let target = (sym_val as i64).wrapping_add(addend) as u64;
            let page_delta = ((target & !0xfff) as i64).wrapping_sub((loc & !0xfff) as i64);
            let page_off = page_delta >> 12;
            if !(-(1i64 << 20)..(1i64 << 20)).contains(&page_off) {
                return Err(UlpError::DisplacementOutOfRange);
            }
            let immlo = (page_off as u32) & 0x3;
            let immhi = ((page_off as u32) >> 2) & 0x7ffff;
            let patched = (insn & !(0x3 << 29) & !(0x7ffff << 5)) | (immlo << 29) | (immhi << 5);
            Ok(patched.to_le_bytes().to_vec())
        }
        r_aarch64::ADD_ABS_LO12_NC => {
            let target = (sym_val as i64).wrapping_add(addend) as u64;
            let lo12 = (target & 0xfff) as u32;
            let patched = (insn & !(0xfff << 10)) | (lo12 << 10);
            Ok(patched.to_le_bytes().to_vec())
        }
        r_aarch64::LDST8_ABS_LO12_NC
        | r_aarch64::LDST16_ABS_LO12_NC
        | r_aarch64::LDST32_ABS_LO12_NC
        | r_aarch64::LDST64_ABS_LO12_NC => {
            let scale = match r_type {
                r_aarch64::LDST8_ABS_LO12_NC => 0,
                r_aarch64::LDST16_ABS_LO12_NC => 1,
                r_aarch64::LDST32_ABS_LO12_NC => 2,
                _ => 3,
            };
            let target = (sym_val as i64).wrapping_add(addend) as u64;
            let lo12 = ((target & 0xfff) >> scale) as u32;
            let patched = (insn & !(0xfff << 10)) | (lo12 << 10);
            Ok(patched.to_le_bytes().to_vec())
        }
        _ => Err(UlpError::UnsupportedReloc(r_type)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_64_abs64_adds_addend() {
        let bytes = apply_x86_64(r_x86_64::R_64, 0, 0x1000, 8, None).unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 0x1008);
    }

    #[test]
    fn x86_64_pc32_is_relative_to_loc() {
        let bytes = apply_x86_64(r_x86_64::PC32, 0x2000, 0x2010, 0, None).unwrap();
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 0x10);
    }

    #[test]
    fn x86_64_gotpcrel_is_relative_to_the_got_slot_not_the_symbol() {
        let bytes = apply_x86_64(r_x86_64::GOTPCREL, 0x2000, 0xdead_beef, 0, Some(0x2010)).unwrap();
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), 0x10);
    }

    #[test]
    fn x86_64_gotpcrel_without_a_got_slot_is_an_error() {
        assert!(matches!(
            apply_x86_64(r_x86_64::GOTPCREL, 0, 0, 0, None),
            Err(UlpError::Inconsistent(_))
        ));
    }

    #[test]
    fn aarch64_abs64_adds_addend() {
        let bytes = apply_aarch64(r_aarch64::ABS64, 0, 0x4000, 4, 0).unwrap();
        assert_eq!(u64::from_le_bytes(bytes.try_into().unwrap()), 0x4004);
    }

    #[test]
    fn aarch64_add_lo12_patches_only_immediate_bits() {
        let insn = 0x91000000u32; // ADD x0, x0, #0
        let bytes = apply_aarch64(r_aarch64::ADD_ABS_LO12_NC, 0, 0x1234, 0, insn).unwrap();
        let patched = u32::from_le_bytes(bytes.try_into().unwrap());
        assert_eq!(patched & !(0xfff << 10), insn & !(0xfff << 10));
        assert_eq!((patched >> 10) & 0xfff, 0x234);
    }
}
