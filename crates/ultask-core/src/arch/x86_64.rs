use super::{ArchOps, JumpTableEntry as JumpTableEntryTrait};
use crate::error::{Result, UlpError};

/// Byte offset of each `user_regs_struct` field (x86-64), as returned by
/// `PTRACE_GETREGSET(NT_PRSTATUS)`. Field order: r15 r14 r13 r12 rbp rbx r11
/// r10 r9 r8 rax rcx rdx rsi rdi orig_rax rip cs eflags rsp ss fs_base
/// gs_base ds es fs gs.
const OFF_R10: usize = 6 * 8;
const OFF_R9: usize = 8 * 8;
const OFF_R8: usize = 9 * 8;
const OFF_RAX: usize = 10 * 8;
const OFF_RDX: usize = 12 * 8;
const OFF_RSI: usize = 13 * 8;
const OFF_RDI: usize = 14 * 8;
const OFF_ORIG_RAX: usize = 15 * 8;
const OFF_RIP: usize = 16 * 8;
const REGS_SIZE: usize = 27 * 8;

fn get_u64(raw: &[u8], off: usize) -> u64 {
    u64::from_ne_bytes(raw[off..off + 8].try_into().unwrap())
}

fn set_u64(raw: &mut [u8], off: usize, val: u64) {
    raw[off..off + 8].copy_from_slice(&val.to_ne_bytes());
}

pub struct X86_64;

/// `E8 rel32` direct call, plus a trailing `0F 1F 44 00 00` 5-byte NOP used to
/// pad the jump-table trampoline to a fixed size (scenario 4, §8).
const JMP_TABLE_PREFIX: &[u8] = &[0xff, 0x25, 0x00, 0x00, 0x00, 0x00]; // jmp *0(%rip)

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct JumpTableEntryX86 {
    /// `ff 25 00 00 00 00` followed by the 8-byte absolute target, i.e. an
    /// indirect jump through the very next 8 bytes (rip-relative operand 0).
    prefix: [u8; 6],
    target: [u8; 8],
}

impl JumpTableEntryTrait for JumpTableEntryX86 {
    const SIZE: usize = 14;

    fn encode(target: u64) -> Self {
        let mut prefix = [0u8; 6];
        prefix.copy_from_slice(JMP_TABLE_PREFIX);
        JumpTableEntryX86 {
            prefix,
            target: target.to_le_bytes(),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        // SAFETY: the struct is `repr(C, packed)` with no padding; reinterpreting
        // it as a byte slice of its own size is always valid.
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE)
        }
    }
}

impl ArchOps for X86_64 {
    fn mcount_insn_size(&self) -> usize {
        5
    }

    fn syscall_instr_bytes(&self) -> &'static [u8] {
        &[0x0f, 0x05]
    }

    fn nop_replace(&self) -> &'static [u8] {
        &[0x0f, 0x1f, 0x44, 0x00, 0x00]
    }

    fn jmp_table_jmp(&self) -> &'static [u8] {
        JMP_TABLE_PREFIX
    }

    fn mcount_call_offset(&self, prologue: &[u8]) -> Option<usize> {
        // Scan a bounded prologue (<=64 bytes, per §4.1) for the `E8 rel32`
        // opcode byte. Real compilers emit the mcount call very early, right
        // after the (optional) stack-frame setup, so a short linear scan for
        // the opcode is sufficient and matches the C implementation's
        // equivalent heuristic.
        let bound = prologue.len().min(64);
        prologue[..bound.saturating_sub(5)]
            .iter()
            .position(|&b| b == 0xe8)
    }

    fn encode_direct_call(&self, site_ip: u64, target: u64) -> Result<Vec<u8>> {
        call_replace(site_ip, target).map(|b| b.to_vec())
    }

    fn jump_table_size(&self) -> usize {
        JumpTableEntryX86::SIZE
    }

    fn encode_jump_table(&self, target: u64) -> Vec<u8> {
        JumpTableEntryX86::encode(target).as_bytes().to_vec()
    }

    fn elf_machine(&self) -> u16 {
        object::elf::EM_X86_64 as u16
    }

    fn regs_size(&self) -> usize {
        REGS_SIZE
    }

    fn get_ip(&self, raw: &[u8]) -> u64 {
        get_u64(raw, OFF_RIP)
    }

    fn set_ip(&self, raw: &mut [u8], ip: u64) {
        set_u64(raw, OFF_RIP, ip);
    }

    fn get_ret(&self, raw: &[u8]) -> i64 {
        get_u64(raw, OFF_RAX) as i64
    }

    fn regs_prepare(&self, raw: &mut [u8], nr: i64, args: [u64; 6]) {
        set_u64(raw, OFF_ORIG_RAX, nr as u64);
        set_u64(raw, OFF_RAX, nr as u64);
        set_u64(raw, OFF_RDI, args[0]);
        set_u64(raw, OFF_RSI, args[1]);
        set_u64(raw, OFF_RDX, args[2]);
        set_u64(raw, OFF_R10, args[3]);
        set_u64(raw, OFF_R8, args[4]);
        set_u64(raw, OFF_R9, args[5]);
    }
}

/// Encodes an `E8 rel32` direct call replacement. Exposed standalone because
/// it is the primitive scenario 4 (§8) exercises directly.
pub fn call_replace(ip: u64, target: u64) -> Result<[u8; 5]> {
    let rel = (target as i64).wrapping_sub((ip as i64) + 5);
    let rel32: i32 = rel.try_into().map_err(|_| UlpError::DisplacementOutOfRange)?;
    let mut buf = [0u8; 5];
    buf[0] = 0xe8;
    buf[1..].copy_from_slice(&rel32.to_le_bytes());
    Ok(buf)
}
