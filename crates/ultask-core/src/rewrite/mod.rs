//! Call-site rewriting (C6, §4.6): divert an existing call/branch, neutralize
//! it with a NOP, or overwrite it with a jump-table trampoline.

use crate::error::{Result, UlpError};
use crate::target::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteKind {
    /// Redirect the compiler-emitted `mcount` call to `target`.
    FtraceRedirect,
    /// Neutralize the call site with the architecture's canonical NOP.
    Nop,
    /// Overwrite the function entry with a direct branch, falling back to a
    /// jump-table trampoline when the displacement doesn't fit.
    DirectJump,
}

/// The bytes saved before a rewrite, sufficient to restore the call site exactly.
#[derive(Debug, Clone)]
pub struct SavedSite {
    pub addr: u64,
    pub original_bytes: Vec<u8>,
}

/// Installs a rewrite at `func_addr` (or, for `FtraceRedirect`, at the
/// `mcount` call site inside the function's prologue). Returns the saved
/// original bytes so the caller can reverse it with [`restore_rewrite`].
pub fn install_rewrite(task: &Task, func_addr: u64, target: u64, kind: RewriteKind) -> Result<SavedSite> {
    let ops = task.arch.ops();

    match kind {
        RewriteKind::FtraceRedirect => {
            let mut prologue = vec![0u8; 64];
            task.memcpy_from_task(func_addr, &mut prologue)?;
            let offset = ops
                .mcount_call_offset(&prologue)
                .ok_or_else(|| UlpError::Inconsistent("no mcount call found in function prologue".into()))?;
            let site = func_addr + offset as u64;

            let mut original = vec![0u8; ops.mcount_insn_size()];
            task.memcpy_from_task(site, &mut original)?;

            let new_bytes = ops.encode_direct_call(site, target)?;
            task.memcpy_to_task(site, &new_bytes)?;

            Ok(SavedSite {
                addr: site,
                original_bytes: original,
            })
        }
        RewriteKind::Nop => {
            let nop = ops.nop_replace();
            let mut original = vec![0u8; nop.len()];
            task.memcpy_from_task(func_addr, &mut original)?;
            task.memcpy_to_task(func_addr, nop)?;
            Ok(SavedSite {
                addr: func_addr,
                original_bytes: original,
            })
        }
        RewriteKind::DirectJump => {
            // Prefer a direct branch; fall back to a jump-table trampoline
            // when the displacement doesn't fit the architecture's reach.
            match ops.encode_direct_call(func_addr, target) {
                Ok(new_bytes) => {
                    let mut original = vec![0u8; new_bytes.len()];
                    task.memcpy_from_task(func_addr, &mut original)?;
                    task.memcpy_to_task(func_addr, &new_bytes)?;
                    Ok(SavedSite {
                        addr: func_addr,
                        original_bytes: original,
                    })
                }
                Err(UlpError::DisplacementOutOfRange) => {
                    let size = ops.jump_table_size();
                    let new_bytes = ops.encode_jump_table(target);
                    let mut original = vec![0u8; size];
                    task.memcpy_from_task(func_addr, &mut original)?;
                    task.memcpy_to_task(func_addr, &new_bytes)?;
                    Ok(SavedSite {
                        addr: func_addr,
                        original_bytes: original,
                    })
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Writes `site.original_bytes` back to `site.addr`, undoing [`install_rewrite`].
pub fn restore_rewrite(task: &Task, site: &SavedSite) -> Result<()> {
    task.memcpy_to_task(site.addr, &site.original_bytes)
}

// Scenario 4/5/6 (§8) — install_rewrite/restore_rewrite against a live
// target — are covered in crates/ultask-core/tests/integration_test.rs,
// which can spawn the child process this module needs and this one cannot.
