//! Calling-convention argument access for a stopped guest.
//!
//! At a function-entry breakpoint the return address sits at `[rsp]`, so
//! stack slot `n` lives at `rsp + 8 * (n + 1)`.

use axerrno::AxResult;

use crate::debug::{DebugCore, Register};
use crate::reader::Reader;

/// Guest calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// Microsoft x64: rcx, rdx, r8, r9, then stack above the 32-byte home area.
    Win64,
    /// System V AMD64: rdi, rsi, rdx, rcx, r8, r9, then stack.
    SysV,
}

const WIN64_REGS: [Register; 4] = [Register::Rcx, Register::Rdx, Register::R8, Register::R9];
const SYSV_REGS: [Register; 6] = [
    Register::Rdi,
    Register::Rsi,
    Register::Rdx,
    Register::Rcx,
    Register::R8,
    Register::R9,
];

impl CallConv {
    fn registers(self) -> &'static [Register] {
        match self {
            CallConv::Win64 => &WIN64_REGS,
            CallConv::SysV => &SYSV_REGS,
        }
    }

    /// Register carrying argument `index`, if passed in a register.
    pub fn arg_register(self, index: usize) -> Option<Register> {
        self.registers().get(index).copied()
    }

    /// Stack slot carrying argument `index` when it is not in a register.
    fn arg_stack_slot(self, index: usize) -> usize {
        match self {
            // home area: args 0..4 keep their slots on the stack
            CallConv::Win64 => index,
            CallConv::SysV => index - SYSV_REGS.len(),
        }
    }
}

/// Read stack slot `index` of the stopped context (0 is the first slot
/// above the return address).
pub fn read_stack(core: &dyn DebugCore, reader: &Reader, index: usize) -> AxResult<u64> {
    let rsp = core.read_register(Register::Rsp)?;
    reader.read_ptr(rsp.wrapping_add(8 * (index as u64 + 1)))
}

/// Read argument `index` of the function the guest is stopped at.
pub fn read_arg(
    core: &dyn DebugCore,
    reader: &Reader,
    conv: CallConv,
    index: usize,
) -> AxResult<u64> {
    match conv.arg_register(index) {
        Some(reg) => core.read_register(reg),
        None => read_stack(core, reader, conv.arg_stack_slot(index)),
    }
}

/// Overwrite a register-passed argument.
///
/// Stack arguments are read-only through this crate and fail with
/// `Unsupported`.
pub fn write_arg(core: &dyn DebugCore, conv: CallConv, index: usize, value: u64) -> AxResult {
    match conv.arg_register(index) {
        Some(reg) => core.write_register(reg, value),
        None => axerrno::ax_err!(Unsupported, "stack arguments are read-only"),
    }
}
