// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A small BPF-subset register machine evaluated over decrypted inner
//! packets. Instructions, opcode layout, and validation order are a direct
//! port of the classic BSD packet filter's instruction set: accumulator
//! `A`, index register `X`, 16 scratch words, forward-only jumps, one
//! return ends the program.
//!
//! A device holds up to 64 programs (see [`MAX_PROGRAMS`]) in priority
//! order; [`Acl::evaluate`] runs them against a buffer and combines the
//! first match with the default policy.

use thiserror::Error;

pub const MAX_PROGRAMS: usize = 64;
pub const MAX_INSNS: usize = 256;
const MEMWORDS: usize = 16;

/// Instruction classes, `code & 0x07`.
mod class {
    pub const LD: u16 = 0x00;
    pub const LDX: u16 = 0x01;
    pub const ST: u16 = 0x02;
    pub const STX: u16 = 0x03;
    pub const ALU: u16 = 0x04;
    pub const JMP: u16 = 0x05;
    pub const RET: u16 = 0x06;
    pub const MISC: u16 = 0x07;
}

mod size {
    pub const W: u16 = 0x00;
    pub const H: u16 = 0x08;
    pub const B: u16 = 0x10;
}

mod mode {
    pub const IMM: u16 = 0x00;
    pub const ABS: u16 = 0x20;
    pub const IND: u16 = 0x40;
    pub const MEM: u16 = 0x60;
    pub const LEN: u16 = 0x80;
    pub const MSH: u16 = 0xa0;
}

mod op {
    pub const ADD: u16 = 0x00;
    pub const SUB: u16 = 0x10;
    pub const MUL: u16 = 0x20;
    pub const DIV: u16 = 0x30;
    pub const OR: u16 = 0x40;
    pub const AND: u16 = 0x50;
    pub const LSH: u16 = 0x60;
    pub const RSH: u16 = 0x70;
    pub const NEG: u16 = 0x80;
    pub const MOD: u16 = 0x90;
    pub const XOR: u16 = 0xa0;
    pub const JA: u16 = 0x00;
    pub const JEQ: u16 = 0x10;
    pub const JGT: u16 = 0x20;
    pub const JGE: u16 = 0x30;
    pub const JSET: u16 = 0x40;
}

mod src {
    pub const K: u16 = 0x00;
    pub const X: u16 = 0x08;
}

mod rval {
    pub const K: u16 = 0x00;
    pub const A: u16 = 0x10;
}

mod misc {
    pub const TAX: u16 = 0x00;
    pub const TXA: u16 = 0x80;
}

fn class_of(code: u16) -> u16 {
    code & 0x07
}
fn size_of(code: u16) -> u16 {
    code & 0x18
}
fn mode_of(code: u16) -> u16 {
    code & 0xe0
}
fn op_of(code: u16) -> u16 {
    code & 0xf0
}
fn src_of(code: u16) -> u16 {
    code & 0x08
}
fn rval_of(code: u16) -> u16 {
    code & 0x18
}
fn misc_of(code: u16) -> u16 {
    code & 0xf8
}

/// A single BPF-style instruction. `jt`/`jf` are relative forward jump
/// offsets used only by the `JMP` class; `k` is the class-dependent
/// immediate/address/offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl Insn {
    pub fn new(code: u16, jt: u8, jf: u8, k: u32) -> Insn {
        Insn { code, jt, jf, k }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AclError {
    #[error("program length is negative")]
    NegativeLength,
    #[error("program exceeds {0} instructions")]
    TooLong(usize),
    #[error("instruction {0} has an unrecognized opcode {1:#x}")]
    BadOpcode(usize, u16),
    #[error("instruction {0} jumps backward or out of program bounds")]
    BadJump(usize),
    #[error("instruction {0} addresses scratch memory word {1} (>= {MEMWORDS})")]
    BadMemIndex(usize, u32),
    #[error("instruction {0} divides by a constant zero")]
    DivByZero(usize),
    #[error("program does not end in a RET instruction")]
    MissingReturn,
    #[error("program count exceeds {0}")]
    TooManyPrograms(usize),
}

/// A bitmap, one bit per valid `code` byte value, ported verbatim from the
/// reference opcode-validity table: 16 entries of 16 bits each, index by
/// `code >> 4`, test bit `code & 0xf`.
const CODE_MAP: [u16; 16] = [
    0x10ff, 0x3070, 0x3131, 0x3031, 0x3131, 0x1011, 0x1013, 0x1010, 0x0093, 0x0000, 0x0000,
    0x0002, 0x0000, 0x0000, 0x0000, 0x0000,
];

fn code_is_valid(code: u16) -> bool {
    code <= 0xff && (CODE_MAP[(code >> 4) as usize] & (1 << (code & 0xf))) != 0
}

/// Validates a program in the exact order the interpreter's own validator
/// applies: length, per-instruction opcode membership, jump bounds,
/// scratch-memory bounds, constant divide-by-zero, and a trailing `RET`.
pub fn validate(insns: &[Insn]) -> Result<(), AclError> {
    let len = insns.len();
    if len > MAX_INSNS {
        return Err(AclError::TooLong(MAX_INSNS));
    }
    if len == 0 {
        // An empty program is accepted unconditionally; it always matches.
        return Ok(());
    }

    for (i, insn) in insns.iter().enumerate() {
        if !code_is_valid(insn.code) {
            return Err(AclError::BadOpcode(i, insn.code));
        }

        if class_of(insn.code) == class::JMP {
            let offset = if insn.code == class::JMP | op::JA {
                insn.k
            } else {
                insn.jt.max(insn.jf) as u32
            };
            if offset >= (len - i - 1) as u32 {
                return Err(AclError::BadJump(i));
            }
            continue;
        }

        let is_mem_access = insn.code == class::ST
            || insn.code == class::STX
            || insn.code == class::LD | mode::MEM
            || insn.code == class::LDX | mode::MEM;
        if is_mem_access {
            if insn.k >= MEMWORDS as u32 {
                return Err(AclError::BadMemIndex(i, insn.k));
            }
            continue;
        }

        if insn.code == class::ALU | op::DIV | src::K && insn.k == 0 {
            return Err(AclError::DivByZero(i));
        }
    }

    if class_of(insns[len - 1].code) != class::RET {
        return Err(AclError::MissingReturn);
    }
    Ok(())
}

/// Runs one already-validated program against `buf`. `wirelen` is the
/// original (possibly truncated-on-capture) packet length; `buf` holds the
/// captured bytes, which may be shorter. A `None` program (no filter at
/// all) matches everything, mirroring the C interpreter's `pc == NULL`
/// shortcut; callers represent "no filter" as an empty instruction slice,
/// which `validate` already accepts, so this function never sees a null
/// program and unconditionally indexes `insns[0]` once started.
pub fn run(insns: &[Insn], buf: &[u8], wirelen: u32) -> u32 {
    if insns.is_empty() {
        return u32::MAX;
    }

    let buflen = buf.len() as u32;
    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut mem = [0u32; MEMWORDS];
    let mut pc: usize = 0;

    loop {
        let insn = &insns[pc];
        let code = insn.code;
        match class_of(code) {
            c if c == class::RET => {
                return if rval_of(code) == rval::A { a } else { insn.k };
            }
            c if c == class::LD && mode_of(code) == mode::ABS => {
                let k = insn.k;
                let width = match size_of(code) {
                    size::W => 4,
                    size::H => 2,
                    _ => 1,
                };
                match read_be(buf, k, width, buflen) {
                    Some(v) => a = v,
                    None => return 0,
                }
            }
            c if c == class::LD && mode_of(code) == mode::IND => {
                let k = x.saturating_add(insn.k);
                let width = match size_of(code) {
                    size::W => 4,
                    size::H => 2,
                    _ => 1,
                };
                if insn.k > buflen || x > buflen.saturating_sub(insn.k) {
                    return 0;
                }
                match read_be(buf, k, width, buflen) {
                    Some(v) => a = v,
                    None => return 0,
                }
            }
            c if c == class::LD && mode_of(code) == mode::LEN => a = wirelen,
            c if c == class::LDX && mode_of(code) == mode::LEN => x = wirelen,
            c if c == class::LDX && mode_of(code) == mode::MSH => {
                let k = insn.k;
                if k >= buflen {
                    return 0;
                }
                x = (u32::from(buf[k as usize]) & 0xf) << 2;
            }
            c if c == class::LD && mode_of(code) == mode::IMM => a = insn.k,
            c if c == class::LDX && mode_of(code) == mode::IMM => x = insn.k,
            c if c == class::LD && mode_of(code) == mode::MEM => a = mem[insn.k as usize],
            c if c == class::LDX && mode_of(code) == mode::MEM => x = mem[insn.k as usize],
            c if c == class::ST => mem[insn.k as usize] = a,
            c if c == class::STX => mem[insn.k as usize] = x,
            c if c == class::JMP && op_of(code) == op::JA => {
                pc = pc + 1 + insn.k as usize;
                continue;
            }
            c if c == class::JMP => {
                let taken = match (op_of(code), src_of(code)) {
                    (op::JEQ, src::K) => a == insn.k,
                    (op::JEQ, _) => a == x,
                    (op::JGT, src::K) => a > insn.k,
                    (op::JGT, _) => a > x,
                    (op::JGE, src::K) => a >= insn.k,
                    (op::JGE, _) => a >= x,
                    (op::JSET, src::K) => (a & insn.k) != 0,
                    (op::JSET, _) => (a & x) != 0,
                    _ => false,
                };
                pc += 1 + if taken { insn.jt as usize } else { insn.jf as usize };
                continue;
            }
            c if c == class::ALU => {
                let operand = if src_of(code) == src::X { x } else { insn.k };
                match op_of(code) {
                    op::ADD => a = a.wrapping_add(operand),
                    op::SUB => a = a.wrapping_sub(operand),
                    op::MUL => a = a.wrapping_mul(operand),
                    op::DIV => {
                        if operand == 0 {
                            return 0;
                        }
                        a /= operand;
                    }
                    op::AND => a &= operand,
                    op::OR => a |= operand,
                    op::LSH => a <<= operand & 31,
                    op::RSH => a >>= operand & 31,
                    op::MOD => {
                        if operand == 0 {
                            return 0;
                        }
                        a %= operand;
                    }
                    op::XOR => a ^= operand,
                    op::NEG => a = a.wrapping_neg(),
                    _ => {}
                }
            }
            c if c == class::MISC => match misc_of(code) {
                misc::TAX => x = a,
                misc::TXA => a = x,
                _ => {}
            },
            _ => return 0,
        }
        pc += 1;
        if pc >= insns.len() {
            return 0;
        }
    }
}

fn read_be(buf: &[u8], k: u32, width: u32, buflen: u32) -> Option<u32> {
    if k > buflen || width > buflen - k {
        return None;
    }
    let start = k as usize;
    Some(match width {
        4 => u32::from_be_bytes(buf[start..start + 4].try_into().ok()?),
        2 => u16::from_be_bytes(buf[start..start + 2].try_into().ok()?) as u32,
        _ => buf[start] as u32,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPolicy {
    Allow,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Allow,
    Drop,
}

/// The device's active ACL: an ordered list of already-validated programs
/// plus the default policy applied when none match.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    programs: Vec<Vec<Insn>>,
    default_policy: Option<DefaultPolicy>,
}

impl Acl {
    pub fn new(programs: Vec<Vec<Insn>>, default_policy: DefaultPolicy) -> Result<Acl, AclError> {
        if programs.len() > MAX_PROGRAMS {
            return Err(AclError::TooManyPrograms(MAX_PROGRAMS));
        }
        for program in &programs {
            validate(program)?;
        }
        Ok(Acl {
            programs,
            default_policy: Some(default_policy),
        })
    }

    /// Evaluates `buf` (a decrypted inner IPv4 packet) against every
    /// program in priority order. The first nonzero result decides the
    /// packet: under `default=allow` a match blocks, under `default=block`
    /// a match allows — the match inverts the default. No match falls
    /// through to the default policy itself.
    pub fn evaluate(&self, buf: &[u8]) -> FilterDecision {
        let Some(default_policy) = self.default_policy else {
            return FilterDecision::Allow;
        };
        let wirelen = buf.len() as u32;
        for program in &self.programs {
            if run(program, buf, wirelen) != 0 {
                return match default_policy {
                    DefaultPolicy::Allow => FilterDecision::Drop,
                    DefaultPolicy::Block => FilterDecision::Allow,
                };
            }
        }
        match default_policy {
            DefaultPolicy::Allow => FilterDecision::Allow,
            DefaultPolicy::Block => FilterDecision::Drop,
        }
    }
}
