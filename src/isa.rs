//! RV32IM instruction classification and the witness register window.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unrecognized instruction encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unrecognized instruction encoding {0:#010x}")]
pub struct DecodeError(pub u32);

/// Instruction kind ordinals.
///
/// The discriminants are chosen so that `kind / 8` and `kind % 8` reproduce
/// the witness circuit's (major, minor) cycle classification; gaps (23, 30,
/// 31, 45..=47, 51..=55) are unoccupied slots in the circuit's tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum InsnKind {
    Add = 0,
    Sub = 1,
    Xor = 2,
    Or = 3,
    And = 4,
    Slt = 5,
    SltU = 6,
    AddI = 7,
    XorI = 8,
    OrI = 9,
    AndI = 10,
    SltI = 11,
    SltIU = 12,
    Beq = 13,
    Bne = 14,
    Blt = 15,
    Bge = 16,
    BltU = 17,
    BgeU = 18,
    Jal = 19,
    JalR = 20,
    Lui = 21,
    Auipc = 22,
    Sll = 24,
    SllI = 25,
    Mul = 26,
    MulH = 27,
    MulHSU = 28,
    MulHU = 29,
    Srl = 32,
    Sra = 33,
    SrlI = 34,
    SraI = 35,
    Div = 36,
    DivU = 37,
    Rem = 38,
    RemU = 39,
    Lb = 40,
    Lh = 41,
    Lw = 42,
    LbU = 43,
    LhU = 44,
    Sb = 48,
    Sh = 49,
    Sw = 50,
    Eany = 56,
    Mret = 57,
}

impl InsnKind {
    /// Ordinal value feeding the (major, minor) split.
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Cycle category for this kind.
    pub fn category(self) -> Category {
        Category::new(u32::from(self.value()) / 8, u32::from(self.value()) % 8)
    }

    /// True for branches and jumps, whose post-execution pc is the transfer
    /// target rather than `pc + 4`.
    pub fn is_control_transfer(self) -> bool {
        matches!(
            self,
            InsnKind::Beq
                | InsnKind::Bne
                | InsnKind::Blt
                | InsnKind::Bge
                | InsnKind::BltU
                | InsnKind::BgeU
                | InsnKind::Jal
                | InsnKind::JalR
        )
    }
}

impl fmt::Display for InsnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Two-level cycle classification shared by instructions and trace steps.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Category {
    /// Major cycle group.
    pub major: u32,
    /// Minor slot within the group.
    pub minor: u32,
}

/// Largest major that still corresponds to instruction retirement.
pub const MAX_RETIREMENT_MAJOR: u32 = 6;

impl Category {
    /// Builds a category from its two components.
    pub fn new(major: u32, minor: u32) -> Self {
        Category { major, minor }
    }

    /// True for non-retirement cycles (control transitions, system-call
    /// bookkeeping, hash permutation rounds, big-integer arithmetic).
    pub fn is_auxiliary(self) -> bool {
        self.major > MAX_RETIREMENT_MAJOR
    }

    /// Human-oriented name for the major group.
    pub fn major_label(self) -> &'static str {
        match self.major {
            0 => "misc0",
            1 => "misc1",
            2 => "misc2",
            3 => "mul",
            4 => "div",
            5 => "load",
            6 => "store",
            7 => "control",
            8 => "ecall",
            9 => "poseidon0",
            10 => "poseidon1",
            11 => "sha",
            12 => "bigint",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.major, self.minor)
    }
}

/// Classifies a 32-bit encoding into its instruction kind.
pub fn classify(word: u32) -> Result<InsnKind, DecodeError> {
    let opcode = word & 0x7f;
    let funct3 = (word >> 12) & 0x7;
    let funct7 = (word >> 25) & 0x7f;
    let kind = match opcode {
        0x33 => match (funct7, funct3) {
            (0x00, 0) => InsnKind::Add,
            (0x20, 0) => InsnKind::Sub,
            (0x00, 1) => InsnKind::Sll,
            (0x00, 2) => InsnKind::Slt,
            (0x00, 3) => InsnKind::SltU,
            (0x00, 4) => InsnKind::Xor,
            (0x00, 5) => InsnKind::Srl,
            (0x20, 5) => InsnKind::Sra,
            (0x00, 6) => InsnKind::Or,
            (0x00, 7) => InsnKind::And,
            (0x01, 0) => InsnKind::Mul,
            (0x01, 1) => InsnKind::MulH,
            (0x01, 2) => InsnKind::MulHSU,
            (0x01, 3) => InsnKind::MulHU,
            (0x01, 4) => InsnKind::Div,
            (0x01, 5) => InsnKind::DivU,
            (0x01, 6) => InsnKind::Rem,
            (0x01, 7) => InsnKind::RemU,
            _ => return Err(DecodeError(word)),
        },
        0x13 => match funct3 {
            0 => InsnKind::AddI,
            1 if funct7 == 0x00 => InsnKind::SllI,
            2 => InsnKind::SltI,
            3 => InsnKind::SltIU,
            4 => InsnKind::XorI,
            5 if funct7 == 0x00 => InsnKind::SrlI,
            5 if funct7 == 0x20 => InsnKind::SraI,
            6 => InsnKind::OrI,
            7 => InsnKind::AndI,
            _ => return Err(DecodeError(word)),
        },
        0x03 => match funct3 {
            0 => InsnKind::Lb,
            1 => InsnKind::Lh,
            2 => InsnKind::Lw,
            4 => InsnKind::LbU,
            5 => InsnKind::LhU,
            _ => return Err(DecodeError(word)),
        },
        0x23 => match funct3 {
            0 => InsnKind::Sb,
            1 => InsnKind::Sh,
            2 => InsnKind::Sw,
            _ => return Err(DecodeError(word)),
        },
        0x63 => match funct3 {
            0 => InsnKind::Beq,
            1 => InsnKind::Bne,
            4 => InsnKind::Blt,
            5 => InsnKind::Bge,
            6 => InsnKind::BltU,
            7 => InsnKind::BgeU,
            _ => return Err(DecodeError(word)),
        },
        0x6f => InsnKind::Jal,
        0x67 => InsnKind::JalR,
        0x37 => InsnKind::Lui,
        0x17 => InsnKind::Auipc,
        0x73 => match word {
            0x0000_0073 => InsnKind::Eany,
            0x3020_0073 => InsnKind::Mret,
            _ => return Err(DecodeError(word)),
        },
        _ => return Err(DecodeError(word)),
    };
    Ok(kind)
}

/// Classifies an encoding straight to its cycle category.
pub fn category_of(word: u32) -> Result<Category, DecodeError> {
    classify(word).map(InsnKind::category)
}

/// Word address of `x0` in the witness address space (byte `0xFFFF_0080`).
pub const REGISTER_WINDOW_BASE: u32 = 0x3FFF_C020;

/// Number of words in the register window.
pub const REGISTER_COUNT: u32 = 32;

const REGISTER_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// ABI mnemonic for a register index, or `None` past the window.
pub fn register_name(index: u32) -> Option<&'static str> {
    REGISTER_NAMES.get(index as usize).copied()
}

/// Register index for an ABI mnemonic (accepts the `fp` alias for `s0`).
pub fn register_index(name: &str) -> Option<u32> {
    if name == "fp" {
        return Some(8);
    }
    REGISTER_NAMES
        .iter()
        .position(|n| *n == name)
        .map(|i| i as u32)
}
