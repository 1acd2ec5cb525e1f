//! CIL method bodies and the trap sequences that replace them.

use super::Token;

/// CIL opcodes used by the trap sequences
pub mod opcodes {
    /// `ldnull` - push a null reference
    pub const LDNULL: u8 = 0x14;
    /// `ldstr <token>` - push a literal string from the user string heap
    pub const LDSTR: u8 = 0x72;
    /// `newobj <token>` - allocate and construct an object
    pub const NEWOBJ: u8 = 0x73;
    /// `throw` - raise the exception object on the stack
    pub const THROW: u8 = 0x7A;
    /// `ret` - return from method
    pub const RET: u8 = 0x2A;
    /// Prefix of the two-byte opcodes
    pub const EXTENDED: u8 = 0xFE;
}

/// Operand encodings (ECMA-335 Partition III)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operand {
    Bare,
    Byte,
    Short,
    Int,
    Long,
    Token,
    Switch,
}

fn operand(op: u8) -> Option<Operand> {
    Some(match op {
        0x00..=0x0D | 0x14..=0x1E | 0x25 | 0x26 | 0x2A | 0x46..=0x6E | 0x76 | 0x7A
        | 0x82..=0x8B | 0x8E | 0x90..=0xA2 | 0xB3..=0xBA | 0xC3 | 0xD1..=0xDC | 0xDF | 0xE0 => {
            Operand::Bare
        }
        0x0E..=0x13 | 0x1F | 0x2B..=0x37 | 0xDE => Operand::Byte,
        0x20 | 0x22 | 0x38..=0x44 | 0xDD => Operand::Int,
        0x21 | 0x23 => Operand::Long,
        0x27..=0x29 | 0x6F..=0x75 | 0x79 | 0x7B..=0x81 | 0x8C | 0x8D | 0x8F | 0xA3..=0xA5
        | 0xC2 | 0xC6 | 0xD0 => Operand::Token,
        0x45 => Operand::Switch,
        _ => return None,
    })
}

fn extended_operand(op: u8) -> Option<Operand> {
    Some(match op {
        0x00..=0x05 | 0x0F | 0x11 | 0x13 | 0x14 | 0x17 | 0x18 | 0x1A | 0x1D | 0x1E => Operand::Bare,
        0x06 | 0x07 | 0x15 | 0x16 | 0x1C => Operand::Token,
        0x09..=0x0E => Operand::Short,
        0x12 | 0x19 => Operand::Byte,
        _ => return None,
    })
}

fn read_u32(code: &[u8], at: usize) -> Option<u32> {
    let bytes = code.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// The executable body of a method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodBody {
    /// Maximum number of items on the evaluation stack
    pub max_stack: u16,
    /// Zero-initialise locals on entry
    pub init_locals: bool,
    /// Local variable signature, null when the body has no locals
    pub local_signature: Token,
    /// Raw CIL byte code
    pub code: Vec<u8>,
    /// Raw exception handling sections following the code
    pub exception_sections: Vec<u8>,
}

impl MethodBody {
    /// Creates a body from raw byte code with a default stack depth of 8
    pub fn new(code: Vec<u8>) -> Self {
        Self {
            max_stack: 8,
            init_locals: false,
            local_signature: Token::NULL,
            code,
            exception_sections: Vec::new(),
        }
    }

    /// `ldnull; throw`
    ///
    /// Loadable, but raises a null reference error the moment it runs.
    pub fn trap() -> Self {
        Self::new(vec![opcodes::LDNULL, opcodes::THROW])
    }

    /// `ldstr message; newobj ctor; throw`
    ///
    /// `message` is a user string token and `ctor` a member reference to a
    /// `(string)` exception constructor.
    pub fn throwing(message: Token, ctor: Token) -> Self {
        let mut code = Vec::with_capacity(11);
        code.push(opcodes::LDSTR);
        code.extend_from_slice(&message.value().to_le_bytes());
        code.push(opcodes::NEWOBJ);
        code.extend_from_slice(&ctor.value().to_le_bytes());
        code.push(opcodes::THROW);
        Self::new(code)
    }

    /// Returns true if the body uses locals or exception handlers
    pub fn is_fat(&self) -> bool {
        !self.local_signature.is_null() || !self.exception_sections.is_empty()
    }

    /// Returns true if the first instructions raise an exception unconditionally
    ///
    /// Only the instructions the trap sequences use are understood; any other
    /// opcode before a `throw` means the body may do something else first.
    pub fn throws_immediately(&self) -> bool {
        let mut offset = 0;
        while let Some(&op) = self.code.get(offset) {
            match op {
                opcodes::THROW => return true,
                opcodes::LDNULL => offset += 1,
                opcodes::LDSTR | opcodes::NEWOBJ => offset += 5,
                _ => return false,
            }
        }
        false
    }

    /// Code offsets and values of every metadata token operand
    ///
    /// Walking stops at the first byte that is not a known opcode.
    pub fn token_operands(&self) -> Vec<(usize, Token)> {
        let code = &self.code;
        let mut tokens = Vec::new();
        let mut offset = 0;
        while let Some(&op) = code.get(offset) {
            let (kind, start) = if op == opcodes::EXTENDED {
                match code.get(offset + 1).and_then(|&op| extended_operand(op)) {
                    Some(kind) => (kind, offset + 2),
                    None => break,
                }
            } else {
                match operand(op) {
                    Some(kind) => (kind, offset + 1),
                    None => break,
                }
            };
            offset = match kind {
                Operand::Bare => start,
                Operand::Byte => start + 1,
                Operand::Short => start + 2,
                Operand::Int => start + 4,
                Operand::Long => start + 8,
                Operand::Token => {
                    let Some(value) = read_u32(code, start) else {
                        break;
                    };
                    tokens.push((start, Token::from_value(value)));
                    start + 4
                }
                Operand::Switch => {
                    let Some(targets) = read_u32(code, start) else {
                        break;
                    };
                    start + 4 + 4 * targets as usize
                }
            };
        }
        tokens
    }

    /// Every metadata token the code refers to
    pub fn referenced_tokens(&self) -> Vec<Token> {
        self.token_operands().into_iter().map(|(_, t)| t).collect()
    }

    /// Overwrites the token operand at `offset`
    pub fn patch_token(&mut self, offset: usize, token: Token) {
        if let Some(slot) = self.code.get_mut(offset..offset + 4) {
            slot.copy_from_slice(&token.value().to_le_bytes());
        }
    }
}
