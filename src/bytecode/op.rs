use smallvec::SmallVec;
use thiserror::Error;

// =============================================================================
// OPCODES - one byte each, operands follow as big-endian unsigned integers
// =============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // control
    Nop = 0,
    Halt = 1,
    PopTop = 2,
    Print = 3,

    // literals
    Nil = 4,
    True = 5,
    False = 6,
    LoadConst = 7,

    // variables
    LoadFast = 8,
    StoreFast = 9,
    LoadGlobal = 10,
    StoreGlobal = 11,
    LoadName = 12,
    StoreName = 13,
    LoadFree = 14,
    StoreFree = 15,
    MakeCell = 16,
    LoadClosure = 17,

    // containers and attributes
    BuildList = 18,
    BuildMap = 19,
    BuildSet = 20,
    BinarySubscr = 21,
    StoreSubscr = 22,
    DeleteSubscr = 23,
    LoadAttr = 24,
    StoreAttr = 25,

    // arithmetic / logic
    BinaryOp = 26,
    CompareOp = 27,
    UnaryNegative = 28,
    UnaryNot = 29,
    UnaryInvert = 30,
    UnaryPositive = 31,

    // jumps
    JumpForward = 32,
    JumpBackward = 33,
    PopJumpForwardIfTrue = 34,
    PopJumpForwardIfFalse = 35,
    PopJumpBackwardIfTrue = 36,
    PopJumpBackwardIfFalse = 37,

    // calls
    Call = 38,
    ReturnValue = 39,
}

impl Opcode {
    /// Every defined opcode, in byte order.
    pub const ALL: [Opcode; 40] = [
        Opcode::Nop,
        Opcode::Halt,
        Opcode::PopTop,
        Opcode::Print,
        Opcode::Nil,
        Opcode::True,
        Opcode::False,
        Opcode::LoadConst,
        Opcode::LoadFast,
        Opcode::StoreFast,
        Opcode::LoadGlobal,
        Opcode::StoreGlobal,
        Opcode::LoadName,
        Opcode::StoreName,
        Opcode::LoadFree,
        Opcode::StoreFree,
        Opcode::MakeCell,
        Opcode::LoadClosure,
        Opcode::BuildList,
        Opcode::BuildMap,
        Opcode::BuildSet,
        Opcode::BinarySubscr,
        Opcode::StoreSubscr,
        Opcode::DeleteSubscr,
        Opcode::LoadAttr,
        Opcode::StoreAttr,
        Opcode::BinaryOp,
        Opcode::CompareOp,
        Opcode::UnaryNegative,
        Opcode::UnaryNot,
        Opcode::UnaryInvert,
        Opcode::UnaryPositive,
        Opcode::JumpForward,
        Opcode::JumpBackward,
        Opcode::PopJumpForwardIfTrue,
        Opcode::PopJumpForwardIfFalse,
        Opcode::PopJumpBackwardIfTrue,
        Opcode::PopJumpBackwardIfFalse,
        Opcode::Call,
        Opcode::ReturnValue,
    ];

    pub fn from_byte(byte: u8) -> Option<Opcode> {
        Opcode::ALL.get(byte as usize).copied()
    }

    pub fn info(self) -> &'static OpInfo {
        describe(self as u8)
    }

    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::JumpForward
                | Opcode::JumpBackward
                | Opcode::PopJumpForwardIfTrue
                | Opcode::PopJumpForwardIfFalse
                | Opcode::PopJumpBackwardIfTrue
                | Opcode::PopJumpBackwardIfFalse
        )
    }

    pub fn is_backward_jump(self) -> bool {
        matches!(
            self,
            Opcode::JumpBackward | Opcode::PopJumpBackwardIfTrue | Opcode::PopJumpBackwardIfFalse
        )
    }
}

/// Operator selected by the `BINARY_OP` operand.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOpType {
    Add = 1,
    Subtract = 2,
    Multiply = 3,
    Divide = 4,
    Modulo = 5,
    And = 6,
    Or = 7,
    Xor = 8,
    Power = 9,
    LShift = 10,
    RShift = 11,
}

impl BinaryOpType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use BinaryOpType::*;
        Some(match byte {
            1 => Add,
            2 => Subtract,
            3 => Multiply,
            4 => Divide,
            5 => Modulo,
            6 => And,
            7 => Or,
            8 => Xor,
            9 => Power,
            10 => LShift,
            11 => RShift,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        use BinaryOpType::*;
        match self {
            Add => "+",
            Subtract => "-",
            Multiply => "*",
            Divide => "/",
            Modulo => "%",
            And => "&",
            Or => "|",
            Xor => "^",
            Power => "**",
            LShift => "<<",
            RShift => ">>",
        }
    }
}

/// Comparison selected by the `COMPARE_OP` operand.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOpType {
    LessThan = 1,
    LessThanOrEqual = 2,
    Equal = 3,
    NotEqual = 4,
    GreaterThan = 5,
    GreaterThanOrEqual = 6,
}

impl CompareOpType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        use CompareOpType::*;
        Some(match byte {
            1 => LessThan,
            2 => LessThanOrEqual,
            3 => Equal,
            4 => NotEqual,
            5 => GreaterThan,
            6 => GreaterThanOrEqual,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        use CompareOpType::*;
        match self {
            LessThan => "<",
            LessThanOrEqual => "<=",
            Equal => "==",
            NotEqual => "!=",
            GreaterThan => ">",
            GreaterThanOrEqual => ">=",
        }
    }
}

// =============================================================================
// OPCODE TABLE
// =============================================================================

/// Static metadata for one opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub name: &'static str,
    pub operand_widths: &'static [usize],
}

impl OpInfo {
    /// Entry for bytes that do not name an opcode.
    pub const UNDEFINED: OpInfo = OpInfo {
        name: "",
        operand_widths: &[],
    };

    const fn new(name: &'static str, operand_widths: &'static [usize]) -> Self {
        OpInfo {
            name,
            operand_widths,
        }
    }

    pub fn operand_count(&self) -> usize {
        self.operand_widths.len()
    }

    pub fn is_defined(&self) -> bool {
        !self.name.is_empty()
    }

    /// Total encoded size: opcode byte plus operand bytes.
    pub fn size(&self) -> usize {
        1 + self.operand_widths.iter().sum::<usize>()
    }
}

const fn build_table() -> [OpInfo; 256] {
    use Opcode::*;
    let mut t = [OpInfo::UNDEFINED; 256];
    t[Nop as usize] = OpInfo::new("NOP", &[]);
    t[Halt as usize] = OpInfo::new("HALT", &[]);
    t[PopTop as usize] = OpInfo::new("POP_TOP", &[]);
    t[Print as usize] = OpInfo::new("PRINT", &[]);
    t[Nil as usize] = OpInfo::new("NIL", &[]);
    t[True as usize] = OpInfo::new("TRUE", &[]);
    t[False as usize] = OpInfo::new("FALSE", &[]);
    t[LoadConst as usize] = OpInfo::new("LOAD_CONST", &[2]);
    t[LoadFast as usize] = OpInfo::new("LOAD_FAST", &[2]);
    t[StoreFast as usize] = OpInfo::new("STORE_FAST", &[2]);
    t[LoadGlobal as usize] = OpInfo::new("LOAD_GLOBAL", &[2]);
    t[StoreGlobal as usize] = OpInfo::new("STORE_GLOBAL", &[2]);
    t[LoadName as usize] = OpInfo::new("LOAD_NAME", &[2]);
    t[StoreName as usize] = OpInfo::new("STORE_NAME", &[2]);
    t[LoadFree as usize] = OpInfo::new("LOAD_FREE", &[2]);
    t[StoreFree as usize] = OpInfo::new("STORE_FREE", &[2]);
    t[MakeCell as usize] = OpInfo::new("MAKE_CELL", &[2, 1]);
    t[LoadClosure as usize] = OpInfo::new("LOAD_CLOSURE", &[2, 2]);
    t[BuildList as usize] = OpInfo::new("BUILD_LIST", &[2]);
    t[BuildMap as usize] = OpInfo::new("BUILD_MAP", &[2]);
    t[BuildSet as usize] = OpInfo::new("BUILD_SET", &[2]);
    t[BinarySubscr as usize] = OpInfo::new("BINARY_SUBSCR", &[]);
    t[StoreSubscr as usize] = OpInfo::new("STORE_SUBSCR", &[]);
    t[DeleteSubscr as usize] = OpInfo::new("DELETE_SUBSCR", &[]);
    t[LoadAttr as usize] = OpInfo::new("LOAD_ATTR", &[2]);
    t[StoreAttr as usize] = OpInfo::new("STORE_ATTR", &[2]);
    t[BinaryOp as usize] = OpInfo::new("BINARY_OP", &[1]);
    t[CompareOp as usize] = OpInfo::new("COMPARE_OP", &[1]);
    t[UnaryNegative as usize] = OpInfo::new("UNARY_NEGATIVE", &[]);
    t[UnaryNot as usize] = OpInfo::new("UNARY_NOT", &[]);
    t[UnaryInvert as usize] = OpInfo::new("UNARY_INVERT", &[]);
    t[UnaryPositive as usize] = OpInfo::new("UNARY_POSITIVE", &[]);
    t[JumpForward as usize] = OpInfo::new("JUMP_FORWARD", &[2]);
    t[JumpBackward as usize] = OpInfo::new("JUMP_BACKWARD", &[2]);
    t[PopJumpForwardIfTrue as usize] = OpInfo::new("POP_JUMP_FORWARD_IF_TRUE", &[2]);
    t[PopJumpForwardIfFalse as usize] = OpInfo::new("POP_JUMP_FORWARD_IF_FALSE", &[2]);
    t[PopJumpBackwardIfTrue as usize] = OpInfo::new("POP_JUMP_BACKWARD_IF_TRUE", &[2]);
    t[PopJumpBackwardIfFalse as usize] = OpInfo::new("POP_JUMP_BACKWARD_IF_FALSE", &[2]);
    t[Call as usize] = OpInfo::new("CALL", &[1]);
    t[ReturnValue as usize] = OpInfo::new("RETURN_VALUE", &[1]);
    t
}

/// Opcode metadata indexed by opcode byte.
pub static OPCODES: [OpInfo; 256] = build_table();

/// O(1) lookup of an opcode byte's metadata.
pub fn describe(byte: u8) -> &'static OpInfo {
    &OPCODES[byte as usize]
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{byte:02x} at offset {offset}")]
    UnknownOpcode { offset: usize, byte: u8 },

    #[error("truncated {name} at offset {offset}: needs {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        name: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("invalid operator {operator} for {name} at offset {offset}")]
    InvalidOperator {
        offset: usize,
        name: &'static str,
        operator: usize,
    },

    #[error("instruction pointer {offset} is outside the code ({len} bytes)")]
    OutOfBounds { offset: usize, len: usize },
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op: Opcode,
    pub operands: SmallVec<[usize; 2]>,
    /// Encoded length in bytes.
    pub len: usize,
}

impl Instruction {
    pub fn operand(&self, i: usize) -> usize {
        self.operands.get(i).copied().unwrap_or(0)
    }

    /// Absolute target of a jump instruction decoded at `offset`.
    pub fn jump_target(&self, offset: usize) -> Option<usize> {
        if !self.op.is_jump() {
            return None;
        }
        let next = offset + self.len;
        if self.op.is_backward_jump() {
            next.checked_sub(self.operand(0))
        } else {
            Some(next + self.operand(0))
        }
    }
}

/// Encode an instruction. Operands are truncated to their declared width.
pub fn make(op: Opcode, operands: &[usize]) -> Vec<u8> {
    let info = op.info();
    let mut out = Vec::with_capacity(info.size());
    out.push(op as u8);
    for (i, width) in info.operand_widths.iter().enumerate() {
        let value = operands.get(i).copied().unwrap_or(0);
        match width {
            1 => out.push(value as u8),
            2 => out.extend_from_slice(&(value as u16).to_be_bytes()),
            _ => unreachable!("operand widths are 1 or 2 bytes"),
        }
    }
    out
}

/// Decode the instruction starting at `pos`.
///
/// Consumes exactly `1 + sum(operand_widths)` bytes on success.
pub fn decode(code: &[u8], pos: usize) -> Result<Instruction, DecodeError> {
    let byte = *code.get(pos).ok_or(DecodeError::OutOfBounds {
        offset: pos,
        len: code.len(),
    })?;
    let op = Opcode::from_byte(byte).ok_or(DecodeError::UnknownOpcode { offset: pos, byte })?;
    let info = op.info();

    let needed = info.size() - 1;
    let available = code.len() - pos - 1;
    if available < needed {
        return Err(DecodeError::Truncated {
            offset: pos,
            name: info.name,
            needed,
            available,
        });
    }

    let mut operands = SmallVec::new();
    let mut cursor = pos + 1;
    for width in info.operand_widths {
        let value = match width {
            1 => code[cursor] as usize,
            _ => u16::from_be_bytes([code[cursor], code[cursor + 1]]) as usize,
        };
        operands.push(value);
        cursor += width;
    }

    let instruction = Instruction {
        op,
        operands,
        len: cursor - pos,
    };

    match op {
        Opcode::BinaryOp if BinaryOpType::from_byte(instruction.operand(0) as u8).is_none() => {
            Err(DecodeError::InvalidOperator {
                offset: pos,
                name: info.name,
                operator: instruction.operand(0),
            })
        }
        Opcode::CompareOp if CompareOpType::from_byte(instruction.operand(0) as u8).is_none() => {
            Err(DecodeError::InvalidOperator {
                offset: pos,
                name: info.name,
                operator: instruction.operand(0),
            })
        }
        _ => Ok(instruction),
    }
}

/// Iterate over `(offset, instruction)` pairs of a code slice.
pub fn instructions(code: &[u8]) -> impl Iterator<Item = Result<(usize, Instruction), DecodeError>> + '_ {
    let mut pos = 0;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed || pos >= code.len() {
            return None;
        }
        match decode(code, pos) {
            Ok(ins) => {
                let at = pos;
                pos += ins.len;
                Some(Ok((at, ins)))
            }
            Err(e) => {
                failed = true;
                Some(Err(e))
            }
        }
    })
}
