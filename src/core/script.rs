//! Purpose: Decompile witness scripts into a flat opcode/data-push sequence.
//! Exports: `ScriptItem`, `decompile`, opcode constants.
//! Role: Input to envelope location and field parsing.
//! Invariants: Pushes with a one-opcode encoding are folded into that opcode.
//! Invariants: `ScriptItem::data` recovers the pushed bytes of folded items.
use bitcoin::script::{Instruction, Script};

use crate::core::error::{Error, ErrorKind};

pub const OP_0: u8 = 0x00;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_IF: u8 = 0x63;
pub const OP_ENDIF: u8 = 0x68;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ScriptItem {
    Op(u8),
    Push(Vec<u8>),
}

impl ScriptItem {
    /// Pushes with a one-opcode encoding become that opcode, so markers compare by opcode.
    fn from_push(bytes: &[u8]) -> Self {
        match bytes {
            [] => ScriptItem::Op(OP_0),
            [n @ 1..=16] => ScriptItem::Op(OP_1 - 1 + n),
            [0x81] => ScriptItem::Op(OP_1NEGATE),
            _ => ScriptItem::Push(bytes.to_vec()),
        }
    }

    pub fn is_op(&self, op: u8) -> bool {
        matches!(self, ScriptItem::Op(candidate) if *candidate == op)
    }

    pub fn as_push(&self) -> Option<&[u8]> {
        match self {
            ScriptItem::Push(bytes) => Some(bytes),
            ScriptItem::Op(_) => None,
        }
    }

    /// Data carried by the item, undoing the opcode folding for small pushes.
    pub fn data(&self) -> Option<Vec<u8>> {
        match self {
            ScriptItem::Push(bytes) => Some(bytes.clone()),
            ScriptItem::Op(OP_0) => Some(Vec::new()),
            ScriptItem::Op(OP_1NEGATE) => Some(vec![0x81]),
            ScriptItem::Op(op @ OP_1..=OP_16) => Some(vec![op - OP_1 + 1]),
            ScriptItem::Op(_) => None,
        }
    }
}

pub fn decompile(script: &[u8]) -> Result<Vec<ScriptItem>, Error> {
    let mut items = Vec::new();
    for instruction in Script::from_bytes(script).instructions() {
        let instruction = instruction.map_err(|err| {
            Error::new(ErrorKind::EnvelopeDecode)
                .with_message("witness script does not decompile")
                .with_raw(script)
                .with_source(err)
        })?;
        let item = match instruction {
            Instruction::Op(op) => ScriptItem::Op(op.to_u8()),
            Instruction::PushBytes(bytes) => ScriptItem::from_push(bytes.as_bytes()),
        };
        items.push(item);
    }
    Ok(items)
}
