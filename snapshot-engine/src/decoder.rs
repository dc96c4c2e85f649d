use crate::error::{EngineError, EngineResult};
use snapshot_wire::Opcode;

/// A decoded operation, opcode plus its fixed-width operands, per the
/// bytecode wire format's operand widths.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Call { pc: u32 },
    Return,
    Jump { pc: u32 },
    CondJump { pc: u32 },
    PushImm { v: u32 },
    Pop,
    Decrement,
    SetOffset,
    PushOffset,
    ShiftOffset { k: u32 },
    ZeroFill { n: u32 },
    PushSliceLen { elem_byte_len: u32 },
    DereferenceCfaOffset { off: i32, n: u32, bias: u32 },
    CopyFromRegister { r: u16 },
    PrepareFrameData { prog_id: u32, byte_len: u32, type_id: u32 },
    EnqueuePointer { elem_type: u32 },
    EnqueueBiasedPointer { elem_type: u32, bias: u32 },
    EnqueueSliceHeader { array_type: u32, elem_byte_len: u32 },
    EnqueueStringHeader { data_type: u32 },
    EnqueueMapHeader {
        bucket_arr_type: u32,
        bucket_byte_len: u32,
        flags_off: u8,
        b_off: u8,
        buckets_off: u8,
        old_buckets_off: u8,
    },
    EnqueueInterface,
    EnqueueEmptyInterface,
}

/// A cursor over a fixed bytecode sequence. Owns no state beyond the
/// cursor itself; the bytecode buffer is borrowed for the lifetime of a
/// decode.
pub struct Decoder<'a> {
    code: &'a [u8],
    pc: u32,
}

impl<'a> Decoder<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        Self { code, pc: 0 }
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Moves the cursor to `pc`, failing if it is outside the bytecode.
    pub fn set_pc(&mut self, pc: u32) -> EngineResult<()> {
        if (pc as usize) > self.code.len() {
            return Err(EngineError::DecoderOutOfRange);
        }
        self.pc = pc;
        Ok(())
    }

    fn read_bytes(&mut self, n: usize) -> EngineResult<&'a [u8]> {
        let start = self.pc as usize;
        let end = start.checked_add(n).ok_or(EngineError::DecoderOutOfRange)?;
        if end > self.code.len() {
            return Err(EngineError::DecoderOutOfRange);
        }
        self.pc = end as u32;
        Ok(&self.code[start..end])
    }

    fn read_u32(&mut self) -> EngineResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_u16(&mut self) -> EngineResult<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes(b.try_into().unwrap()))
    }

    fn read_u8(&mut self) -> EngineResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Reads one opcode byte and its fixed-width payload, advancing `pc`
    /// by exactly the payload width. An opcode byte outside the known
    /// table terminates decoding with `UnknownOpcode`.
    pub fn pop_opcode(&mut self) -> EngineResult<Operation> {
        let op_byte = self.read_u8()?;
        let op = Opcode::from_byte(op_byte).ok_or(EngineError::UnknownOpcode)?;
        self.decode_operands(op)
    }

    /// Decodes the next operation without advancing the cursor.
    pub fn peek_op(&self) -> EngineResult<Operation> {
        let mut probe = Decoder {
            code: self.code,
            pc: self.pc,
        };
        probe.pop_opcode()
    }

    fn decode_operands(&mut self, op: Opcode) -> EngineResult<Operation> {
        Ok(match op {
            Opcode::Call => Operation::Call { pc: self.read_u32()? },
            Opcode::Return => Operation::Return,
            Opcode::Jump => Operation::Jump { pc: self.read_u32()? },
            Opcode::CondJump => Operation::CondJump { pc: self.read_u32()? },
            Opcode::PushImm => Operation::PushImm { v: self.read_u32()? },
            Opcode::Pop => Operation::Pop,
            Opcode::Decrement => Operation::Decrement,
            Opcode::SetOffset => Operation::SetOffset,
            Opcode::PushOffset => Operation::PushOffset,
            Opcode::ShiftOffset => Operation::ShiftOffset { k: self.read_u32()? },
            Opcode::ZeroFill => Operation::ZeroFill { n: self.read_u32()? },
            Opcode::PushSliceLen => Operation::PushSliceLen {
                elem_byte_len: self.read_u32()?,
            },
            Opcode::DereferenceCfaOffset => {
                let off = self.read_u32()? as i32;
                let n = self.read_u32()?;
                let bias = self.read_u32()?;
                Operation::DereferenceCfaOffset { off, n, bias }
            }
            Opcode::CopyFromRegister => Operation::CopyFromRegister { r: self.read_u16()? },
            Opcode::PrepareFrameData => {
                let prog_id = self.read_u32()?;
                let byte_len = self.read_u32()?;
                let type_id = self.read_u32()?;
                Operation::PrepareFrameData {
                    prog_id,
                    byte_len,
                    type_id,
                }
            }
            Opcode::EnqueuePointer => Operation::EnqueuePointer {
                elem_type: self.read_u32()?,
            },
            Opcode::EnqueueBiasedPointer => {
                let elem_type = self.read_u32()?;
                let bias = self.read_u32()?;
                Operation::EnqueueBiasedPointer { elem_type, bias }
            }
            Opcode::EnqueueSliceHeader => {
                let array_type = self.read_u32()?;
                let elem_byte_len = self.read_u32()?;
                Operation::EnqueueSliceHeader {
                    array_type,
                    elem_byte_len,
                }
            }
            Opcode::EnqueueStringHeader => Operation::EnqueueStringHeader {
                data_type: self.read_u32()?,
            },
            Opcode::EnqueueMapHeader => {
                let bucket_arr_type = self.read_u32()?;
                let bucket_byte_len = self.read_u32()?;
                let flags_off = self.read_u8()?;
                let b_off = self.read_u8()?;
                let buckets_off = self.read_u8()?;
                let old_buckets_off = self.read_u8()?;
                Operation::EnqueueMapHeader {
                    bucket_arr_type,
                    bucket_byte_len,
                    flags_off,
                    b_off,
                    buckets_off,
                    old_buckets_off,
                }
            }
            Opcode::EnqueueInterface => Operation::EnqueueInterface,
            Opcode::EnqueueEmptyInterface => Operation::EnqueueEmptyInterface,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_push_imm(v: u32) -> Vec<u8> {
        let mut out = vec![Opcode::PushImm as u8];
        out.extend_from_slice(&v.to_le_bytes());
        out
    }

    #[test]
    fn decodes_push_imm_and_advances_pc() {
        let code = encode_push_imm(0xdead_beef);
        let mut dec = Decoder::new(&code);
        assert_eq!(dec.pc(), 0);
        let op = dec.pop_opcode().unwrap();
        assert_eq!(op, Operation::PushImm { v: 0xdead_beef });
        assert_eq!(dec.pc(), 5);
    }

    #[test]
    fn peek_does_not_advance() {
        let code = encode_push_imm(7);
        let mut dec = Decoder::new(&code);
        let peeked = dec.peek_op().unwrap();
        assert_eq!(dec.pc(), 0);
        let popped = dec.pop_opcode().unwrap();
        assert_eq!(peeked, popped);
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let code = [255u8];
        let mut dec = Decoder::new(&code);
        assert_eq!(dec.pop_opcode().unwrap_err(), EngineError::UnknownOpcode);
    }

    #[test]
    fn truncated_operand_is_out_of_range() {
        let code = [Opcode::PushImm as u8, 1, 2];
        let mut dec = Decoder::new(&code);
        assert_eq!(dec.pop_opcode().unwrap_err(), EngineError::DecoderOutOfRange);
    }

    #[test]
    fn set_pc_rejects_out_of_bounds() {
        let code = encode_push_imm(1);
        let mut dec = Decoder::new(&code);
        assert!(dec.set_pc(5).is_ok());
        assert_eq!(dec.set_pc(6).unwrap_err(), EngineError::DecoderOutOfRange);
    }

    #[test]
    fn decodes_enqueue_map_header_twelve_byte_payload() {
        let mut code = vec![Opcode::EnqueueMapHeader as u8];
        code.extend_from_slice(&7u32.to_le_bytes());
        code.extend_from_slice(&48u32.to_le_bytes());
        code.extend_from_slice(&[1, 2, 3, 4]);
        let mut dec = Decoder::new(&code);
        let op = dec.pop_opcode().unwrap();
        assert_eq!(
            op,
            Operation::EnqueueMapHeader {
                bucket_arr_type: 7,
                bucket_byte_len: 48,
                flags_off: 1,
                b_off: 2,
                buckets_off: 3,
                old_buckets_off: 4,
            }
        );
        assert_eq!(dec.pc(), code.len() as u32);
    }
}
