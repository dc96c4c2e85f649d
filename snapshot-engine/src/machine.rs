use crate::buffer::OutputBuffer;
use crate::collaborators::TargetMemory;
use crate::decoder::{Decoder, Operation};
use crate::error::{EngineError, EngineResult};
use crate::metrics::EngineMetrics;
use crate::queue::{QueueEntry, WorkQueue};
use crate::type_resolver::{RuntimeTypeResolver, TypeIdResolver};

/// How a `StackMachine::run` call ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Ran to a `Return` with an empty call stack.
    Completed,
    /// A soft failure (bad dereference, unknown opcode, decoder out of
    /// range, operand stack misuse) aborted this program only. Prior
    /// output and queue entries from this or earlier programs stand.
    Aborted,
    /// The output buffer went full mid-program. The caller is expected to
    /// truncate back to the start of whatever record is in flight.
    BufferFull,
}

/// The collaborators and ephemeral stores a single `run` call touches.
/// Borrowed for the duration of the call; the machine itself owns none of
/// these, matching the snapshotter's exclusive ownership of all ephemeral
/// snapshot state.
pub struct MachineContext<'a> {
    pub code: &'a [u8],
    pub mem: &'a dyn TargetMemory,
    pub queue: &'a mut WorkQueue,
    pub out: &'a mut OutputBuffer,
    pub type_resolver: &'a mut RuntimeTypeResolver,
    pub type_id_resolver: &'a TypeIdResolver,
    pub metrics: &'a EngineMetrics,
}

/// Maximum field width `DereferenceCfaOffset` will copy in one step,
/// sized generously above a pointer/interface word pair. Bounding it
/// lets the read land in a stack-local buffer instead of allocating
/// inside the stopped-world window.
const MAX_DEREFERENCE_WIDTH: usize = 64;

/// Executes precompiled bytecode against frame or queue-entry memory.
///
/// Holds an operand stack of 64-bit words, a call stack of return
/// addresses, an **offset** register, and a small fixed register file for
/// `CopyFromRegister`. All three are cleared and the offset register
/// reprimed at the start of every `run`, so one `StackMachine` instance is
/// reused across every frame and queue entry in a snapshot.
///
/// The offset register doubles as the "current offset" the opcode table
/// refers to: `ZeroFill` reserves a window of output bytes and points the
/// register at its start; `DereferenceCfaOffset`/`CopyFromRegister` write
/// into that window (optionally after `ShiftOffset` walks further into
/// it); enqueue opcodes record the register's current value as
/// `parent_offset` so a downstream reader can stitch the pointer graph to
/// the struct it came from.
pub struct StackMachine {
    operand_stack: Vec<u64>,
    max_operand_stack_depth: usize,
    call_stack: Vec<u32>,
    offset: u32,
    registers: [u64; 4],
}

impl StackMachine {
    pub fn with_operand_stack_depth(max_operand_stack_depth: usize) -> Self {
        Self {
            operand_stack: Vec::with_capacity(max_operand_stack_depth),
            max_operand_stack_depth,
            call_stack: Vec::with_capacity(max_operand_stack_depth),
            offset: 0,
            registers: [0; 4],
        }
    }

    /// Seeds the register file `CopyFromRegister` reads from. The stop-
    /// the-world collaborator does not currently expose captured register
    /// state, so callers that have nothing to seed may simply skip this;
    /// `CopyFromRegister` then copies zero bytes.
    pub fn set_registers(&mut self, registers: [u64; 4]) {
        self.registers = registers;
    }

    fn push_operand(&mut self, v: u64) -> EngineResult<()> {
        if self.operand_stack.len() >= self.max_operand_stack_depth {
            return Err(EngineError::OperandStackOverflow);
        }
        self.operand_stack.push(v);
        Ok(())
    }

    fn pop_operand(&mut self) -> EngineResult<u64> {
        self.operand_stack
            .pop()
            .ok_or(EngineError::OperandStackUnderflow)
    }

    fn read_exact(&self, ctx: &MachineContext, addr: u64, buf: &mut [u8]) -> EngineResult<()> {
        if ctx.mem.try_read(addr, buf) {
            Ok(())
        } else {
            ctx.metrics.inc_bad_dereference();
            Err(EngineError::BadDereference)
        }
    }

    fn enqueue(&self, ctx: &mut MachineContext, entry: QueueEntry) {
        if !ctx.queue.push(entry) {
            ctx.metrics.inc_queue_overflow();
        }
    }

    /// Runs the program at `entry_pc` against `fp`, priming the offset
    /// register to `base_offset`. `frame_idx` identifies the originating
    /// stack frame purely for tracing; the opcode table never reads it.
    pub fn run(
        &mut self,
        ctx: &mut MachineContext,
        entry_pc: u32,
        fp: u64,
        frame_idx: u32,
        base_offset: u32,
    ) -> RunOutcome {
        self.operand_stack.clear();
        self.call_stack.clear();
        self.offset = base_offset;

        let mut decoder = Decoder::new(ctx.code);
        if decoder.set_pc(entry_pc).is_err() {
            return RunOutcome::Aborted;
        }

        log::trace!(
            "stack machine: frame {frame_idx} entering pc {entry_pc} fp {fp:#x} base_offset {base_offset}"
        );

        loop {
            let op = match decoder.pop_opcode() {
                Ok(op) => op,
                Err(_) => return RunOutcome::Aborted,
            };
            match self.step(ctx, &mut decoder, fp, op) {
                Ok(true) => return RunOutcome::Completed,
                Ok(false) => continue,
                Err(EngineError::BufferFull) => return RunOutcome::BufferFull,
                Err(_) => return RunOutcome::Aborted,
            }
        }
    }

    /// Executes one decoded operation. Returns `Ok(true)` when the program
    /// has reached its natural end (an unmatched `Return`).
    fn step(
        &mut self,
        ctx: &mut MachineContext,
        decoder: &mut Decoder,
        fp: u64,
        op: Operation,
    ) -> EngineResult<bool> {
        match op {
            Operation::Call { pc } => {
                self.call_stack.push(decoder.pc());
                decoder.set_pc(pc)?;
            }
            Operation::Return => match self.call_stack.pop() {
                Some(ret) => decoder.set_pc(ret)?,
                None => return Ok(true),
            },
            Operation::Jump { pc } => decoder.set_pc(pc)?,
            Operation::CondJump { pc } => {
                if self.pop_operand()? != 0 {
                    decoder.set_pc(pc)?;
                }
            }
            Operation::PushImm { v } => self.push_operand(v as u64)?,
            Operation::Pop => {
                self.pop_operand()?;
            }
            Operation::Decrement => {
                let v = self.pop_operand()?;
                self.push_operand(v.wrapping_sub(1))?;
            }
            Operation::SetOffset => {
                let v = self.pop_operand()?;
                self.offset = v as u32;
            }
            Operation::PushOffset => self.push_operand(self.offset as u64)?,
            Operation::ShiftOffset { k } => self.offset = self.offset.wrapping_add(k),
            Operation::ZeroFill { n } => {
                self.offset = ctx.out.zero_fill(n as usize)?;
            }
            Operation::PushSliceLen { elem_byte_len } => {
                let len = self.pop_operand()?;
                self.push_operand(len.saturating_mul(elem_byte_len as u64))?;
            }
            Operation::DereferenceCfaOffset { off, n, bias } => {
                self.dereference_cfa_offset(ctx, fp, off, n, bias)?;
            }
            Operation::CopyFromRegister { r } => {
                let v = self.registers[r as usize % self.registers.len()];
                ctx.out.write_at(self.offset, &v.to_le_bytes())?;
            }
            Operation::PrepareFrameData {
                prog_id,
                byte_len,
                type_id,
            } => {
                ctx.out.write_frame_data_header(&snapshot_wire::FrameDataHeader {
                    prog_id,
                    type_id,
                    byte_len,
                })?;
            }
            Operation::EnqueuePointer { elem_type } => {
                let addr = self.pop_operand()?;
                self.enqueue(
                    ctx,
                    QueueEntry {
                        addr,
                        type_id: elem_type,
                        len: 0,
                        parent_offset: self.offset,
                    },
                );
            }
            Operation::EnqueueBiasedPointer { elem_type, bias } => {
                let addr = self.pop_operand()?.wrapping_sub(bias as u64);
                self.enqueue(
                    ctx,
                    QueueEntry {
                        addr,
                        type_id: elem_type,
                        len: 0,
                        parent_offset: self.offset,
                    },
                );
            }
            Operation::EnqueueSliceHeader {
                array_type,
                elem_byte_len,
            } => {
                let length = self.pop_operand()?;
                let data_ptr = self.pop_operand()?;
                let byte_len = length.saturating_mul(elem_byte_len as u64).min(u32::MAX as u64);
                self.enqueue(
                    ctx,
                    QueueEntry {
                        addr: data_ptr,
                        type_id: array_type,
                        len: byte_len as u32,
                        parent_offset: self.offset,
                    },
                );
            }
            Operation::EnqueueStringHeader { data_type } => {
                let length = self.pop_operand()?;
                let data_ptr = self.pop_operand()?;
                self.enqueue(
                    ctx,
                    QueueEntry {
                        addr: data_ptr,
                        type_id: data_type,
                        len: length.min(u32::MAX as u64) as u32,
                        parent_offset: self.offset,
                    },
                );
            }
            Operation::EnqueueMapHeader {
                bucket_arr_type,
                bucket_byte_len,
                flags_off,
                b_off,
                buckets_off,
                old_buckets_off,
            } => {
                self.enqueue_map_header(
                    ctx,
                    bucket_arr_type,
                    bucket_byte_len,
                    flags_off,
                    b_off,
                    buckets_off,
                    old_buckets_off,
                )?;
            }
            Operation::EnqueueInterface => self.enqueue_interface_like(ctx)?,
            Operation::EnqueueEmptyInterface => self.enqueue_interface_like(ctx)?,
        }
        Ok(false)
    }

    fn dereference_cfa_offset(
        &mut self,
        ctx: &mut MachineContext,
        fp: u64,
        off: i32,
        n: u32,
        bias: u32,
    ) -> EngineResult<()> {
        let n = n as usize;
        if n > MAX_DEREFERENCE_WIDTH {
            return Err(EngineError::DecoderOutOfRange);
        }
        let addr = (fp as i64).wrapping_add(off as i64) as u64;
        let mut buf = [0u8; MAX_DEREFERENCE_WIDTH];
        self.read_exact(ctx, addr, &mut buf[..n])?;
        ctx.out.write_at(self.offset, &buf[..n])?;

        // Only a pointer-width read with a non-zero bias is meant to feed
        // a following enqueue opcode; a plain struct-field copy (bias 0)
        // leaves the operand stack untouched.
        if bias != 0 && n >= 8 {
            let raw = u64::from_le_bytes(buf[0..8].try_into().unwrap());
            self.push_operand(raw.wrapping_sub(bias as u64))?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_map_header(
        &mut self,
        ctx: &mut MachineContext,
        bucket_arr_type: u32,
        bucket_byte_len: u32,
        flags_off: u8,
        b_off: u8,
        buckets_off: u8,
        old_buckets_off: u8,
    ) -> EngineResult<()> {
        let map_addr = self.pop_operand()?;

        let mut flags_buf = [0u8; 1];
        self.read_exact(ctx, map_addr + flags_off as u64, &mut flags_buf)?;
        let mut b_buf = [0u8; 1];
        self.read_exact(ctx, map_addr + b_off as u64, &mut b_buf)?;
        let b = b_buf[0];

        let buckets = self
            .read_exact_u64(ctx, map_addr + buckets_off as u64)?;
        let old_buckets = self
            .read_exact_u64(ctx, map_addr + old_buckets_off as u64)?;

        let num_buckets = 1u64 << b;
        let byte_len = num_buckets.saturating_mul(bucket_byte_len as u64).min(u32::MAX as u64);
        self.enqueue(
            ctx,
            QueueEntry {
                addr: buckets,
                type_id: bucket_arr_type,
                len: byte_len as u32,
                parent_offset: self.offset,
            },
        );

        if old_buckets != 0 {
            // Go's map growth halves the old table relative to the live
            // one (never below a single bucket).
            let old_num_buckets = (num_buckets / 2).max(1);
            let old_byte_len = old_num_buckets
                .saturating_mul(bucket_byte_len as u64)
                .min(u32::MAX as u64);
            self.enqueue(
                ctx,
                QueueEntry {
                    addr: old_buckets,
                    type_id: bucket_arr_type,
                    len: old_byte_len as u32,
                    parent_offset: self.offset,
                },
            );
        }
        Ok(())
    }

    fn read_exact_u64(&self, ctx: &mut MachineContext, addr: u64) -> EngineResult<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(ctx, addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn enqueue_interface_like(&mut self, ctx: &mut MachineContext) -> EngineResult<()> {
        let type_ptr = self.pop_operand()?;
        let data_ptr = self.pop_operand()?;
        let resolved_offset = ctx.type_resolver.resolve(ctx.mem, type_ptr);
        let type_id = ctx.type_id_resolver.resolve(resolved_offset);
        if type_id != 0 {
            self.enqueue(
                ctx,
                QueueEntry {
                    addr: data_ptr,
                    type_id,
                    len: 0,
                    parent_offset: self.offset,
                },
            );
        }
        Ok(())
    }
}
