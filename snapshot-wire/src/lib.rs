//! Wire-format definitions shared between the snapshot engine and the
//! offline bytecode compiler.
//!
//! Everything here is `#[repr(C)]` and implements `bytemuck::{Pod, Zeroable}`
//! so the engine can write these structs directly into the output buffer
//! with a single `bytemuck::bytes_of` call, with no manual byte shuffling
//! and no serde round trip in the stopped-world hot path.

#![forbid(unsafe_code)]

use bytemuck::{Pod, Zeroable};

/// Magic bytes identifying a snapshot buffer (`"SNAP"` as little-endian u32).
pub const MAGIC: u32 = 0x5053_4e53;

/// Current wire format version. Bump on incompatible layout changes.
pub const VERSION: u32 = 1;

/// Fixed-size statistics block embedded in the `SnapshotHeader`.
///
/// MEMORY LAYOUT (32 bytes):
///   [0..4]   num_goroutines: u32
///   [4..8]   non_live_goroutines: u32
///   [8..16]  stacks_duration_ns: u64
///   [16..24] pointer_duration_ns: u64
///   [24..32] total_duration_ns: u64
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Statistics {
    pub num_goroutines: u32,
    pub non_live_goroutines: u32,
    pub stacks_duration_ns: u64,
    pub pointer_duration_ns: u64,
    pub total_duration_ns: u64,
}

/// Header written at offset 0 of every snapshot buffer.
///
/// MEMORY LAYOUT (48 bytes = 16 bytes of framing + 32-byte `Statistics`):
///   [0..4]   magic: u32
///   [4..8]   version: u32
///   [8..12]  data_byte_len: u32
///   [12..16] goroutines_byte_len: u32
///   [16..48] statistics: Statistics
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct SnapshotHeader {
    pub magic: u32,
    pub version: u32,
    pub data_byte_len: u32,
    pub goroutines_byte_len: u32,
    pub statistics: Statistics,
}

impl SnapshotHeader {
    pub const fn new() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            data_byte_len: 0,
            goroutines_byte_len: 0,
            statistics: Statistics {
                num_goroutines: 0,
                non_live_goroutines: 0,
                stacks_duration_ns: 0,
                pointer_duration_ns: 0,
                total_duration_ns: 0,
            },
        }
    }
}

impl Default for SnapshotHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Lightweight-thread status, mirrored from the target runtime's own
/// thread-status enumeration. Only the two statuses the engine treats
/// specially (`RUNNING`, `DEAD`) are named; every other status is "live
/// and of potential interest" from the engine's point of view.
pub mod goroutine_status {
    pub const DEAD: u32 = 6;
    pub const RUNNING: u32 = 2;
}

/// Per-thread record header, written once per visited lightweight thread.
///
/// MEMORY LAYOUT (40 bytes):
///   [0..8]   goid: u64
///   [8..16]  stack_hash: u64
///   [16..20] status: u32
///   [20..24] wait_reason: u32
///   [24..32] wait_since_nanos: u64
///   [32..36] stack_bytes: u32
///   [36..40] data_byte_len: u32
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct GoroutineHeader {
    pub goid: u64,
    pub stack_hash: u64,
    pub status: u32,
    pub wait_reason: u32,
    pub wait_since_nanos: u64,
    pub stack_bytes: u32,
    pub data_byte_len: u32,
}

/// Header preceding the variable-length payload of a queue record.
///
/// MEMORY LAYOUT (20 bytes), payload of `byte_len` bytes follows immediately:
///   [0..8]   addr: u64
///   [8..12]  type_id: u32
///   [12..16] byte_len: u32
///   [16..20] parent_offset: u32
#[repr(C, packed)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct QueueRecordHeader {
    pub addr: u64,
    pub type_id: u32,
    pub byte_len: u32,
    pub parent_offset: u32,
}

/// Header preceding a frame-data record emitted by `PrepareFrameData`.
///
/// MEMORY LAYOUT (12 bytes), `byte_len` bytes of raw frame data follow:
///   [0..4]  prog_id: u32
///   [4..8]  type_id: u32
///   [8..12] byte_len: u32
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameDataHeader {
    pub prog_id: u32,
    pub type_id: u32,
    pub byte_len: u32,
}

/// Per-type metadata the queue drain and stack machine consult to size
/// and, if not a leaf, further chase an enqueued object.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TypeInfo {
    pub byte_len: u32,
    /// `0` means "leaf; no further chase".
    pub enqueue_pc: u32,
}

/// The ordered `(target_pc, prog_pc)` table driving the PC classifier.
/// `target_pc` must be non-decreasing; `prog_pc[j] == 0` means "no
/// program for this bucket".
#[derive(Clone, Debug, Default)]
pub struct PcClassifierTable {
    pub target_pc: Vec<u64>,
    pub prog_pc: Vec<u32>,
}

impl PcClassifierTable {
    /// Binary search for the smallest `j` with `pc <= target_pc[j]`.
    /// Returns the entry bytecode pc if that bucket names a program.
    pub fn classify(&self, pc: u64) -> Option<u32> {
        let j = self.target_pc.partition_point(|&t| t < pc);
        let prog = *self.prog_pc.get(j)?;
        if prog == 0 { None } else { Some(prog) }
    }
}

/// Bytecode opcodes, matching the widths enumerated in the snapshot
/// program's wire format. Operand widths here drive both the offline
/// compiler's encoder and the engine's decoder.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Call = 0,
    Return = 1,
    Jump = 2,
    CondJump = 3,
    PushImm = 4,
    Pop = 5,
    Decrement = 6,
    SetOffset = 7,
    PushOffset = 8,
    ShiftOffset = 9,
    ZeroFill = 10,
    PushSliceLen = 11,
    DereferenceCfaOffset = 12,
    CopyFromRegister = 13,
    PrepareFrameData = 14,
    EnqueuePointer = 15,
    EnqueueBiasedPointer = 16,
    EnqueueSliceHeader = 17,
    EnqueueStringHeader = 18,
    EnqueueMapHeader = 19,
    EnqueueInterface = 20,
    EnqueueEmptyInterface = 21,
}

impl Opcode {
    /// Decodes a raw opcode byte, or `None` for an opcode not in the table.
    pub fn from_byte(b: u8) -> Option<Self> {
        use Opcode::*;
        Some(match b {
            0 => Call,
            1 => Return,
            2 => Jump,
            3 => CondJump,
            4 => PushImm,
            5 => Pop,
            6 => Decrement,
            7 => SetOffset,
            8 => PushOffset,
            9 => ShiftOffset,
            10 => ZeroFill,
            11 => PushSliceLen,
            12 => DereferenceCfaOffset,
            13 => CopyFromRegister,
            14 => PrepareFrameData,
            15 => EnqueuePointer,
            16 => EnqueueBiasedPointer,
            17 => EnqueueSliceHeader,
            18 => EnqueueStringHeader,
            19 => EnqueueMapHeader,
            20 => EnqueueInterface,
            21 => EnqueueEmptyInterface,
            _ => return None,
        })
    }

    /// Number of operand bytes following the opcode byte, per §6 of the
    /// bytecode wire format.
    pub fn operand_width(self) -> usize {
        use Opcode::*;
        match self {
            Call | Jump | CondJump | PushImm => 4,
            Return | Pop | Decrement | SetOffset | PushOffset => 0,
            ShiftOffset | ZeroFill | PushSliceLen => 4,
            EnqueueSliceHeader | EnqueueBiasedPointer => 8,
            EnqueueMapHeader => 12,
            DereferenceCfaOffset | PrepareFrameData => 12,
            CopyFromRegister => 2,
            EnqueuePointer | EnqueueStringHeader | EnqueueInterface | EnqueueEmptyInterface => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn header_sizes_match_documented_layout() {
        assert_eq!(size_of::<Statistics>(), 32);
        assert_eq!(size_of::<SnapshotHeader>(), 48);
        assert_eq!(size_of::<GoroutineHeader>(), 40);
        assert_eq!(size_of::<QueueRecordHeader>(), 20);
        assert_eq!(size_of::<FrameDataHeader>(), 12);
    }

    #[test]
    fn default_header_carries_magic_and_version() {
        let h = SnapshotHeader::new();
        assert_eq!(h.magic, MAGIC);
        assert_eq!(h.version, VERSION);
        assert_eq!(h.statistics, Statistics::default());
    }

    #[test]
    fn classifier_finds_smallest_covering_bucket() {
        let table = PcClassifierTable {
            target_pc: vec![10, 20, 30],
            prog_pc: vec![0, 100, 200],
        };
        assert_eq!(table.classify(5), None);
        assert_eq!(table.classify(10), None);
        assert_eq!(table.classify(15), Some(100));
        assert_eq!(table.classify(20), Some(100));
        assert_eq!(table.classify(25), Some(200));
        assert_eq!(table.classify(30), Some(200));
        assert_eq!(table.classify(31), None);
    }

    #[test]
    fn opcode_roundtrips_through_byte() {
        for b in 0..=21u8 {
            let op = Opcode::from_byte(b).expect("opcode in range decodes");
            assert_eq!(op as u8, b);
        }
        assert!(Opcode::from_byte(22).is_none());
    }

    #[test]
    fn operand_widths_match_wire_format_table() {
        assert_eq!(Opcode::Call.operand_width(), 4);
        assert_eq!(Opcode::Return.operand_width(), 0);
        assert_eq!(Opcode::EnqueueSliceHeader.operand_width(), 8);
        assert_eq!(Opcode::EnqueueBiasedPointer.operand_width(), 8);
        assert_eq!(Opcode::EnqueueMapHeader.operand_width(), 12);
        assert_eq!(Opcode::DereferenceCfaOffset.operand_width(), 12);
        assert_eq!(Opcode::PrepareFrameData.operand_width(), 12);
        assert_eq!(Opcode::CopyFromRegister.operand_width(), 2);
    }
}
