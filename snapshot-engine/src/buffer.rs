use crate::error::{EngineError, EngineResult};
use snapshot_wire::{FrameDataHeader, GoroutineHeader, QueueRecordHeader, SnapshotHeader};

/// Bounded append-only byte arena backing a single snapshot.
///
/// The buffer never reallocates: it is pre-sized to `capacity` at
/// construction (outside the stop-the-world barrier) and every write past
/// that capacity sets a sticky `full` flag and fails instead of growing.
/// `truncate` rolls the cursor back without shrinking the backing
/// allocation, used to discard a partially written thread record.
pub struct OutputBuffer {
    data: Vec<u8>,
    len: u32,
    full: bool,
}

impl OutputBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            len: 0,
            full: false,
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn full(&self) -> bool {
        self.full
    }

    pub fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    /// Rolls the cursor back to `to`, discarding whatever was written past
    /// it. Does not clear the `full` flag: once the buffer has gone full,
    /// it stays full for the remainder of the snapshot.
    pub fn truncate(&mut self, to: u32) {
        self.len = to.min(self.len);
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Reserves `n` bytes at the current cursor and returns a mutable
    /// slice into them, advancing the cursor. Returns `None` (and sets the
    /// sticky full flag) if `n` bytes would overflow capacity.
    pub fn reserve(&mut self, n: usize) -> Option<&mut [u8]> {
        let start = self.len as usize;
        let end = start.checked_add(n)?;
        if end > self.data.len() {
            self.full = true;
            return None;
        }
        self.len = end as u32;
        Some(&mut self.data[start..end])
    }

    fn write_pod<T: bytemuck::Pod>(&mut self, value: &T) -> EngineResult<u32> {
        let offset = self.len;
        let bytes = bytemuck::bytes_of(value);
        match self.reserve(bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                Ok(offset)
            }
            None => Err(EngineError::BufferFull),
        }
    }

    /// Writes a placeholder `SnapshotHeader` at the current cursor (always
    /// offset 0 for a fresh buffer) and returns its offset so the caller
    /// can patch fields in once the snapshot completes.
    pub fn write_snapshot_header(&mut self, header: &SnapshotHeader) -> EngineResult<u32> {
        self.write_pod(header)
    }

    /// Overwrites a previously written `SnapshotHeader` in place.
    pub fn patch_snapshot_header(&mut self, offset: u32, header: &SnapshotHeader) {
        let bytes = bytemuck::bytes_of(header);
        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn write_goroutine_header(&mut self, header: &GoroutineHeader) -> EngineResult<u32> {
        self.write_pod(header)
    }

    pub fn patch_goroutine_header(&mut self, offset: u32, header: &GoroutineHeader) {
        let bytes = bytemuck::bytes_of(header);
        let start = offset as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Writes a stack's pc array as raw little-endian u64s.
    pub fn write_stack(&mut self, pcs: &[u64]) -> EngineResult<u32> {
        let offset = self.len;
        match self.reserve(pcs.len() * 8) {
            Some(dst) => {
                for (chunk, pc) in dst.chunks_exact_mut(8).zip(pcs) {
                    chunk.copy_from_slice(&pc.to_le_bytes());
                }
                Ok(offset)
            }
            None => Err(EngineError::BufferFull),
        }
    }

    /// Writes a queue record header followed by its payload bytes,
    /// returning the header's offset (the "parent offset" consumers stitch
    /// child records to).
    pub fn write_queue_entry(
        &mut self,
        header: &QueueRecordHeader,
        payload: &[u8],
    ) -> EngineResult<u32> {
        let offset = self.write_pod(header)?;
        match self.reserve(payload.len()) {
            Some(dst) => {
                dst.copy_from_slice(payload);
                Ok(offset)
            }
            None => Err(EngineError::BufferFull),
        }
    }

    /// Writes just a queue record header, leaving the payload region to be
    /// filled in place by the caller (used by the queue drain, which reads
    /// the payload directly from target memory into the reserved bytes
    /// rather than staging it in a temporary allocation first).
    pub fn write_queue_record_header(&mut self, header: &QueueRecordHeader) -> EngineResult<u32> {
        self.write_pod(header)
    }

    pub fn write_frame_data_header(&mut self, header: &FrameDataHeader) -> EngineResult<u32> {
        self.write_pod(header)
    }

    /// Appends `n` zero bytes, used by the `ZeroFill` opcode.
    pub fn zero_fill(&mut self, n: usize) -> EngineResult<u32> {
        let offset = self.len;
        match self.reserve(n) {
            Some(dst) => {
                dst.fill(0);
                Ok(offset)
            }
            None => Err(EngineError::BufferFull),
        }
    }

    /// Copies `bytes` into the buffer at `offset`, which must already be
    /// within the written region (used by `DereferenceCFAOffset` and
    /// `CopyFromRegister`, which target the offset register rather than
    /// always appending at the cursor).
    pub fn write_at(&mut self, offset: u32, bytes: &[u8]) -> EngineResult<()> {
        let start = offset as usize;
        let end = start.checked_add(bytes.len()).ok_or(EngineError::BufferFull)?;
        if end > self.len as usize {
            return Err(EngineError::BufferFull);
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_fails_and_sticks_full_past_capacity() {
        let mut buf = OutputBuffer::with_capacity(4);
        assert!(buf.reserve(3).is_some());
        assert!(!buf.full());
        assert!(buf.reserve(2).is_none());
        assert!(buf.full());
        // Even a small write after going full still fails: sticky.
        assert!(buf.reserve(1).is_none());
    }

    #[test]
    fn truncate_rolls_back_cursor_without_clearing_full() {
        let mut buf = OutputBuffer::with_capacity(8);
        buf.reserve(8).unwrap();
        assert!(buf.reserve(1).is_none());
        assert!(buf.full());
        buf.truncate(4);
        assert_eq!(buf.len(), 4);
        assert!(buf.full(), "full flag is sticky across truncate");
    }

    #[test]
    fn write_stack_round_trips_little_endian() {
        let mut buf = OutputBuffer::with_capacity(64);
        let pcs = [0x1111_2222_3333_4444u64, 0xaaaa_bbbb_cccc_ddddu64];
        let off = buf.write_stack(&pcs).unwrap();
        assert_eq!(off, 0);
        let data = buf.data();
        assert_eq!(&data[0..8], &pcs[0].to_le_bytes());
        assert_eq!(&data[8..16], &pcs[1].to_le_bytes());
    }

    #[test]
    fn write_queue_entry_places_payload_after_header() {
        let mut buf = OutputBuffer::with_capacity(64);
        let header = QueueRecordHeader {
            addr: 0x1000,
            type_id: 7,
            byte_len: 3,
            parent_offset: 0,
        };
        let off = buf.write_queue_entry(&header, &[1, 2, 3]).unwrap();
        assert_eq!(off, 0);
        assert_eq!(buf.len(), 20 + 3);
        assert_eq!(&buf.data()[20..23], &[1, 2, 3]);
    }

    #[test]
    fn write_at_rejects_out_of_written_range() {
        let mut buf = OutputBuffer::with_capacity(16);
        buf.reserve(4).unwrap();
        assert!(buf.write_at(0, &[1, 2, 3, 4]).is_ok());
        assert!(buf.write_at(4, &[1]).is_err(), "offset 4 is past the written cursor");
    }
}
