use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use snapshot_wire::{goroutine_status, GoroutineHeader, QueueRecordHeader, SnapshotHeader};

use crate::buffer::OutputBuffer;
use crate::collaborators::{StopTheWorld, TargetMemory, ThreadEnumerator};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::machine::{MachineContext, RunOutcome, StackMachine};
use crate::metrics::EngineMetrics;
use crate::murmur::hash_stack;
use crate::program::SnapshotProgram;
use crate::queue::{QueueEntry, WorkQueue};
use crate::type_resolver::{RuntimeTypeResolver, TypeIdResolver};
use crate::unwinder::Unwinder;

/// The assembled result of one `Snapshotter::snapshot` call.
pub struct SnapshotResponse {
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
    pub pause_duration_ns: u64,
}

/// Orchestrates one snapshot: stop-the-world, per-thread unwind and
/// capture, queue drain, header fixup. Holds the config it was built with
/// and the metrics it accumulates into across every call; everything else
/// it touches is constructed fresh per snapshot and dropped at the end.
pub struct Snapshotter {
    config: EngineConfig,
    metrics: EngineMetrics,
}

impl Snapshotter {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Runs one snapshot against `program`, quiescing the target through
    /// `stw`. The enumerator the barrier hands back must also answer
    /// `TargetMemory` — a real agent's collaborator and the fake target
    /// both satisfy this by being a single object that implements all
    /// three collaborator traits.
    pub fn snapshot<S>(&self, stw: &S, program: &SnapshotProgram) -> EngineResult<SnapshotResponse>
    where
        S: StopTheWorld,
        S::Enumerator: TargetMemory,
    {
        let entry = Instant::now();
        let timestamp = SystemTime::now();

        let mut out = OutputBuffer::with_capacity(self.config.output_buffer_capacity);
        let header_offset = out
            .write_snapshot_header(&SnapshotHeader::new())
            .map_err(|_| EngineError::HeaderWrite)?;

        let mut unwinder = Unwinder::with_capacity(self.config.max_stack_frames);
        let mut stacks: HashMap<u64, Vec<(u32, u32)>> =
            HashMap::with_capacity(self.config.stacks_map_capacity);
        let mut queue = WorkQueue::with_capacity(self.config.queue_capacity);
        let mut type_resolver = RuntimeTypeResolver::new(
            program.runtime_config.first_moduledata_addr,
            program.runtime_config.moduledata_types_offset,
            program.runtime_config.moduledata_etypes_offset,
        );
        let type_id_resolver = TypeIdResolver::new(program.go_runtime_type_to_type_id.clone());
        let mut machine = StackMachine::with_operand_stack_depth(self.config.operand_stack_depth);

        let mut num_goroutines: u32 = 0;
        let mut non_live_goroutines: u32 = 0;
        let mut truncated = false;
        let mut stacks_duration_ns: u64 = 0;
        let mut pointer_duration_ns: u64 = 0;
        let mut goroutines_byte_len: u32 = 0;
        let goroutines_start = out.len();

        stw.stop_the_world(|enumerator| {
            let stacks_start = Instant::now();

            'threads: for g in enumerator.goroutines() {
                if g.status == goroutine_status::DEAD {
                    non_live_goroutines += 1;
                    continue;
                }
                if g.status == goroutine_status::RUNNING {
                    continue;
                }
                if truncated {
                    break;
                }

                let thread_start = out.len();
                let (pcs, fps) = unwinder.unwind(enumerator, g.pc, g.fp);
                let hash = hash_stack(pcs);
                let is_new = !stacks.contains_key(&hash);

                let header_offset = match out.write_goroutine_header(&GoroutineHeader::default()) {
                    Ok(o) => o,
                    Err(_) => {
                        out.truncate(thread_start);
                        truncated = true;
                        break;
                    }
                };

                let stack_bytes = if is_new {
                    match out.write_stack(pcs) {
                        Ok(_) => (pcs.len() * 8) as u32,
                        Err(_) => {
                            out.truncate(thread_start);
                            truncated = true;
                            break;
                        }
                    }
                } else {
                    0
                };

                if is_new {
                    let mut of_interest = Vec::new();
                    for (i, &pc) in pcs.iter().enumerate() {
                        if let Some(entry_pc) = program.pc_classifier.classify(pc) {
                            of_interest.push((i as u32, entry_pc));
                        }
                    }
                    stacks.insert(hash, of_interest);
                }
                let frames = stacks.get(&hash).cloned().unwrap_or_default();

                let data_start = out.len();
                let mut thread_truncated = false;
                for (frame_idx, entry_pc) in frames {
                    let fp = fps[frame_idx as usize];
                    let base_offset = out.len();
                    let mut ctx = MachineContext {
                        code: &program.bytecode,
                        mem: enumerator,
                        queue: &mut queue,
                        out: &mut out,
                        type_resolver: &mut type_resolver,
                        type_id_resolver: &type_id_resolver,
                        metrics: &self.metrics,
                    };
                    if machine.run(&mut ctx, entry_pc, fp, frame_idx, base_offset)
                        == RunOutcome::BufferFull
                    {
                        thread_truncated = true;
                        break;
                    }
                }

                if thread_truncated {
                    out.truncate(thread_start);
                    truncated = true;
                    break 'threads;
                }

                let data_byte_len = (out.len() - data_start) as u32;
                let final_header = GoroutineHeader {
                    goid: g.goid,
                    stack_hash: hash,
                    status: g.status,
                    wait_reason: g.wait_reason,
                    wait_since_nanos: g.wait_since_nanos,
                    stack_bytes,
                    data_byte_len,
                };
                out.patch_goroutine_header(header_offset, &final_header);
                num_goroutines += 1;
            }

            stacks_duration_ns = stacks_start.elapsed().as_nanos() as u64;
            // Stamped here, before the queue drain below appends any
            // QueueRecord bytes, so it measures only the GoroutineRecord[]
            // region a downstream reader walks stack records over.
            goroutines_byte_len = out.len() - goroutines_start;

            let pointer_start = Instant::now();
            if !truncated {
                while !out.full() {
                    let entry: QueueEntry = match queue.pop() {
                        Some(e) => e,
                        None => break,
                    };
                    let Some(type_info) = program.type_info.get(&entry.type_id) else {
                        log::debug!("queue drain: no type info for type {}, skipping", entry.type_id);
                        continue;
                    };
                    let byte_len = if entry.len == 0 {
                        type_info.byte_len
                    } else {
                        entry.len.min(type_info.byte_len)
                    };
                    if byte_len == 0 {
                        continue;
                    }

                    let header = QueueRecordHeader {
                        addr: entry.addr,
                        type_id: entry.type_id,
                        byte_len,
                        parent_offset: entry.parent_offset,
                    };
                    let record_offset = match out.write_queue_record_header(&header) {
                        Ok(o) => o,
                        Err(_) => break,
                    };
                    match out.reserve(byte_len as usize) {
                        Some(dst) => {
                            if !enumerator.try_read(entry.addr, dst) {
                                dst.fill(0);
                                self.metrics.inc_bad_dereference();
                            }
                        }
                        None => break,
                    }

                    if type_info.enqueue_pc != 0 {
                        let mut ctx = MachineContext {
                            code: &program.bytecode,
                            mem: enumerator,
                            queue: &mut queue,
                            out: &mut out,
                            type_resolver: &mut type_resolver,
                            type_id_resolver: &type_id_resolver,
                            metrics: &self.metrics,
                        };
                        if machine.run(&mut ctx, type_info.enqueue_pc, 0, 0, record_offset)
                            == RunOutcome::BufferFull
                        {
                            break;
                        }
                    }
                }
            }
            pointer_duration_ns = pointer_start.elapsed().as_nanos() as u64;
        });

        let total_duration_ns = entry.elapsed().as_nanos() as u64;
        let data_byte_len = out.len();

        let header = SnapshotHeader {
            magic: snapshot_wire::MAGIC,
            version: snapshot_wire::VERSION,
            data_byte_len,
            goroutines_byte_len,
            statistics: snapshot_wire::Statistics {
                num_goroutines,
                non_live_goroutines,
                stacks_duration_ns,
                pointer_duration_ns,
                total_duration_ns,
            },
        };
        out.patch_snapshot_header(header_offset, &header);

        self.metrics.record_snapshot(truncated, out.len() as u64);

        Ok(SnapshotResponse {
            data: out.data().to_vec(),
            timestamp,
            pause_duration_ns: total_duration_ns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fake::{FakeTarget, ImmediateBarrier};
    use crate::collaborators::GoroutineView;
    use crate::program::RuntimeConfig;
    use snapshot_wire::{Opcode, PcClassifierTable, TypeInfo};
    use std::collections::HashMap as StdHashMap;

    fn empty_program() -> SnapshotProgram {
        SnapshotProgram::new(
            vec![],
            StdHashMap::new(),
            StdHashMap::new(),
            PcClassifierTable::default(),
            RuntimeConfig {
                first_moduledata_addr: 0x1000,
                moduledata_types_offset: 0,
                moduledata_etypes_offset: 8,
            },
        )
    }

    #[test]
    fn single_dead_thread_produces_no_goroutine_records() {
        let target = FakeTarget::new(0x1000, vec![0u8; 32]).with_goroutines(vec![GoroutineView {
            goid: 1,
            pc: 0,
            fp: 0,
            status: goroutine_status::DEAD,
            wait_reason: 0,
            wait_since_nanos: 0,
        }]);
        let barrier = ImmediateBarrier { target: &target };
        let snapshotter = Snapshotter::new(EngineConfig::default());
        let response = snapshotter.snapshot(&barrier, &empty_program()).unwrap();

        let header_bytes = &response.data[0..48];
        let header: &SnapshotHeader = bytemuck::from_bytes(header_bytes);
        assert_eq!(header.statistics.num_goroutines, 0);
        assert_eq!(header.statistics.non_live_goroutines, 1);
        assert_eq!(header.goroutines_byte_len, 0);
    }

    #[test]
    fn waiting_thread_with_no_frames_of_interest_emits_stack_only() {
        let target = FakeTarget::new(0x1000, vec![0u8; 64]).with_goroutines(vec![GoroutineView {
            goid: 7,
            pc: 0xaaaa,
            fp: 0,
            status: 4,
            wait_reason: 1,
            wait_since_nanos: 500,
        }]);
        let barrier = ImmediateBarrier { target: &target };
        let snapshotter = Snapshotter::new(EngineConfig::default());
        let response = snapshotter.snapshot(&barrier, &empty_program()).unwrap();

        let header: &SnapshotHeader = bytemuck::from_bytes(&response.data[0..48]);
        assert_eq!(header.statistics.num_goroutines, 1);
        let goroutine_header_len = std::mem::size_of::<GoroutineHeader>();
        assert_eq!(
            header.data_byte_len as usize,
            48 + goroutine_header_len + 8 // one pc, fp==0 stops immediately
        );
    }

    #[test]
    fn two_threads_with_identical_stacks_dedup() {
        let view = |goid| GoroutineView {
            goid,
            pc: 0x1234,
            fp: 0,
            status: 4,
            wait_reason: 0,
            wait_since_nanos: 0,
        };
        let target =
            FakeTarget::new(0x1000, vec![0u8; 64]).with_goroutines(vec![view(1), view(2)]);
        let barrier = ImmediateBarrier { target: &target };
        let snapshotter = Snapshotter::new(EngineConfig::default());
        let response = snapshotter.snapshot(&barrier, &empty_program()).unwrap();

        let header: &SnapshotHeader = bytemuck::from_bytes(&response.data[0..48]);
        assert_eq!(header.statistics.num_goroutines, 2);

        let gh_len = std::mem::size_of::<GoroutineHeader>();
        let first: &GoroutineHeader = bytemuck::from_bytes(&response.data[48..48 + gh_len]);
        assert_eq!(first.stack_bytes, 8);
        let second_offset = 48 + gh_len + 8;
        let second: &GoroutineHeader =
            bytemuck::from_bytes(&response.data[second_offset..second_offset + gh_len]);
        assert_eq!(second.stack_bytes, 0, "dedup hit writes no stack_pcs array");
        assert_eq!(second.stack_hash, first.stack_hash);
    }

    #[test]
    fn pointer_chase_enqueues_struct_then_its_slice_in_bfs_order() {
        // Program:
        //   entry (frame program): PushImm(struct_addr) ; EnqueuePointer(STRUCT_TY) ; Return
        //   STRUCT_TY's enqueue program (at STRUCT_ENQUEUE_PC):
        //     PushImm(slice_data_addr) ; PushImm(3) ; EnqueueSliceHeader(SLICE_TY, 8) ; Return
        const STRUCT_TY: u32 = 1;
        const SLICE_TY: u32 = 2;
        let mut code = Vec::new();
        let entry_pc = code.len() as u32;
        code.push(Opcode::PushImm as u8);
        code.extend_from_slice(&0x5000u32.to_le_bytes());
        code.push(Opcode::EnqueuePointer as u8);
        code.extend_from_slice(&STRUCT_TY.to_le_bytes());
        code.push(Opcode::Return as u8);

        let struct_enqueue_pc = code.len() as u32;
        code.push(Opcode::PushImm as u8);
        code.extend_from_slice(&0x6000u32.to_le_bytes());
        code.push(Opcode::PushImm as u8);
        code.extend_from_slice(&3u32.to_le_bytes());
        code.push(Opcode::EnqueueSliceHeader as u8);
        code.extend_from_slice(&SLICE_TY.to_le_bytes());
        code.extend_from_slice(&8u32.to_le_bytes());
        code.push(Opcode::Return as u8);

        let mut type_info = StdHashMap::new();
        type_info.insert(
            STRUCT_TY,
            TypeInfo {
                byte_len: 16,
                enqueue_pc: struct_enqueue_pc,
            },
        );
        type_info.insert(SLICE_TY, TypeInfo { byte_len: 24, enqueue_pc: 0 });

        let classifier = PcClassifierTable {
            target_pc: vec![0x1000],
            prog_pc: vec![entry_pc],
        };
        let program = SnapshotProgram::new(
            code,
            type_info,
            StdHashMap::new(),
            classifier,
            RuntimeConfig {
                first_moduledata_addr: 0x1000,
                moduledata_types_offset: 0,
                moduledata_etypes_offset: 8,
            },
        );

        let target = FakeTarget::new(0x1000, vec![0u8; 64]).with_goroutines(vec![GoroutineView {
            goid: 1,
            pc: 0x800,
            fp: 0,
            status: 4,
            wait_reason: 0,
            wait_since_nanos: 0,
        }]);
        let barrier = ImmediateBarrier { target: &target };
        let snapshotter = Snapshotter::new(EngineConfig::default());
        let response = snapshotter.snapshot(&barrier, &program).unwrap();

        // Walk the queue records that follow the single goroutine record.
        let gh_len = std::mem::size_of::<GoroutineHeader>();
        let qrh_len = 20usize;
        let goroutine_record_start = 48;
        let goroutine_record_len = gh_len + 8; // one-frame stack, no frame data
        let mut cursor = goroutine_record_start + goroutine_record_len;

        let header: &SnapshotHeader = bytemuck::from_bytes(&response.data[0..48]);
        assert_eq!(
            header.goroutines_byte_len, goroutine_record_len as u32,
            "goroutines_byte_len must cover only GoroutineRecord[], not the queue records that follow"
        );

        let first: &QueueRecordHeader =
            bytemuck::from_bytes(&response.data[cursor..cursor + qrh_len]);
        let first_type_id = first.type_id;
        let first_byte_len = first.byte_len;
        assert_eq!(first_type_id, STRUCT_TY);
        assert_eq!(first_byte_len, 16);
        cursor += qrh_len + first_byte_len as usize;

        let second: &QueueRecordHeader =
            bytemuck::from_bytes(&response.data[cursor..cursor + qrh_len]);
        let second_type_id = second.type_id;
        let second_byte_len = second.byte_len;
        assert_eq!(second_type_id, SLICE_TY);
        assert_eq!(second_byte_len, 24, "3 elements * 8 bytes");
    }

    #[test]
    fn buffer_full_mid_thread_discards_only_the_partial_thread() {
        let view = |goid, pc| GoroutineView {
            goid,
            pc,
            fp: 0,
            status: 4,
            wait_reason: 0,
            wait_since_nanos: 0,
        };
        // Three threads with distinct pcs (distinct stack hashes) so each
        // writes its own stack_pcs array and no dedup kicks in.
        let target = FakeTarget::new(0x1000, vec![0u8; 64]).with_goroutines(vec![
            view(1, 0x10),
            view(2, 0x20),
            view(3, 0x30),
        ]);
        let barrier = ImmediateBarrier { target: &target };

        // Header(48) + 2 * (goroutine header(40) + 8 bytes stack) fits in
        // 48 + 2*48 = 144; the third thread's header+stack needs another
        // 48 bytes, which a 150-byte buffer cannot hold.
        let mut config = EngineConfig::default();
        config.output_buffer_capacity = 150;
        let snapshotter = Snapshotter::new(config);
        let response = snapshotter.snapshot(&barrier, &empty_program()).unwrap();

        let header: &SnapshotHeader = bytemuck::from_bytes(&response.data[0..48]);
        assert_eq!(header.statistics.num_goroutines, 2);
    }

    #[test]
    fn bad_dereference_in_one_frame_program_does_not_stop_later_threads() {
        const FRAME_TY: u32 = 9;
        let mut code = Vec::new();
        let entry_pc = code.len() as u32;
        code.push(Opcode::ZeroFill as u8);
        code.extend_from_slice(&8u32.to_le_bytes());
        code.push(Opcode::DereferenceCfaOffset as u8);
        code.extend_from_slice(&0x5000i32.to_le_bytes());
        code.extend_from_slice(&8u32.to_le_bytes());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(Opcode::Return as u8);

        let classifier = PcClassifierTable {
            target_pc: vec![0x10, 0x20],
            prog_pc: vec![entry_pc, entry_pc],
        };
        let program = SnapshotProgram::new(
            code,
            StdHashMap::new(),
            StdHashMap::new(),
            classifier,
            RuntimeConfig {
                first_moduledata_addr: 0x1000,
                moduledata_types_offset: 0,
                moduledata_etypes_offset: 8,
            },
        );
        let _ = FRAME_TY;

        let target = FakeTarget::new(0x1000, vec![0u8; 64]).with_goroutines(vec![
            GoroutineView { goid: 1, pc: 0x10, fp: 0, status: 4, wait_reason: 0, wait_since_nanos: 0 },
            GoroutineView { goid: 2, pc: 0x20, fp: 0, status: 4, wait_reason: 0, wait_since_nanos: 0 },
        ]);
        let barrier = ImmediateBarrier { target: &target };
        let snapshotter = Snapshotter::new(EngineConfig::default());
        let response = snapshotter.snapshot(&barrier, &program).unwrap();

        let header: &SnapshotHeader = bytemuck::from_bytes(&response.data[0..48]);
        assert_eq!(header.statistics.num_goroutines, 2, "both threads still produce records");
        assert_eq!(snapshotter.metrics().bad_dereference_total(), 2);
    }
}
