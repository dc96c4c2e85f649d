//! Development harness for the snapshot engine: builds a synthetic
//! `SnapshotProgram` against the in-process fake target and runs one
//! snapshot, printing the resulting header and statistics. Not the
//! production entry point — that is the out-of-scope RPC layer.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use snapshot_engine::collaborators::fake::{FakeTarget, ImmediateBarrier};
use snapshot_engine::collaborators::GoroutineView;
use snapshot_engine::{Config, RuntimeConfig, SnapshotProgram, Snapshotter};
use snapshot_wire::{goroutine_status, Opcode, PcClassifierTable, SnapshotHeader, TypeInfo};

#[derive(Parser, Debug)]
#[command(name = "snapshot-debug-cli", about = "Run one snapshot against a synthetic fake target")]
struct Args {
    /// Number of synthetic goroutines to enumerate, one of which is dead.
    #[arg(short, long, default_value = "3")]
    goroutines: u64,
}

fn synthetic_program() -> SnapshotProgram {
    // entry: PushImm(0x4242) ; EnqueuePointer(1) ; Return
    let mut code = Vec::new();
    let entry_pc = code.len() as u32;
    code.push(Opcode::PushImm as u8);
    code.extend_from_slice(&0x4242u32.to_le_bytes());
    code.push(Opcode::EnqueuePointer as u8);
    code.extend_from_slice(&1u32.to_le_bytes());
    code.push(Opcode::Return as u8);

    let mut type_info = HashMap::new();
    type_info.insert(1, TypeInfo { byte_len: 16, enqueue_pc: 0 });

    SnapshotProgram::new(
        code,
        type_info,
        HashMap::new(),
        PcClassifierTable {
            target_pc: vec![0x1000],
            prog_pc: vec![entry_pc],
        },
        RuntimeConfig {
            first_moduledata_addr: 0x8000_0000,
            moduledata_types_offset: 0x10,
            moduledata_etypes_offset: 0x18,
        },
    )
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load();
    info!(
        "loaded engine config: max_stack_frames={} queue_capacity={}",
        config.engine.max_stack_frames, config.engine.queue_capacity
    );

    let mut goroutines = Vec::new();
    for goid in 0..args.goroutines {
        goroutines.push(GoroutineView {
            goid,
            pc: 0x800 + goid,
            fp: 0,
            status: if goid == 0 { goroutine_status::DEAD } else { 4 },
            wait_reason: 0,
            wait_since_nanos: 0,
        });
    }
    let target = FakeTarget::new(0x8000_0000, vec![0u8; 256]).with_goroutines(goroutines);
    let barrier = ImmediateBarrier { target: &target };

    let snapshotter = Snapshotter::new(config.engine);
    let program = synthetic_program();
    let response = snapshotter
        .snapshot(&barrier, &program)
        .context("snapshot call failed")?;

    let header: &SnapshotHeader = bytemuck::from_bytes(&response.data[0..std::mem::size_of::<SnapshotHeader>()]);
    println!("snapshot: {} bytes, pause {} ns", response.data.len(), response.pause_duration_ns);
    println!(
        "  goroutines: {} live, {} non-live",
        header.statistics.num_goroutines, header.statistics.non_live_goroutines
    );
    println!(
        "  timings: stacks={}ns pointer={}ns total={}ns",
        header.statistics.stacks_duration_ns,
        header.statistics.pointer_duration_ns,
        header.statistics.total_duration_ns
    );
    println!(
        "  engine metrics: snapshots_total={} bytes_emitted_total={}",
        snapshotter.metrics().snapshots_total(),
        snapshotter.metrics().bytes_emitted_total()
    );

    Ok(())
}
