use snapshot_wire::PcClassifierTable;
use std::collections::HashMap;

/// Runtime-data-layout knobs the stop-the-world collaborator needs:
/// the target-process address of the first moduledata, and the field
/// offsets within it of the `types`/`etypes` range boundaries. Supplied as
/// configuration rather than discovered, per the out-of-scope boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub first_moduledata_addr: u64,
    pub moduledata_types_offset: u64,
    pub moduledata_etypes_offset: u64,
}

/// One snapshot request: precompiled bytecode plus the type and PC tables
/// the offline compiler produced for it. Immutable for the duration of a
/// snapshot; outlives the ephemeral per-call state built around it.
pub struct SnapshotProgram {
    pub bytecode: Vec<u8>,
    pub type_info: HashMap<u32, snapshot_wire::TypeInfo>,
    pub go_runtime_type_to_type_id: HashMap<u64, u32>,
    pub pc_classifier: PcClassifierTable,
    pub runtime_config: RuntimeConfig,
}

impl SnapshotProgram {
    pub fn new(
        bytecode: Vec<u8>,
        type_info: HashMap<u32, snapshot_wire::TypeInfo>,
        go_runtime_type_to_type_id: HashMap<u64, u32>,
        pc_classifier: PcClassifierTable,
        runtime_config: RuntimeConfig,
    ) -> Self {
        Self {
            bytecode,
            type_info,
            go_runtime_type_to_type_id,
            pc_classifier,
            runtime_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapshot_wire::TypeInfo;

    #[test]
    fn holds_closed_type_table_and_classifier() {
        let mut type_info = HashMap::new();
        type_info.insert(1, TypeInfo { byte_len: 16, enqueue_pc: 0 });
        let program = SnapshotProgram::new(
            vec![],
            type_info,
            HashMap::new(),
            PcClassifierTable::default(),
            RuntimeConfig {
                first_moduledata_addr: 0x1000,
                moduledata_types_offset: 0x10,
                moduledata_etypes_offset: 0x18,
            },
        );
        assert_eq!(program.type_info[&1].byte_len, 16);
        assert_eq!(program.runtime_config.first_moduledata_addr, 0x1000);
    }
}
