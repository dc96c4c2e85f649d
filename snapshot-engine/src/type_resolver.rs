use crate::collaborators::TargetMemory;
use std::collections::HashMap;

/// Resolves a runtime-type-table address to the stable per-type offset
/// used as a map key, by subtracting the module's `types` base. Caches
/// `[types, etypes)` lazily on first use, since deriving it costs two
/// target reads we don't want to repeat per pointer.
pub struct RuntimeTypeResolver {
    first_moduledata_addr: u64,
    types_offset: u64,
    etypes_offset: u64,
    range: Option<(u64, u64)>,
}

impl RuntimeTypeResolver {
    pub fn new(first_moduledata_addr: u64, types_offset: u64, etypes_offset: u64) -> Self {
        Self {
            first_moduledata_addr,
            types_offset,
            etypes_offset,
            range: None,
        }
    }

    fn range(&mut self, mem: &dyn TargetMemory) -> Option<(u64, u64)> {
        if let Some(range) = self.range {
            return Some(range);
        }
        let types = mem.read_u64(self.first_moduledata_addr + self.types_offset)?;
        let etypes = mem.read_u64(self.first_moduledata_addr + self.etypes_offset)?;
        self.range = Some((types, etypes));
        Some((types, etypes))
    }

    /// Returns `a - types` when `a` falls in `[types, etypes)`, else 0 —
    /// matching the spec's "out-of-range resolves to 0" rule rather than
    /// an `Option`, since 0 is itself a defined sentinel type-id below.
    pub fn resolve(&mut self, mem: &dyn TargetMemory, a: u64) -> u64 {
        match self.range(mem) {
            Some((types, etypes)) if a >= types && a < etypes => a - types,
            _ => 0,
        }
    }
}

/// Maps a runtime-type offset (as produced by `RuntimeTypeResolver`) to a
/// compact type-id. Missing entries resolve to 0.
pub struct TypeIdResolver {
    table: HashMap<u64, u32>,
}

impl TypeIdResolver {
    pub fn new(table: HashMap<u64, u32>) -> Self {
        Self { table }
    }

    pub fn resolve(&self, offset: u64) -> u32 {
        self.table.get(&offset).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fake::FakeTarget;

    fn fixture() -> FakeTarget {
        // Moduledata at 0x8000_0000: types at +0x10, etypes at +0x18.
        let mut target = FakeTarget::new(0x8000_0000, vec![0u8; 64]);
        target.poke(0x8000_0000 + 0x10, &0x9000_0000u64.to_le_bytes());
        target.poke(0x8000_0000 + 0x18, &0x9000_1000u64.to_le_bytes());
        target
    }

    #[test]
    fn resolves_in_range_address_to_stable_offset() {
        let target = fixture();
        let mut resolver = RuntimeTypeResolver::new(target.base(), 0x10, 0x18);
        assert_eq!(resolver.resolve(&target, 0x9000_0100), 0x100);
    }

    #[test]
    fn out_of_range_address_resolves_to_zero() {
        let target = fixture();
        let mut resolver = RuntimeTypeResolver::new(target.base(), 0x10, 0x18);
        assert_eq!(resolver.resolve(&target, 0x1234), 0);
        assert_eq!(resolver.resolve(&target, 0x9000_1000), 0, "etypes is exclusive");
    }

    #[test]
    fn range_is_cached_after_first_resolve() {
        let target = fixture();
        let mut resolver = RuntimeTypeResolver::new(target.base(), 0x10, 0x18);
        resolver.resolve(&target, 0x9000_0000);
        assert_eq!(resolver.range, Some((0x9000_0000, 0x9000_1000)));
    }

    #[test]
    fn type_id_resolver_defaults_missing_to_zero() {
        let mut table = HashMap::new();
        table.insert(0x100, 42);
        let resolver = TypeIdResolver::new(table);
        assert_eq!(resolver.resolve(0x100), 42);
        assert_eq!(resolver.resolve(0x999), 0);
    }
}
