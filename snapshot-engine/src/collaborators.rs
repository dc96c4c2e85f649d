//! The contract the engine demands of its external collaborators: the
//! stop-the-world barrier, the lightweight-thread enumerator, and the
//! safe-dereference primitive. All three are genuinely out of scope for
//! this crate — a real implementation reads live runtime state and must
//! be supplied by the host agent — so only the trait boundary lives here.

/// A single lightweight thread as seen by the enumerator, at the instant
/// the world was stopped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GoroutineView {
    pub goid: u64,
    pub pc: u64,
    pub fp: u64,
    pub status: u32,
    pub wait_reason: u32,
    pub wait_since_nanos: u64,
}

/// Enumerates every lightweight thread known to the target runtime, in a
/// stable order, for the duration of one stop-the-world callback.
pub trait ThreadEnumerator {
    fn goroutines(&self) -> &[GoroutineView];
}

/// The only unsafe primitive the engine ever touches indirectly: a
/// validated read of the target process's address space. Implementations
/// must return `false` rather than fault when the requested range is not
/// mapped and readable — the engine never performs a raw load that could
/// crash the snapshotter.
pub trait TargetMemory {
    fn try_read(&self, addr: u64, buf: &mut [u8]) -> bool;

    fn read_u64(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        if self.try_read(addr, &mut buf) {
            Some(u64::from_le_bytes(buf))
        } else {
            None
        }
    }

    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        if self.try_read(addr, &mut buf) {
            Some(u32::from_le_bytes(buf))
        } else {
            None
        }
    }
}

/// The stop-the-world barrier: guarantees that by the time this call
/// returns, `f` ran to completion with no other lightweight thread of the
/// target executing concurrently.
pub trait StopTheWorld {
    type Enumerator: ThreadEnumerator;

    fn stop_the_world<F: FnOnce(&Self::Enumerator)>(&self, f: F);
}

/// An in-process stand-in for the three collaborator traits, used by this
/// crate's own tests and by the debug CLI. It owns a small byte arena as
/// "target memory" and answers `try_read` the way a real safe-dereference
/// primitive would reject unmapped pages: anything outside the arena's
/// bounds fails closed rather than panicking.
pub mod fake {
    use super::*;

    pub struct FakeTarget {
        memory: Vec<u8>,
        base: u64,
        goroutines: Vec<GoroutineView>,
    }

    impl FakeTarget {
        pub fn new(base: u64, memory: Vec<u8>) -> Self {
            Self {
                memory,
                base,
                goroutines: Vec::new(),
            }
        }

        pub fn with_goroutines(mut self, goroutines: Vec<GoroutineView>) -> Self {
            self.goroutines = goroutines;
            self
        }

        /// Writes `bytes` at `addr`, panicking if out of range. Test-only
        /// helper for building up fixture memory.
        pub fn poke(&mut self, addr: u64, bytes: &[u8]) {
            let start = (addr - self.base) as usize;
            self.memory[start..start + bytes.len()].copy_from_slice(bytes);
        }

        pub fn base(&self) -> u64 {
            self.base
        }
    }

    impl TargetMemory for FakeTarget {
        fn try_read(&self, addr: u64, buf: &mut [u8]) -> bool {
            if addr < self.base {
                return false;
            }
            let start = (addr - self.base) as usize;
            let end = match start.checked_add(buf.len()) {
                Some(e) => e,
                None => return false,
            };
            if end > self.memory.len() {
                return false;
            }
            buf.copy_from_slice(&self.memory[start..end]);
            true
        }
    }

    impl ThreadEnumerator for FakeTarget {
        fn goroutines(&self) -> &[GoroutineView] {
            &self.goroutines
        }
    }

    /// A stop-the-world barrier that simply calls through: there is
    /// nothing else to quiesce in a single-process test fixture, but it
    /// still exercises the same call shape the engine uses against a real
    /// collaborator.
    pub struct ImmediateBarrier<'a> {
        pub target: &'a FakeTarget,
    }

    impl<'a> StopTheWorld for ImmediateBarrier<'a> {
        type Enumerator = FakeTarget;

        fn stop_the_world<F: FnOnce(&Self::Enumerator)>(&self, f: F) {
            f(self.target)
        }
    }

    #[test]
    fn try_read_rejects_out_of_range() {
        let target = FakeTarget::new(0x1000, vec![0xaa; 16]);
        let mut buf = [0u8; 4];
        assert!(target.try_read(0x1000, &mut buf));
        assert!(!target.try_read(0x2000, &mut buf));
        assert!(!target.try_read(0x1000 + 14, &mut buf), "reads past the arena end fail closed");
    }

    #[test]
    fn read_u64_decodes_little_endian() {
        let mut target = FakeTarget::new(0x1000, vec![0u8; 16]);
        target.poke(0x1000, &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(target.read_u64(0x1000), Some(0x0102_0304_0506_0708));
    }
}
