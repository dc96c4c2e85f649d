use crate::collaborators::TargetMemory;

/// Frame-pointer walker. Scratch arrays are pre-sized to `max_frames` at
/// construction and reused across threads within one snapshot — no
/// allocation once the stop-the-world barrier is entered.
pub struct Unwinder {
    pc: Vec<u64>,
    fp: Vec<u64>,
    max_frames: usize,
}

impl Unwinder {
    pub fn with_capacity(max_frames: usize) -> Self {
        Self {
            pc: Vec::with_capacity(max_frames),
            fp: Vec::with_capacity(max_frames),
            max_frames,
        }
    }

    /// Walks the frame-pointer chain starting at `(pc0, fp0)`, reading
    /// each `(saved_fp, saved_pc)` pair from the address in the previous
    /// frame's `fp` via the collaborator's safe-dereference primitive.
    /// Stops on `fp == 0`, a failed read, or hitting `max_frames`. Returns
    /// borrowed slices into the reused scratch arrays.
    pub fn unwind(&mut self, mem: &dyn TargetMemory, pc0: u64, fp0: u64) -> (&[u64], &[u64]) {
        self.pc.clear();
        self.fp.clear();

        self.pc.push(pc0);
        self.fp.push(fp0);

        if fp0 == 0 {
            return (&self.pc, &self.fp);
        }

        while self.pc.len() < self.max_frames {
            let cur_fp = *self.fp.last().unwrap();
            let saved_fp = match mem.read_u64(cur_fp) {
                Some(v) => v,
                None => break,
            };
            let saved_pc = match mem.read_u64(cur_fp + 8) {
                Some(v) => v,
                None => break,
            };
            if saved_fp == 0 {
                break;
            }
            self.pc.push(saved_pc);
            self.fp.push(saved_fp);
        }

        (&self.pc, &self.fp)
    }
}
