//! Stack-walk primitive used at allocation time.
//!
//! Writes into a fixed-size buffer owned by the caller and performs no
//! allocation of its own, so it is safe to call from inside the global
//! allocator hook.

use crate::record::MAX_STACK_DEPTH;

/// Fills `frames` with up to [`MAX_STACK_DEPTH`] return addresses,
/// most-recent-first, skipping the innermost `skip` frames (the tracker's
/// own interception frames). Returns the number of addresses captured.
pub fn capture(frames: &mut [usize; MAX_STACK_DEPTH], skip: usize) -> u32 {
    let mut skipped = 0usize;
    let mut depth = 0usize;

    backtrace::trace(|frame| {
        if skipped < skip {
            skipped += 1;
            return true;
        }
        if depth == frames.len() {
            return false;
        }
        frames[depth] = frame.ip() as usize;
        depth += 1;
        true
    });

    depth as u32
}
