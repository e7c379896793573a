//! A simulated kcopyd-like async block-copy engine (spec.md section 4.7:
//! "Copies are issued via an async kcopyd-like engine; on completion the
//! worker commits metadata"). Nothing in this workspace talks to a real
//! device, so completions are produced synchronously and queued for the
//! caller to drain with [`Copier::poll`] on its own schedule — which is
//! enough to exercise the target's commit-on-completion ordering without
//! needing a real asynchronous I/O backend.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    ToCache,
    ToSlow,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyRequest {
    pub cache_block: u64,
    pub pool_block: u64,
    pub direction: CopyDirection,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyResult {
    pub cache_block: u64,
    pub pool_block: u64,
    pub direction: CopyDirection,
    pub ok: bool,
}

/// Parallelism-capped async copy engine: `issue` refuses new work once
/// `in_flight` reaches the cap (spec.md 4.7's writeback "parallelism
/// cap"), and completions are only visible through `poll`.
pub struct Copier {
    cap: usize,
    in_flight: usize,
    completed: VecDeque<CopyResult>,
}

impl Copier {
    pub fn new(cap: usize) -> Self {
        Self { cap, in_flight: 0, completed: VecDeque::new() }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight < self.cap
    }

    /// Issue a copy. Returns `false` (no-op) if at capacity.
    pub fn issue(&mut self, req: CopyRequest) -> bool {
        if !self.has_capacity() {
            return false;
        }
        self.in_flight += 1;
        self.completed.push_back(CopyResult { cache_block: req.cache_block, pool_block: req.pool_block, direction: req.direction, ok: true });
        true
    }

    /// Drain every copy that has completed since the last `poll`.
    pub fn poll(&mut self) -> Vec<CopyResult> {
        let out: Vec<_> = self.completed.drain(..).collect();
        self.in_flight -= out.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_parallelism_cap() {
        let mut c = Copier::new(1);
        assert!(c.issue(CopyRequest { cache_block: 0, pool_block: 0, direction: CopyDirection::ToCache }));
        assert!(!c.issue(CopyRequest { cache_block: 1, pool_block: 1, direction: CopyDirection::ToCache }));
        let done = c.poll();
        assert_eq!(done.len(), 1);
        assert!(c.has_capacity());
    }
}
