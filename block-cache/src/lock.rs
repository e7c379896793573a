use std::sync::{Condvar, Mutex};

/// A small writer-preferred reader/writer lock for a single cached block.
///
/// Hand-rolled rather than pulled from a crate because the cache needs a
/// `try_write`/`try_read` that never parks a thread (for the transaction
/// manager's non-blocking clone), and because ownership of the guard needs
/// to outlive a borrow of the map that created it — something
/// `std::sync::RwLock`'s borrowed guards can't do without extra
/// indirection. The scheme itself (readers block while a writer is
/// waiting) matches the "writer-preferred" discipline spec'd for the HSM
/// metadata root lock in spec.md section 5.
#[derive(Default)]
pub(crate) struct BlockLock {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    readers: u32,
    writer: bool,
    waiting_writers: u32,
}

impl BlockLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_read(&self) {
        let mut s = self.state.lock().unwrap();
        while s.writer || s.waiting_writers > 0 {
            s = self.cond.wait(s).unwrap();
        }
        s.readers += 1;
    }

    pub fn try_lock_read(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.writer || s.waiting_writers > 0 {
            return false;
        }
        s.readers += 1;
        true
    }

    pub fn unlock_read(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.readers > 0);
        s.readers -= 1;
        if s.readers == 0 {
            self.cond.notify_all();
        }
    }

    pub fn lock_write(&self) {
        let mut s = self.state.lock().unwrap();
        s.waiting_writers += 1;
        while s.writer || s.readers > 0 {
            s = self.cond.wait(s).unwrap();
        }
        s.waiting_writers -= 1;
        s.writer = true;
    }

    pub fn try_lock_write(&self) -> bool {
        let mut s = self.state.lock().unwrap();
        if s.writer || s.readers > 0 {
            return false;
        }
        s.writer = true;
        true
    }

    pub fn unlock_write(&self) {
        let mut s = self.state.lock().unwrap();
        debug_assert!(s.writer);
        s.writer = false;
        self.cond.notify_all();
    }
}
