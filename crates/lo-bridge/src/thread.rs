//! Thread Manager
//!
//! Spawns OS threads at native entry points and hands out joinable tids.
//! A tid is consumed by exactly one successful `join` or `try_join`; every
//! later attempt, and every attempt racing a pending join, reports
//! [`ThreadError::Busy`].

use std::collections::{BTreeSet, HashMap};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ThreadConfig;
use crate::error::ThreadError;

/// pthread error codes surfaced in join results.
pub mod pthread {
    pub const EBUSY: i32 = libc::EBUSY;
    pub const ESRCH: i32 = libc::ESRCH;
}

/// Signature of a native thread entry point.
pub type ThreadEntry = extern "C" fn(*mut libc::c_void) -> *mut libc::c_void;

/// Thread identifier. Never reused within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tid(u64);

impl Tid {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Tid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a thread is in its join protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Running,
    Joining,
    Joined,
}

/// Outcome of a non-blocking join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryJoin {
    /// The thread terminated and this call consumed it.
    Finished(usize),
    /// The thread is still running; nothing was claimed.
    Running,
}

/// `(errorCode, exitStatus)` pair reported at the native boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinResult {
    pub error_code: i32,
    pub exit_status: usize,
}

impl JoinResult {
    pub fn as_pair(&self) -> (i32, usize) {
        (self.error_code, self.exit_status)
    }
}

impl From<Result<usize, ThreadError>> for JoinResult {
    fn from(result: Result<usize, ThreadError>) -> Self {
        match result {
            Ok(exit_status) => Self {
                error_code: 0,
                exit_status,
            },
            Err(e) => Self {
                error_code: e.code(),
                exit_status: 0,
            },
        }
    }
}

enum Slot {
    Running(JoinHandle<usize>),
    Joining,
}

/// Consumed tids: everything below `floor`, plus the sparse set above it.
struct JoinedTids {
    floor: u64,
    above: BTreeSet<u64>,
}

impl JoinedTids {
    fn contains(&self, tid: Tid) -> bool {
        (1..self.floor).contains(&tid.0) || self.above.contains(&tid.0)
    }

    fn insert(&mut self, tid: Tid) {
        self.above.insert(tid.0);
        while self.above.remove(&self.floor) {
            self.floor += 1;
        }
    }
}

struct Registry {
    next_tid: u64,
    /// Threads not yet joined.
    slots: HashMap<Tid, Slot>,
    joined: JoinedTids,
}

/// Spawns and joins native threads.
///
/// Tids are issued densely from 1, so joined threads are remembered as a
/// watermark plus the out-of-order joins above it rather than one entry each.
pub struct ThreadManager {
    config: ThreadConfig,
    registry: Mutex<Registry>,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new(ThreadConfig::default())
    }
}

impl ThreadManager {
    pub fn new(config: ThreadConfig) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry {
                next_tid: 1,
                slots: HashMap::new(),
                joined: JoinedTids {
                    floor: 1,
                    above: BTreeSet::new(),
                },
            }),
        }
    }

    /// Start a thread executing `entry(context)`.
    ///
    /// # Safety
    ///
    /// `entry` must be the address of a function with the [`ThreadEntry`]
    /// signature, and `context` must be valid for whatever that function does
    /// with it.
    pub unsafe fn spawn(&self, entry: usize, context: usize) -> Result<Tid, ThreadError> {
        if entry == 0 {
            return Err(ThreadError::NullEntry);
        }
        // SAFETY: the caller guarantees `entry` points at a ThreadEntry.
        let entry = unsafe { std::mem::transmute::<usize, ThreadEntry>(entry) };

        // A tid is only issued once its thread exists, keeping tids dense.
        let mut registry = self.registry.lock();
        let tid = Tid(registry.next_tid);
        let mut builder =
            thread::Builder::new().name(format!("{}-{}", self.config.name_prefix, tid));
        if let Some(stack_size) = self.config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder
            .spawn(move || entry(context as *mut libc::c_void) as usize)
            .map_err(|e| ThreadError::SpawnFailed(e.to_string()))?;
        registry.next_tid += 1;
        registry.slots.insert(tid, Slot::Running(handle));
        debug!(%tid, "Spawned thread");
        Ok(tid)
    }

    /// Claim the right to join `tid`. With `only_if_finished`, a thread that
    /// is still running is left unclaimed and `None` is returned.
    fn claim(&self, tid: Tid, only_if_finished: bool) -> Result<Option<JoinHandle<usize>>, ThreadError> {
        let mut registry = self.registry.lock();
        let Registry { slots, joined, .. } = &mut *registry;
        let Some(slot) = slots.get_mut(&tid) else {
            return Err(if joined.contains(tid) {
                ThreadError::Busy(tid)
            } else {
                ThreadError::Invalid(tid)
            });
        };
        match slot {
            Slot::Running(handle) if only_if_finished && !handle.is_finished() => return Ok(None),
            Slot::Running(_) => {}
            Slot::Joining => return Err(ThreadError::Busy(tid)),
        }
        match std::mem::replace(slot, Slot::Joining) {
            Slot::Running(handle) => Ok(Some(handle)),
            _ => Err(ThreadError::Busy(tid)),
        }
    }

    fn finish(&self, tid: Tid, handle: JoinHandle<usize>) -> Result<usize, ThreadError> {
        let result = handle.join().map_err(|_| ThreadError::Panicked(tid));
        let mut registry = self.registry.lock();
        registry.slots.remove(&tid);
        registry.joined.insert(tid);
        drop(registry);
        match &result {
            Ok(status) => debug!(%tid, status, "Joined thread"),
            Err(e) => warn!(%tid, error = %e, "Joined thread with failure"),
        }
        result
    }

    /// Block until `tid` terminates and return its exit status.
    pub fn join(&self, tid: Tid) -> Result<usize, ThreadError> {
        match self.claim(tid, false)? {
            Some(handle) => self.finish(tid, handle),
            None => Err(ThreadError::Busy(tid)),
        }
    }

    /// Poll `tid` without blocking.
    pub fn try_join(&self, tid: Tid) -> Result<TryJoin, ThreadError> {
        match self.claim(tid, true)? {
            Some(handle) => self.finish(tid, handle).map(TryJoin::Finished),
            None => Ok(TryJoin::Running),
        }
    }

    pub fn status(&self, tid: Tid) -> Option<ThreadStatus> {
        let registry = self.registry.lock();
        match registry.slots.get(&tid) {
            Some(Slot::Running(_)) => Some(ThreadStatus::Running),
            Some(Slot::Joining) => Some(ThreadStatus::Joining),
            None if registry.joined.contains(tid) => Some(ThreadStatus::Joined),
            None => None,
        }
    }

    /// Tids that have not been joined yet, sorted.
    pub fn active(&self) -> Vec<Tid> {
        let mut tids: Vec<_> = self.registry.lock().slots.keys().copied().collect();
        tids.sort();
        tids
    }
}

impl Drop for ThreadManager {
    fn drop(&mut self) {
        let unjoined = self
            .registry
            .get_mut()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Running(_)))
            .count();
        if unjoined > 0 {
            warn!(unjoined, "Thread manager dropped with unjoined threads; detaching");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    extern "C" fn add_one(arg: *mut libc::c_void) -> *mut libc::c_void {
        (arg as usize + 1) as *mut libc::c_void
    }

    /// Spins until the `AtomicBool` behind `arg` is set, then returns 42.
    extern "C" fn wait_for_flag(arg: *mut libc::c_void) -> *mut libc::c_void {
        // SAFETY: tests pass a pointer to an AtomicBool that outlives the thread.
        let flag = unsafe { &*(arg as *const AtomicBool) };
        while !flag.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        42 as *mut libc::c_void
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..5_000 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached");
    }

    #[test]
    fn join_returns_exit_status_once() {
        let manager = ThreadManager::default();
        let tid = unsafe { manager.spawn(add_one as usize, 41) }.unwrap();

        assert_eq!(manager.join(tid), Ok(42));
        assert_eq!(manager.status(tid), Some(ThreadStatus::Joined));
        assert_eq!(manager.join(tid), Err(ThreadError::Busy(tid)));
        assert_eq!(manager.try_join(tid), Err(ThreadError::Busy(tid)));
        assert!(manager.active().is_empty());
    }

    #[test]
    fn try_join_does_not_claim_running_thread() {
        let manager = ThreadManager::default();
        let flag = Box::new(AtomicBool::new(false));
        let ctx = &*flag as *const AtomicBool as usize;
        let tid = unsafe { manager.spawn(wait_for_flag as usize, ctx) }.unwrap();

        assert_eq!(manager.try_join(tid), Ok(TryJoin::Running));
        assert_eq!(manager.status(tid), Some(ThreadStatus::Running));
        assert_eq!(manager.active(), vec![tid]);

        flag.store(true, Ordering::SeqCst);
        wait_until(|| manager.try_join(tid) != Ok(TryJoin::Running));
        assert_eq!(manager.status(tid), Some(ThreadStatus::Joined));
        assert_eq!(manager.join(tid), Err(ThreadError::Busy(tid)));
    }

    #[test]
    fn pending_join_makes_try_join_busy() {
        let manager = Arc::new(ThreadManager::default());
        let flag: &'static AtomicBool = Box::leak(Box::new(AtomicBool::new(false)));
        let ctx = flag as *const AtomicBool as usize;
        let tid = unsafe { manager.spawn(wait_for_flag as usize, ctx) }.unwrap();

        let joiner = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.join(tid))
        };
        wait_until(|| manager.status(tid) == Some(ThreadStatus::Joining));

        let busy = manager.try_join(tid);
        assert_eq!(busy, Err(ThreadError::Busy(tid)));
        assert_eq!(JoinResult::from(busy.map(|_| 0usize)).error_code, pthread::EBUSY);

        flag.store(true, Ordering::SeqCst);
        let joined = joiner.join().unwrap();
        assert_eq!(JoinResult::from(joined).as_pair(), (0, 42));
    }

    #[test]
    fn racing_join_and_try_join_have_one_winner() {
        for _ in 0..16 {
            let manager = Arc::new(ThreadManager::default());
            let tid = unsafe { manager.spawn(add_one as usize, 6) }.unwrap();
            wait_until(|| {
                matches!(
                    manager.registry.lock().slots.get(&tid),
                    Some(Slot::Running(h)) if h.is_finished()
                )
            });

            let barrier = Arc::new(Barrier::new(2));
            let join = {
                let (manager, barrier) = (Arc::clone(&manager), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    manager.join(tid)
                })
            };
            barrier.wait();
            let polled = manager.try_join(tid);
            let joined = join.join().unwrap();

            let winners = [joined.is_ok(), polled.is_ok()];
            assert_eq!(winners.iter().filter(|w| **w).count(), 1);
            match (joined, polled) {
                (Ok(status), Err(e)) => {
                    assert_eq!(status, 7);
                    assert_eq!(e, ThreadError::Busy(tid));
                }
                (Err(e), Ok(TryJoin::Finished(status))) => {
                    assert_eq!(status, 7);
                    assert_eq!(e, ThreadError::Busy(tid));
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_and_null_threads() {
        let manager = ThreadManager::default();
        let tid = Tid::from_raw(999);
        assert_eq!(manager.join(tid), Err(ThreadError::Invalid(tid)));
        assert_eq!(JoinResult::from(manager.join(tid)).error_code, pthread::ESRCH);
        assert_eq!(
            unsafe { manager.spawn(0, 0) },
            Err(ThreadError::NullEntry)
        );
    }

    #[test]
    fn joined_tids_are_compacted() {
        let manager = ThreadManager::default();
        let tids: Vec<Tid> = (0..8)
            .map(|i| unsafe { manager.spawn(add_one as usize, i) }.unwrap())
            .collect();

        for tid in tids[1..].iter().rev() {
            manager.join(*tid).unwrap();
        }
        assert_eq!(manager.registry.lock().joined.above.len(), 7);
        assert_eq!(manager.join(tids[0]), Ok(1));

        {
            let registry = manager.registry.lock();
            assert!(registry.slots.is_empty());
            assert!(registry.joined.above.is_empty());
            assert_eq!(registry.joined.floor, registry.next_tid);
        }
        for tid in &tids {
            assert_eq!(manager.status(*tid), Some(ThreadStatus::Joined));
            assert_eq!(manager.join(*tid), Err(ThreadError::Busy(*tid)));
        }
        let unissued = Tid::from_raw(tids[7].as_raw() + 1);
        assert_eq!(manager.status(unissued), None);
        assert_eq!(manager.join(unissued), Err(ThreadError::Invalid(unissued)));
        assert_eq!(manager.join(Tid::from_raw(0)), Err(ThreadError::Invalid(Tid::from_raw(0))));
    }

    #[test]
    fn tids_are_unique_and_threads_are_named() {
        let manager = ThreadManager::new(ThreadConfig {
            name_prefix: "worker".to_string(),
            stack_size: Some(256 * 1024),
        });
        let a = unsafe { manager.spawn(add_one as usize, 0) }.unwrap();
        let b = unsafe { manager.spawn(add_one as usize, 1) }.unwrap();
        assert_ne!(a, b);
        assert_eq!(manager.join(a), Ok(1));
        assert_eq!(manager.join(b), Ok(2));
    }
}
