//! Memory Bridge
//!
//! Wraps native address ranges as buffers with an explicit ownership tag.
//!
//! # Ownership
//!
//! - `CallerOwned`: the bridge never releases the range on its own. The
//!   caller ends the buffer's life with [`MemoryBridge::unwrap`], which also
//!   releases the range.
//! - `BridgeOwned`: the range is released at most once, at the earliest of an
//!   explicit `unwrap`, the drop of the [`NativeBuffer`] handle, or the drop of
//!   the last [`MemoryBridge`] sharing the arena.
//!
//! Every live buffer is recorded in the arena's registry. Live ranges never
//! overlap, so a range cannot be owned by two buffers at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::config::MemoryConfig;
use crate::error::{AddressingReason, MemoryError};

// ─────────────────────────────────────────────────────────────────────────────
// Ownership & allocation
// ─────────────────────────────────────────────────────────────────────────────

/// Who is responsible for releasing a native range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ownership {
    CallerOwned,
    BridgeOwned,
}

impl std::fmt::Display for Ownership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ownership::CallerOwned => write!(f, "caller-owned"),
            Ownership::BridgeOwned => write!(f, "bridge-owned"),
        }
    }
}

/// Source and sink of native memory.
///
/// Allocation failures are reported with a `0` address; the bridge turns
/// that sentinel into [`MemoryError::Allocation`].
pub trait NativeAllocator: Send + Sync + 'static {
    fn allocate(&self, size: usize, zeroed: bool) -> usize;
    fn allocate_aligned(&self, alignment: usize, size: usize) -> usize;
    fn release(&self, address: usize, size: usize);
}

/// `calloc`/`malloc`/`posix_memalign`/`free` from the C library.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcAllocator;

impl NativeAllocator for LibcAllocator {
    fn allocate(&self, size: usize, zeroed: bool) -> usize {
        // SAFETY: plain allocation calls; a null result is handled by the caller.
        let ptr = unsafe {
            if zeroed {
                libc::calloc(1, size)
            } else {
                libc::malloc(size)
            }
        };
        ptr as usize
    }

    fn allocate_aligned(&self, alignment: usize, size: usize) -> usize {
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: `ptr` is a valid out-pointer; failure leaves it null.
        let rc = unsafe { libc::posix_memalign(&mut ptr, alignment, size) };
        if rc != 0 { 0 } else { ptr as usize }
    }

    fn release(&self, address: usize, _size: usize) {
        // SAFETY: only called once per registered range, which came from this
        // allocator or was handed over by `wrap`.
        unsafe { libc::free(address as *mut libc::c_void) }
    }
}

/// How a registered range is given back to the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Release {
    Allocator,
    Unmap,
}

// ─────────────────────────────────────────────────────────────────────────────
// Arena
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Slot {
    address: usize,
    size: usize,
    ownership: Ownership,
    release: Release,
}

#[derive(Default)]
struct ArenaState {
    slots: HashMap<u64, Slot>,
    /// Start address → buffer id, for overlap checks.
    ranges: BTreeMap<usize, u64>,
    released: u64,
}

impl ArenaState {
    /// The live slot overlapping `[address, end)`, if any.
    fn overlapping(&self, address: usize, end: usize) -> Option<&Slot> {
        let (_, id) = self.ranges.range(..end).next_back()?;
        let slot = self.slots.get(id)?;
        (slot.address + slot.size > address).then_some(slot)
    }

    fn take(&mut self, id: u64) -> Option<Slot> {
        let slot = self.slots.remove(&id)?;
        self.ranges.remove(&slot.address);
        Some(slot)
    }
}

struct Arena {
    allocator: Arc<dyn NativeAllocator>,
    config: MemoryConfig,
    state: Mutex<ArenaState>,
    next_id: AtomicU64,
}

impl Arena {
    fn register(
        &self,
        address: usize,
        size: usize,
        ownership: Ownership,
        release: Release,
    ) -> Result<u64, MemoryError> {
        if address == 0 {
            return Err(MemoryError::Addressing {
                address,
                reason: AddressingReason::Null,
            });
        }
        if size == 0 {
            return Err(MemoryError::Addressing {
                address,
                reason: AddressingReason::EmptyRange,
            });
        }
        let end = address.checked_add(size).ok_or(MemoryError::Addressing {
            address,
            reason: AddressingReason::Overflow,
        })?;

        let mut state = self.state.lock();
        if let Some(existing) = state.overlapping(address, end) {
            return Err(if existing.ownership == ownership {
                MemoryError::Aliased {
                    address,
                    size,
                    existing: existing.ownership,
                }
            } else {
                MemoryError::OwnershipConflict {
                    address,
                    size,
                    existing: existing.ownership,
                }
            });
        }
        if let Some(max) = self.config.max_live_buffers {
            if state.slots.len() >= max {
                return Err(MemoryError::Allocation { size });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        state.slots.insert(
            id,
            Slot {
                address,
                size,
                ownership,
                release,
            },
        );
        state.ranges.insert(address, id);
        trace!(address, size, %ownership, "Registered native range");
        Ok(id)
    }

    /// Remove a slot from the registry. The caller releases it.
    fn deregister(&self, id: u64) -> Option<Slot> {
        let mut state = self.state.lock();
        let slot = state.take(id)?;
        state.released += 1;
        Some(slot)
    }

    fn release(&self, slot: Slot) {
        match slot.release {
            Release::Allocator => self.allocator.release(slot.address, slot.size),
            Release::Unmap => {
                // SAFETY: the range was produced by mmap and is unmapped once.
                let rc = unsafe { libc::munmap(slot.address as *mut libc::c_void, slot.size) };
                if rc != 0 {
                    warn!(
                        address = slot.address,
                        size = slot.size,
                        error = %std::io::Error::last_os_error(),
                        "munmap failed"
                    );
                }
            }
        }
        trace!(address = slot.address, size = slot.size, "Released native range");
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let state = std::mem::take(&mut *self.state.lock());
        let mut released = 0usize;
        let mut leaked = 0usize;
        for slot in state.slots.into_values() {
            match slot.ownership {
                Ownership::BridgeOwned => {
                    self.release(slot);
                    released += 1;
                }
                Ownership::CallerOwned => leaked += 1,
            }
        }
        if leaked > 0 {
            warn!(leaked, "Arena dropped with live caller-owned buffers");
        }
        debug!(released, "Arena dropped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Native buffer
// ─────────────────────────────────────────────────────────────────────────────

/// A view over a native memory range.
///
/// Not `Clone`: each range has exactly one owning handle. Operations take
/// `&NativeBuffer` so the handle outlives its own release and later misuse is
/// reported instead of being impossible to express.
pub struct NativeBuffer {
    id: u64,
    address: usize,
    size: usize,
    ownership: Ownership,
    /// `true` while live. Readers hold the read lock for the duration of a
    /// copy; release takes the write lock.
    live: RwLock<bool>,
    arena: Weak<Arena>,
}

impl NativeBuffer {
    /// Size of the range in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_live(&self) -> bool {
        *self.live.read() && self.arena.strong_count() > 0
    }

    fn not_live(&self) -> MemoryError {
        MemoryError::Addressing {
            address: self.address,
            reason: AddressingReason::NotLive,
        }
    }

    fn arena(&self) -> Result<Arc<Arena>, MemoryError> {
        self.arena.upgrade().ok_or(MemoryError::Addressing {
            address: self.address,
            reason: AddressingReason::ArenaGone,
        })
    }

    fn check_range(&self, offset: usize, length: usize) -> Result<usize, MemoryError> {
        match offset.checked_add(length) {
            Some(end) if end <= self.size => Ok(self.address + offset),
            _ => Err(MemoryError::Bounds {
                offset,
                length,
                size: self.size,
            }),
        }
    }
}

impl std::fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("ownership", &self.ownership)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        let live = self.live.get_mut();
        if !std::mem::replace(live, false) {
            return;
        }
        let Some(arena) = self.arena.upgrade() else {
            return;
        };
        let Some(slot) = arena.deregister(self.id) else {
            return;
        };
        match slot.ownership {
            Ownership::BridgeOwned => arena.release(slot),
            Ownership::CallerOwned => warn!(
                address = slot.address,
                size = slot.size,
                "Caller-owned buffer dropped while live; range not released"
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tagged views
// ─────────────────────────────────────────────────────────────────────────────

/// An owned byte view tagged with the address and size native code should use.
pub struct Ptr {
    view: Box<[u8]>,
    ptr: usize,
    size: usize,
}

impl Ptr {
    /// Tag a view with its own address and length.
    pub fn new(view: Box<[u8]>) -> Self {
        let ptr = view.as_ptr() as usize;
        let size = view.len();
        Self { view, ptr, size }
    }

    pub fn ptr(&self) -> usize {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.view
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.view
    }

    pub fn into_inner(self) -> Box<[u8]> {
        self.view
    }
}

impl std::fmt::Debug for Ptr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ptr")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("size", &self.size)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory bridge
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of an arena's registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MemoryStats {
    pub live: usize,
    pub live_bytes: usize,
    pub released: u64,
}

/// Entry point for wrapping, reading and releasing native memory.
///
/// Cloning shares the arena. The arena, and every bridge-owned buffer still
/// registered in it, is released when the last clone drops.
#[derive(Clone)]
pub struct MemoryBridge {
    arena: Arc<Arena>,
}

impl Default for MemoryBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBridge {
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(LibcAllocator), MemoryConfig::default())
    }

    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::with_allocator(Arc::new(LibcAllocator), config.clone())
    }

    pub fn with_allocator(allocator: Arc<dyn NativeAllocator>, config: MemoryConfig) -> Self {
        Self {
            arena: Arc::new(Arena {
                allocator,
                config,
                state: Mutex::new(ArenaState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn handle(&self, id: u64, address: usize, size: usize, ownership: Ownership) -> NativeBuffer {
        NativeBuffer {
            id,
            address,
            size,
            ownership,
            live: RwLock::new(true),
            arena: Arc::downgrade(&self.arena),
        }
    }

    /// Create a live view over `[address, address + size)`.
    ///
    /// # Safety
    ///
    /// The range must be readable and writable for as long as the buffer is
    /// live. When the buffer is released through the bridge the range is
    /// handed to the arena's allocator, so it must have come from a
    /// compatible allocation.
    pub unsafe fn wrap(
        &self,
        address: usize,
        size: usize,
        ownership: Ownership,
    ) -> Result<NativeBuffer, MemoryError> {
        let id = self
            .arena
            .register(address, size, ownership, Release::Allocator)?;
        debug!(address, size, %ownership, "Wrapped native range");
        Ok(self.handle(id, address, size, ownership))
    }

    /// Allocate a fresh native range and wrap it.
    pub fn alloc(&self, size: usize, ownership: Ownership) -> Result<NativeBuffer, MemoryError> {
        let address = self
            .arena
            .allocator
            .allocate(size.max(1), self.arena.config.zero_fill);
        self.adopt(address, size, ownership, Release::Allocator)
    }

    /// Allocate a native range aligned to `alignment` and wrap it.
    pub fn aligned_alloc(
        &self,
        alignment: usize,
        size: usize,
        ownership: Ownership,
    ) -> Result<NativeBuffer, MemoryError> {
        let address = self.arena.allocator.allocate_aligned(alignment, size.max(1));
        if address != 0 && self.arena.config.zero_fill {
            // SAFETY: freshly allocated, at least `size` bytes.
            unsafe { std::ptr::write_bytes(address as *mut u8, 0, size) };
        }
        self.adopt(address, size, ownership, Release::Allocator)
    }

    /// Map memory with `mmap` and wrap it as caller-owned. Flags and
    /// protection bits are passed through to the host untouched.
    pub fn mmap(
        &self,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> Result<NativeBuffer, MemoryError> {
        // SAFETY: a null hint lets the kernel pick the address; failure is
        // reported through MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                length,
                prot,
                flags,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            debug!(
                length,
                error = %std::io::Error::last_os_error(),
                "mmap failed"
            );
            return Err(MemoryError::Allocation { size: length });
        }
        self.adopt(ptr as usize, length, Ownership::CallerOwned, Release::Unmap)
    }

    fn adopt(
        &self,
        address: usize,
        size: usize,
        ownership: Ownership,
        release: Release,
    ) -> Result<NativeBuffer, MemoryError> {
        if address == 0 {
            return Err(MemoryError::Allocation { size });
        }
        match self.arena.register(address, size, ownership, release) {
            Ok(id) => Ok(self.handle(id, address, size, ownership)),
            Err(e) => {
                self.arena.release(Slot {
                    address,
                    size,
                    ownership,
                    release,
                });
                Err(e)
            }
        }
    }

    /// End a buffer's life and release its range.
    ///
    /// A second call on the same buffer fails with
    /// [`MemoryError::DoubleRelease`] and releases nothing.
    pub fn unwrap(&self, buffer: &NativeBuffer) -> Result<(), MemoryError> {
        let double_release = || {
            error!(address = buffer.address, size = buffer.size, "Buffer released twice");
            MemoryError::DoubleRelease {
                address: buffer.address,
            }
        };
        let mut live = buffer.live.write();
        if !*live {
            return Err(double_release());
        }
        *live = false;

        let arena = buffer.arena()?;
        let slot = arena.deregister(buffer.id).ok_or_else(double_release)?;
        arena.release(slot);
        debug!(
            address = buffer.address,
            size = buffer.size,
            ownership = %buffer.ownership,
            "Unwrapped native range"
        );
        Ok(())
    }

    /// Raw address of a live buffer.
    pub fn address(&self, buffer: &NativeBuffer) -> Result<usize, MemoryError> {
        let live = buffer.live.read();
        if !*live {
            return Err(buffer.not_live());
        }
        buffer.arena()?;
        Ok(buffer.address)
    }

    /// Copy `length` bytes starting at `offset` into the front of `dest`.
    pub fn read(
        &self,
        buffer: &NativeBuffer,
        dest: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<(), MemoryError> {
        self.read_at(buffer, dest, 0, offset, length)
    }

    /// Copy `length` bytes starting at `offset` into `dest[dest_offset..]`.
    pub fn read_at(
        &self,
        buffer: &NativeBuffer,
        dest: &mut [u8],
        dest_offset: usize,
        offset: usize,
        length: usize,
    ) -> Result<(), MemoryError> {
        let live = buffer.live.read();
        if !*live {
            return Err(buffer.not_live());
        }
        let _arena = buffer.arena()?;
        let src = buffer.check_range(offset, length)?;
        let dest = checked_slice(dest, dest_offset, length)?;
        // SAFETY: the range is registered and live, and cannot be released
        // while the read lock and the arena reference are held.
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dest.as_mut_ptr(), length) };
        Ok(())
    }

    /// Copy `bytes` into the buffer starting at `offset`.
    pub fn write(
        &self,
        buffer: &NativeBuffer,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), MemoryError> {
        let live = buffer.live.read();
        if !*live {
            return Err(buffer.not_live());
        }
        let _arena = buffer.arena()?;
        let dst = buffer.check_range(offset, bytes.len())?;
        // SAFETY: see `read_at`.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst as *mut u8, bytes.len()) };
        Ok(())
    }

    /// Copy between two buffers with `memmove` semantics.
    pub fn copy(
        &self,
        dst: &NativeBuffer,
        dst_offset: usize,
        src: &NativeBuffer,
        src_offset: usize,
        length: usize,
    ) -> Result<(), MemoryError> {
        // Read locks queue behind a waiting writer, so re-entering one lock or
        // taking two in caller order can deadlock against `unwrap`. Distinct
        // buffers are locked lowest address first.
        let (dst_live, src_live) = if std::ptr::eq(dst, src) {
            (dst.live.read(), None)
        } else if std::ptr::from_ref(dst) < std::ptr::from_ref(src) {
            let dst_live = dst.live.read();
            (dst_live, Some(src.live.read()))
        } else {
            let src_live = src.live.read();
            (dst.live.read(), Some(src_live))
        };
        if !*dst_live {
            return Err(dst.not_live());
        }
        if matches!(&src_live, Some(live) if !**live) {
            return Err(src.not_live());
        }
        let _dst_arena = dst.arena()?;
        let _src_arena = src.arena()?;
        let to = dst.check_range(dst_offset, length)?;
        let from = src.check_range(src_offset, length)?;
        // SAFETY: both ranges are live and in bounds; `copy` tolerates overlap.
        unsafe { std::ptr::copy(from as *const u8, to as *mut u8, length) };
        Ok(())
    }

    /// Attach address metadata to an existing view so it can round-trip
    /// through native code without a copy.
    pub fn tag(&self, view: Box<[u8]>, address: usize, size: usize) -> Result<Ptr, MemoryError> {
        let base = view.as_ptr() as usize;
        let inside = address
            .checked_sub(base)
            .and_then(|start| start.checked_add(size))
            .is_some_and(|end| end <= view.len());
        if !inside {
            return Err(MemoryError::Addressing {
                address,
                reason: AddressingReason::OutsideView,
            });
        }
        Ok(Ptr {
            view,
            ptr: address,
            size,
        })
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.arena.state.lock();
        MemoryStats {
            live: state.slots.len(),
            live_bytes: state.slots.values().map(|s| s.size).sum(),
            released: state.released,
        }
    }
}

fn checked_slice(dest: &mut [u8], offset: usize, length: usize) -> Result<&mut [u8], MemoryError> {
    let size = dest.len();
    offset
        .checked_add(length)
        .and_then(|end| dest.get_mut(offset..end))
        .ok_or(MemoryError::Bounds {
            offset,
            length,
            size,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Libc allocator that counts releases.
    #[derive(Default)]
    struct CountingAllocator {
        released: AtomicUsize,
    }

    impl NativeAllocator for CountingAllocator {
        fn allocate(&self, size: usize, zeroed: bool) -> usize {
            LibcAllocator.allocate(size, zeroed)
        }

        fn allocate_aligned(&self, alignment: usize, size: usize) -> usize {
            LibcAllocator.allocate_aligned(alignment, size)
        }

        fn release(&self, address: usize, size: usize) {
            self.released.fetch_add(1, Ordering::SeqCst);
            LibcAllocator.release(address, size);
        }
    }

    fn counting() -> (MemoryBridge, Arc<CountingAllocator>) {
        let allocator = Arc::new(CountingAllocator::default());
        let bridge = MemoryBridge::with_allocator(allocator.clone(), MemoryConfig::default());
        (bridge, allocator)
    }

    fn raw_alloc(size: usize) -> usize {
        LibcAllocator.allocate(size, true)
    }

    #[test]
    fn caller_owned_unwrap_succeeds_exactly_once() {
        let (bridge, allocator) = counting();
        let address = raw_alloc(64);
        let buf = unsafe { bridge.wrap(address, 64, Ownership::CallerOwned) }.unwrap();

        let mut dst = [0u8; 64];
        bridge.read(&buf, &mut dst, 0, 64).unwrap();

        bridge.unwrap(&buf).unwrap();
        assert_eq!(allocator.released.load(Ordering::SeqCst), 1);

        let err = bridge.unwrap(&buf).unwrap_err();
        assert_eq!(err, MemoryError::DoubleRelease { address });
        assert!(err.is_fatal());
        assert_eq!(allocator.released.load(Ordering::SeqCst), 1);

        let err = bridge.read(&buf, &mut dst, 0, 64).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Addressing {
                reason: AddressingReason::NotLive,
                ..
            }
        ));
        assert!(bridge.address(&buf).is_err());
    }

    #[test]
    fn read_and_write_respect_bounds() {
        let bridge = MemoryBridge::new();
        let buf = bridge.alloc(16, Ownership::BridgeOwned).unwrap();

        bridge.write(&buf, 4, b"lo!").unwrap();
        let mut dst = [0u8; 8];
        bridge.read_at(&buf, &mut dst, 2, 4, 3).unwrap();
        assert_eq!(&dst[2..5], b"lo!");

        assert_eq!(
            bridge.read(&buf, &mut dst, 12, 8).unwrap_err(),
            MemoryError::Bounds {
                offset: 12,
                length: 8,
                size: 16
            }
        );
        assert!(matches!(
            bridge.read_at(&buf, &mut dst, 6, 0, 4),
            Err(MemoryError::Bounds { .. })
        ));
        assert!(matches!(
            bridge.write(&buf, usize::MAX, b"x"),
            Err(MemoryError::Bounds { .. })
        ));
    }

    #[test]
    fn bridge_owned_released_on_drop() {
        let (bridge, allocator) = counting();
        let buf = bridge.alloc(32, Ownership::BridgeOwned).unwrap();
        assert_eq!(bridge.stats().live, 1);

        drop(buf);
        assert_eq!(allocator.released.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.stats().live, 0);
        assert_eq!(bridge.stats().released, 1);
    }

    #[test]
    fn caller_owned_not_released_on_drop() {
        let (bridge, allocator) = counting();
        let address = raw_alloc(8);
        let buf = unsafe { bridge.wrap(address, 8, Ownership::CallerOwned) }.unwrap();
        drop(buf);
        assert_eq!(allocator.released.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.stats().live, 0);
        LibcAllocator.release(address, 8);
    }

    #[test]
    fn arena_drop_releases_remaining_bridge_owned() {
        let (bridge, allocator) = counting();
        let a = bridge.alloc(8, Ownership::BridgeOwned).unwrap();
        let b = bridge.alloc(8, Ownership::BridgeOwned).unwrap();
        bridge.unwrap(&a).unwrap();
        assert_eq!(allocator.released.load(Ordering::SeqCst), 1);

        drop(bridge);
        assert_eq!(allocator.released.load(Ordering::SeqCst), 2);

        // Outliving the arena neither releases again nor reads freed memory.
        assert!(!b.is_live());
        let mut dst = [0u8; 8];
        assert!(matches!(
            MemoryBridge::new().read(&b, &mut dst, 0, 8),
            Err(MemoryError::Addressing {
                reason: AddressingReason::ArenaGone,
                ..
            })
        ));
        drop(b);
        assert_eq!(allocator.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mixed_ownership_over_one_range_is_rejected() {
        let bridge = MemoryBridge::new();
        let owned = bridge.alloc(64, Ownership::BridgeOwned).unwrap();
        let address = bridge.address(&owned).unwrap();

        let err = unsafe { bridge.wrap(address + 8, 8, Ownership::CallerOwned) }.unwrap_err();
        assert_eq!(
            err,
            MemoryError::OwnershipConflict {
                address: address + 8,
                size: 8,
                existing: Ownership::BridgeOwned
            }
        );
        let err = unsafe { bridge.wrap(address, 64, Ownership::BridgeOwned) }.unwrap_err();
        assert!(matches!(err, MemoryError::Aliased { .. }));

        // Once released the range can be wrapped again.
        bridge.unwrap(&owned).unwrap();
        assert_eq!(bridge.stats().live, 0);
    }

    #[test]
    fn wrap_rejects_null_and_empty_ranges() {
        let bridge = MemoryBridge::new();
        let err = unsafe { bridge.wrap(0, 8, Ownership::CallerOwned) }.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Addressing {
                reason: AddressingReason::Null,
                ..
            }
        ));
        let err = unsafe { bridge.wrap(0x1000, 0, Ownership::CallerOwned) }.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Addressing {
                reason: AddressingReason::EmptyRange,
                ..
            }
        ));
        let err = unsafe { bridge.wrap(usize::MAX - 4, 8, Ownership::CallerOwned) }.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Addressing {
                reason: AddressingReason::Overflow,
                ..
            }
        ));
    }

    #[test]
    fn live_buffer_cap_reports_allocation_failure() {
        let bridge = MemoryBridge::from_config(&MemoryConfig {
            max_live_buffers: Some(1),
            zero_fill: true,
        });
        let _a = bridge.alloc(8, Ownership::BridgeOwned).unwrap();
        assert_eq!(
            bridge.alloc(8, Ownership::BridgeOwned).unwrap_err(),
            MemoryError::Allocation { size: 8 }
        );
    }

    #[test]
    fn copy_handles_overlap_within_one_buffer() {
        let bridge = MemoryBridge::new();
        let buf = bridge.alloc(8, Ownership::BridgeOwned).unwrap();
        bridge.write(&buf, 0, b"abcdefgh").unwrap();
        bridge.copy(&buf, 2, &buf, 0, 4).unwrap();

        let mut out = [0u8; 8];
        bridge.read(&buf, &mut out, 0, 8).unwrap();
        assert_eq!(&out, b"ababcdgh");

        let other = bridge.alloc(4, Ownership::CallerOwned).unwrap();
        bridge.copy(&other, 0, &buf, 4, 4).unwrap();
        let mut out = [0u8; 4];
        bridge.read(&other, &mut out, 0, 4).unwrap();
        assert_eq!(&out, b"cdgh");
        bridge.unwrap(&other).unwrap();
        assert!(bridge.copy(&other, 0, &buf, 0, 1).is_err());
    }

    #[test]
    fn copy_never_holds_the_later_lock_while_waiting() {
        let bridge = MemoryBridge::new();
        let a = bridge.alloc(4, Ownership::BridgeOwned).unwrap();
        let b = bridge.alloc(4, Ownership::BridgeOwned).unwrap();
        let (first, second) = if std::ptr::from_ref(&a) < std::ptr::from_ref(&b) {
            (&a, &b)
        } else {
            (&b, &a)
        };
        bridge.write(first, 0, b"wxyz").unwrap();

        std::thread::scope(|scope| {
            // A release in progress on the first buffer.
            let held = first.live.write();
            let copier = scope.spawn(|| bridge.copy(second, 0, first, 0, 4));
            std::thread::sleep(std::time::Duration::from_millis(50));

            // The blocked copy must not be sitting on the second buffer.
            assert!(second.live.try_write().is_some());
            drop(held);
            copier.join().unwrap().unwrap();
        });

        let mut out = [0u8; 4];
        bridge.read(second, &mut out, 0, 4).unwrap();
        assert_eq!(&out, b"wxyz");
    }

    #[test]
    fn double_release_is_logged_as_error() {
        let logs = crate::test_support::LogCapture::default();
        let bridge = MemoryBridge::new();
        let buf = bridge.alloc(8, Ownership::CallerOwned).unwrap();
        bridge.unwrap(&buf).unwrap();

        let err = tracing::subscriber::with_default(logs.subscriber(), || {
            bridge.unwrap(&buf).unwrap_err()
        });
        assert!(err.is_fatal());
        let output = logs.contents();
        assert!(output.contains("ERROR"), "{output}");
        assert!(output.contains("Buffer released twice"), "{output}");
    }

    #[test]
    fn aligned_and_mapped_allocations() {
        let bridge = MemoryBridge::new();
        let aligned = bridge.aligned_alloc(64, 128, Ownership::BridgeOwned).unwrap();
        assert_eq!(bridge.address(&aligned).unwrap() % 64, 0);

        let mapped = bridge
            .mmap(
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
            .unwrap();
        assert_eq!(mapped.ownership(), Ownership::CallerOwned);
        bridge.write(&mapped, 4000, &[7; 96]).unwrap();
        bridge.unwrap(&mapped).unwrap();
        assert!(bridge.unwrap(&mapped).is_err());
    }

    #[test]
    fn tag_checks_range_inside_view() {
        let bridge = MemoryBridge::new();
        let view = vec![0u8; 32].into_boxed_slice();
        let base = view.as_ptr() as usize;

        let ptr = bridge.tag(view, base + 8, 16).unwrap();
        assert_eq!(ptr.ptr(), base + 8);
        assert_eq!(ptr.size(), 16);
        assert_eq!(ptr.as_slice().len(), 32);

        let view = ptr.into_inner();
        assert!(bridge.tag(view, base + 24, 16).is_err());

        let own = Ptr::new(vec![1u8; 4].into_boxed_slice());
        assert_eq!(own.size(), 4);
        assert_eq!(own.ptr(), own.as_slice().as_ptr() as usize);
    }

    #[test]
    fn racing_unwraps_release_once() {
        let (bridge, allocator) = counting();
        let buf = bridge.alloc(8, Ownership::CallerOwned).unwrap();
        let outcomes: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| bridge.unwrap(&buf))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(allocator.released.load(Ordering::SeqCst), 1);
    }
}
