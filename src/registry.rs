//! The process-wide table of registered heaps.
//!
//! Registration is append-only: identifiers come from an atomic counter,
//! a slot is written exactly once, and readers that observe `READY` are
//! guaranteed a fully initialized entry. Nothing here allocates, so the
//! registry is safe to touch from inside an allocator hook.

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr;
use std::str;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

pub const MAX_HEAPS: usize = 256;
pub const HEAP_NAME_SZ: usize = 64;

/// Invoked with `true`/`false` whenever the heap's enabled flag flips.
pub type EnabledCallback = extern "C" fn(bool);

/// The ABI-stable descriptor a caller hands to `register_heap`.
///
/// Callers pass their compiled-in `sizeof` alongside the pointer; fields may
/// only ever be appended, and a shorter caller's missing tail reads as zero.
#[repr(C)]
pub struct HeapInfo {
    pub name: [u8; HEAP_NAME_SZ],
    pub callback: Option<EnabledCallback>,
}

impl HeapInfo {
    pub fn new(name: &str, callback: Option<EnabledCallback>) -> HeapInfo {
        let mut bytes = [0u8; HEAP_NAME_SZ];
        let n = name.len().min(HEAP_NAME_SZ - 1);
        bytes[..n].copy_from_slice(&name.as_bytes()[..n]);
        HeapInfo {
            name: bytes,
            callback,
        }
    }
}

bitflags! {
    struct HeapFlags: u8 {
        /// The slot's info copy is complete and will never change again.
        const READY = 1;
        /// The current session's config names this heap.
        const ENABLED = 1 << 1;
    }
}

struct HeapSlot {
    /// Packed READY/ENABLED bits. The hot path reads this with `Relaxed`;
    /// a flip may be observed late by a concurrent caller, which costs one
    /// stray (ignored) record at worst.
    flags: AtomicU8,
    service_heap_id: AtomicU32,
    info: UnsafeCell<HeapInfo>,
}

// NOTE(unsafe) info is written once by the slot's id owner before READY is
// published with Release; everyone else only reads it after observing READY.
unsafe impl Sync for HeapSlot {}

impl HeapSlot {
    const UNUSED: HeapSlot = HeapSlot {
        flags: AtomicU8::new(0),
        service_heap_id: AtomicU32::new(0),
        info: UnsafeCell::new(HeapInfo {
            name: [0; HEAP_NAME_SZ],
            callback: None,
        }),
    };

    fn flags(&self) -> HeapFlags {
        HeapFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    fn is_ready(&self) -> bool {
        // Acquire pairs with the Release in register: a reader that sees
        // READY also sees the info copy.
        HeapFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
            .contains(HeapFlags::READY)
    }

    fn callback(&self) -> Option<EnabledCallback> {
        // NOTE(unsafe) only called after is_ready; the field never changes
        // again once published.
        unsafe { (*self.info.get()).callback }
    }

    fn name(&self) -> &str {
        // NOTE(unsafe) same publication argument as callback
        let bytes = unsafe { &(*self.info.get()).name };
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        str::from_utf8(&bytes[..end]).unwrap_or("")
    }
}

pub struct HeapRegistry {
    next_id: AtomicU32,
    slots: [HeapSlot; MAX_HEAPS],
}

impl HeapRegistry {
    pub const fn new() -> Self {
        HeapRegistry {
            // Slot 0 is reserved so that 0 can mean "registration failed".
            next_id: AtomicU32::new(1),
            slots: [HeapSlot::UNUSED; MAX_HEAPS],
        }
    }

    /// Copies the first `n` bytes of the caller's `HeapInfo` into a fresh
    /// slot and publishes it. Returns 0 when the table is full or the caller
    /// claims a struct larger than this library knows about (a caller newer
    /// than the library; nothing sane can be done with the extra fields).
    pub fn register(&self, info: *const HeapInfo, n: usize) -> u32 {
        if info.is_null() {
            return 0;
        }
        if n > size_of::<HeapInfo>() {
            warn!(
                "rejecting heap registration with {} byte info ({} known)",
                n,
                size_of::<HeapInfo>()
            );
            return 0;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if id as usize >= MAX_HEAPS {
            warn!("heap registry exhausted, rejecting registration");
            return 0;
        }

        let slot = &self.slots[id as usize];
        // NOTE(unsafe) fetch_add handed this id to exactly one caller, and
        // ids are never reused, so the slot is ours to write. The tail past
        // n stays zeroed.
        unsafe {
            ptr::copy_nonoverlapping(info as *const u8, slot.info.get() as *mut u8, n);
        }
        slot.flags
            .store(HeapFlags::READY.bits(), Ordering::Release);
        id
    }

    fn slot(&self, id: u32) -> Option<&HeapSlot> {
        if id == 0 || id as usize >= MAX_HEAPS {
            return None;
        }
        let slot = &self.slots[id as usize];
        if slot.is_ready() {
            Some(slot)
        } else {
            None
        }
    }

    /// The hot-path gate: one relaxed load, no synchronization.
    pub fn enabled(&self, id: u32) -> bool {
        if id == 0 || id as usize >= MAX_HEAPS {
            return false;
        }
        self.slots[id as usize]
            .flags()
            .contains(HeapFlags::READY | HeapFlags::ENABLED)
    }

    pub fn service_heap_id(&self, id: u32) -> u32 {
        match self.slot(id) {
            Some(slot) => slot.service_heap_id.load(Ordering::Relaxed),
            None => 0,
        }
    }

    pub fn name(&self, id: u32) -> Option<String> {
        self.slot(id).map(|slot| slot.name().to_string())
    }

    /// Every id that has been published, in registration order.
    pub fn ready_ids(&self) -> Vec<u32> {
        let hwm = self
            .next_id
            .load(Ordering::Relaxed)
            .min(MAX_HEAPS as u32);
        (1..hwm).filter(|&id| self.slot(id).is_some()).collect()
    }

    pub fn ready_names(&self) -> Vec<String> {
        self.ready_ids()
            .into_iter()
            .filter_map(|id| self.name(id))
            .collect()
    }

    /// Applies one heap's share of a freshly negotiated config: `Some`
    /// enables it under the given service-side id, `None` disables it.
    /// The callback fires only on an actual flip.
    pub fn configure(&self, id: u32, service: Option<u32>) {
        let slot = match self.slot(id) {
            Some(slot) => slot,
            None => return,
        };
        let was_enabled = slot.flags().contains(HeapFlags::ENABLED);
        match service {
            Some(service_id) => {
                slot.service_heap_id.store(service_id, Ordering::Relaxed);
                if !was_enabled {
                    slot.flags.store(
                        (HeapFlags::READY | HeapFlags::ENABLED).bits(),
                        Ordering::Release,
                    );
                    if let Some(cb) = slot.callback() {
                        cb(true);
                    }
                }
            }
            None => {
                if was_enabled {
                    slot.flags
                        .store(HeapFlags::READY.bits(), Ordering::Release);
                    if let Some(cb) = slot.callback() {
                        cb(false);
                    }
                }
            }
        }
    }

    /// Disables every heap, firing callbacks for the ones that flip.
    pub fn disable_all(&self) {
        for id in self.ready_ids() {
            self.configure(id, None);
        }
    }

    /// Clears every enabled flag without running callbacks. Post-fork-child
    /// only: the callbacks belong to the host and may take locks that died
    /// with the parent's threads.
    pub fn force_disable_all(&self) {
        let hwm = self
            .next_id
            .load(Ordering::Relaxed)
            .min(MAX_HEAPS as u32);
        for id in 1..hwm {
            let slot = &self.slots[id as usize];
            let flags = slot.flags();
            if flags.contains(HeapFlags::ENABLED) {
                slot.flags.store(
                    (flags - HeapFlags::ENABLED).bits(),
                    Ordering::Release,
                );
            }
        }
    }
}

pub static REGISTRY: HeapRegistry = HeapRegistry::new();

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static ENABLES: AtomicUsize = AtomicUsize::new(0);
    static DISABLES: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn counting_callback(enabled: bool) {
        if enabled {
            ENABLES.fetch_add(1, Ordering::SeqCst);
        } else {
            DISABLES.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dense_ids_and_name_readback() {
        let registry = HeapRegistry::new();

        let a = HeapInfo::new("libc.malloc", None);
        let b = HeapInfo::new("art", None);
        let id_a = registry.register(&a, size_of::<HeapInfo>());
        let id_b = registry.register(&b, size_of::<HeapInfo>());

        assert_eq!(id_a, 1);
        assert_eq!(id_b, 2);
        assert_eq!(registry.name(id_a), Some("libc.malloc".to_string()));
        assert_eq!(registry.name(id_b), Some("art".to_string()));
        assert_eq!(registry.ready_ids(), vec![1, 2]);
        assert!(!registry.enabled(id_a));
    }

    #[test]
    fn rejects_forward_incompatible_info() {
        let registry = HeapRegistry::new();
        let info = HeapInfo::new("newer", None);
        assert_eq!(registry.register(&info, size_of::<HeapInfo>() + 8), 0);
    }

    #[test]
    fn rejects_registration_past_capacity() {
        let registry = HeapRegistry::new();
        let info = HeapInfo::new("h", None);
        for expected in 1..MAX_HEAPS as u32 {
            assert_eq!(registry.register(&info, size_of::<HeapInfo>()), expected);
        }
        assert_eq!(registry.register(&info, size_of::<HeapInfo>()), 0);
        assert_eq!(registry.register(&info, size_of::<HeapInfo>()), 0);
    }

    #[test]
    fn configure_flips_fire_callbacks_once() {
        let registry = HeapRegistry::new();
        let info = HeapInfo::new("cb", Some(counting_callback));
        let id = registry.register(&info, size_of::<HeapInfo>());

        registry.configure(id, Some(7));
        assert!(registry.enabled(id));
        assert_eq!(registry.service_heap_id(id), 7);
        assert_eq!(ENABLES.load(Ordering::SeqCst), 1);

        // same outcome, no flip, no callback
        registry.configure(id, Some(9));
        assert_eq!(ENABLES.load(Ordering::SeqCst), 1);
        assert_eq!(registry.service_heap_id(id), 9);

        registry.configure(id, None);
        assert!(!registry.enabled(id));
        assert_eq!(DISABLES.load(Ordering::SeqCst), 1);
        registry.configure(id, None);
        assert_eq!(DISABLES.load(Ordering::SeqCst), 1);
    }

    static FORK_ENABLES: AtomicUsize = AtomicUsize::new(0);
    static FORK_DISABLES: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn fork_counting_callback(enabled: bool) {
        if enabled {
            FORK_ENABLES.fetch_add(1, Ordering::SeqCst);
        } else {
            FORK_DISABLES.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn force_disable_skips_callbacks() {
        let registry = HeapRegistry::new();
        let info = HeapInfo::new("forked", Some(fork_counting_callback));
        let id = registry.register(&info, size_of::<HeapInfo>());

        registry.configure(id, Some(1));
        assert_eq!(FORK_ENABLES.load(Ordering::SeqCst), 1);

        registry.force_disable_all();
        assert!(!registry.enabled(id));
        assert_eq!(FORK_DISABLES.load(Ordering::SeqCst), 0);
    }
}
