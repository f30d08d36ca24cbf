use std::alloc::{self, Layout};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: u64 = u64::BITS as u64;

/// Number of distinct values a `u32` address can take.
pub(crate) const ADDRESS_SPACE: u64 = 1 << 32;

/// Lock-free bit array with one slot per IPv4 address.
///
/// The full set is `2^32` bits (512 MiB) regardless of how many addresses
/// are marked. Writers only ever OR bits in, so concurrent `mark` calls
/// commute and need no further coordination; `count` must only be called
/// once all writers are done.
#[derive(Debug)]
pub(crate) struct MembershipSet {
    words: Box<[AtomicU64]>,
}

impl MembershipSet {
    pub(crate) fn new() -> Self {
        Self::with_bits(ADDRESS_SPACE)
    }

    fn with_bits(bits: u64) -> Self {
        let len = bits.div_ceil(WORD_BITS) as usize;
        Self {
            words: zeroed_words(len),
        }
    }

    /// Sets the bit for `addr`. Returns `true` if it was not set before.
    #[inline]
    pub(crate) fn mark(&self, addr: u32) -> bool {
        let (word, mask) = Self::locate(addr);
        let prev = self.words[word].fetch_or(mask, Ordering::Relaxed);
        prev & mask == 0
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, addr: u32) -> bool {
        let (word, mask) = Self::locate(addr);
        self.words[word].load(Ordering::Relaxed) & mask != 0
    }

    /// Number of distinct addresses marked.
    pub(crate) fn count(&self) -> u64 {
        self.words
            .iter()
            .map(|word| u64::from(word.load(Ordering::Relaxed).count_ones()))
            .sum()
    }

    #[inline]
    fn locate(addr: u32) -> (usize, u64) {
        let addr = u64::from(addr);
        ((addr / WORD_BITS) as usize, 1 << (addr % WORD_BITS))
    }

    #[cfg(test)]
    pub(crate) fn small(bits: u64) -> Self {
        Self::with_bits(bits)
    }
}

/// Allocates `len` cleared words with a single zero-filled allocation.
fn zeroed_words(len: usize) -> Box<[AtomicU64]> {
    if len == 0 {
        return Box::new([]);
    }
    let layout = match Layout::array::<AtomicU64>(len) {
        Ok(layout) => layout,
        Err(_) => panic!("bit set of {len} words exceeds the address space"),
    };
    // SAFETY: `layout` is non-zero-sized and matches `[AtomicU64; len]`, which
    // is what `Box<[AtomicU64]>` frees; all-zero bytes are a valid AtomicU64.
    unsafe {
        let words = alloc::alloc_zeroed(layout).cast::<AtomicU64>();
        if words.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Box::from_raw(ptr::slice_from_raw_parts_mut(words, len))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tokio::sync::Mutex;

    /// Serialises tests that allocate the full 512 MiB set.
    pub(crate) static FULL_SET: Mutex<()> = Mutex::const_new(());

    #[test]
    fn mark_is_idempotent() {
        let set = MembershipSet::small(1 << 16);
        assert!(set.mark(42));
        assert!(!set.mark(42));
        assert!(!set.mark(42));
        assert_eq!(set.count(), 1);
        assert!(set.contains(42));
        assert!(!set.contains(43));
    }

    #[test]
    fn fresh_set_is_empty() {
        let set = MembershipSet::small(1000);
        assert_eq!(set.words.len(), 16);
        assert_eq!(set.count(), 0);
        assert!((0..1000).all(|addr| !set.contains(addr)));
        assert!(MembershipSet::small(0).words.is_empty());
    }

    #[test]
    fn word_edges() {
        let set = MembershipSet::small(1 << 16);
        for addr in [0, 63, 64, 127, 128] {
            assert!(set.mark(addr));
        }
        assert_eq!(set.count(), 5);
        assert!(!set.contains(1));
        assert!(!set.contains(65));
    }

    #[test]
    fn concurrent_writers_on_shared_words() {
        let set = Arc::new(MembershipSet::small(1 << 16));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = Arc::clone(&set);
                thread::spawn(move || {
                    for addr in 0..4096 {
                        set.mark(addr);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(set.count(), 4096);
    }

    #[tokio::test]
    async fn full_space_extremes() {
        let _guard = FULL_SET.lock().await;
        let set = MembershipSet::new();
        assert_eq!(set.words.len(), 1 << 26);
        assert!(set.mark(0));
        assert!(set.mark(u32::MAX));
        assert!(set.mark(1 << 31));
        assert!(set.contains(u32::MAX));
        assert!(!set.contains(u32::MAX - 1));
        assert_eq!(set.count(), 3);
    }
}
