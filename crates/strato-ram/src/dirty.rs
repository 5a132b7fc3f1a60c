//! Per-client dirty-page bitmaps.
//!
//! Each RAM block carries one bitmap per tracking client. Marking is a
//! relaxed atomic OR so the guest write path never takes a lock; clearing
//! uses atomic fetch-and so a mark racing a clear is either observed by the
//! clear or survives it, never lost.

use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::{PAGE_BITS, PAGE_SIZE};

bitflags! {
    /// Dirty-tracking clients. Each bit selects an independent bitmap.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirtyClients: u8 {
        /// Incremental migration / snapshot export.
        const MIGRATION = 1 << 0;
        /// Display refresh (framebuffer scanning).
        const DISPLAY = 1 << 1;
    }
}

/// Number of independent client bitmaps.
pub const DIRTY_CLIENT_COUNT: usize = 2;

const BITS_PER_WORD: u64 = 64;

fn client_index(client: DirtyClients) -> usize {
    if client == DirtyClients::MIGRATION {
        0
    } else if client == DirtyClients::DISPLAY {
        1
    } else {
        panic!("exactly one dirty client must be selected")
    }
}

/// Inclusive word/bit coordinates for a byte range, page-granular.
fn page_span(offset: u64, len: u64) -> Option<(u64, u64)> {
    if len == 0 {
        return None;
    }
    let first = offset >> PAGE_BITS;
    let last = (offset + len - 1) >> PAGE_BITS;
    Some((first, last))
}

/// One bitmap per client over the pages of a single RAM block.
#[derive(Debug)]
pub struct DirtyBitmap {
    pages: u64,
    words: [Box<[AtomicU64]>; DIRTY_CLIENT_COUNT],
}

impl DirtyBitmap {
    pub(crate) fn new(bytes: u64) -> Self {
        let pages = bytes.div_ceil(PAGE_SIZE);
        let nwords = usize::try_from(pages.div_ceil(BITS_PER_WORD))
            .expect("dirty bitmap word count fits usize");
        let alloc = || -> Box<[AtomicU64]> {
            (0..nwords).map(|_| AtomicU64::new(0)).collect()
        };
        Self {
            pages,
            words: [alloc(), alloc()],
        }
    }

    /// Number of tracked pages.
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Mark the pages covering `[offset, offset + len)` dirty for every
    /// client selected in `clients`.
    ///
    /// Safe to call concurrently from any number of writer threads.
    pub fn mark(&self, clients: DirtyClients, offset: u64, len: u64) {
        let Some((first, last)) = page_span(offset, len) else {
            return;
        };
        let last = last.min(self.pages.saturating_sub(1));
        if first > last {
            return;
        }
        for client in clients.iter() {
            let words = &self.words[client_index(client)];
            for_each_word(first, last, |word, mask| {
                words[word].fetch_or(mask, Ordering::Relaxed);
            });
        }
    }

    /// Returns whether any page in the range was dirty for `client`, clearing
    /// the range as a side effect.
    pub fn test_and_clear(&self, client: DirtyClients, offset: u64, len: u64) -> bool {
        let Some((first, last)) = page_span(offset, len) else {
            return false;
        };
        let last = last.min(self.pages.saturating_sub(1));
        if first > last {
            return false;
        }
        let words = &self.words[client_index(client)];
        let mut any = false;
        for_each_word(first, last, |word, mask| {
            let prev = words[word].fetch_and(!mask, Ordering::AcqRel);
            any |= prev & mask != 0;
        });
        any
    }

    /// Atomically capture and clear the dirty state of a range.
    pub fn snapshot_and_clear(&self, client: DirtyClients, offset: u64, len: u64) -> DirtySnapshot {
        let span = page_span(offset, len).map(|(first, last)| {
            (first, last.min(self.pages.saturating_sub(1)))
        });
        let Some((first, last)) = span.filter(|(f, l)| f <= l) else {
            return DirtySnapshot {
                first_page: 0,
                last_page: 0,
                bits: Vec::new(),
            };
        };

        let words = &self.words[client_index(client)];
        let first_word = first / BITS_PER_WORD;
        let last_word = last / BITS_PER_WORD;
        let mut bits = vec![0u64; (last_word - first_word + 1) as usize];
        for_each_word(first, last, |word, mask| {
            let prev = words[word].fetch_and(!mask, Ordering::AcqRel);
            bits[word - first_word as usize] |= prev & mask;
        });

        DirtySnapshot {
            first_page: first,
            last_page: last,
            bits,
        }
    }
}

/// Visit each bitmap word overlapping pages `first..=last` with the mask of
/// in-range bits.
fn for_each_word(first: u64, last: u64, mut f: impl FnMut(usize, u64)) {
    let mut page = first;
    while page <= last {
        let word = page / BITS_PER_WORD;
        let bit = page % BITS_PER_WORD;
        let span = (BITS_PER_WORD - bit).min(last - page + 1);
        let mask = if span == BITS_PER_WORD {
            u64::MAX
        } else {
            ((1u64 << span) - 1) << bit
        };
        f(word as usize, mask);
        page += span;
    }
}

/// An owned dirty-state capture produced by
/// [`DirtyBitmap::snapshot_and_clear`].
#[derive(Debug, Clone)]
pub struct DirtySnapshot {
    first_page: u64,
    last_page: u64,
    bits: Vec<u64>,
}

impl DirtySnapshot {
    /// Whether any page covering `[offset, offset + len)` was dirty when the
    /// snapshot was taken.
    pub fn dirty(&self, offset: u64, len: u64) -> bool {
        let Some((first, last)) = page_span(offset, len) else {
            return false;
        };
        if self.bits.is_empty() {
            return false;
        }
        let first = first.max(self.first_page);
        let last = last.min(self.last_page);
        if first > last {
            return false;
        }
        let base_word = self.first_page / BITS_PER_WORD;
        let mut hit = false;
        for_each_word(first, last, |word, mask| {
            if let Some(w) = self.bits.get(word - base_word as usize) {
                hit |= w & mask != 0;
            }
        });
        hit
    }

    /// Iterate the offsets of dirty pages in ascending order.
    pub fn dirty_pages(&self) -> impl Iterator<Item = u64> + '_ {
        let base_word = self.first_page / BITS_PER_WORD;
        (self.first_page..=self.last_page.max(self.first_page))
            .filter(move |page| {
                let word = (page / BITS_PER_WORD - base_word) as usize;
                let bit = page % BITS_PER_WORD;
                self.bits.get(word).is_some_and(|w| w & (1 << bit) != 0)
            })
            .map(|page| page << PAGE_BITS)
    }
}
