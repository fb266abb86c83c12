//! Scatter/gather regions for bulk payloads.
//!
//! A [`Region`] describes a window of caller memory that the consumer reads
//! from ([`Direction::ToConsumer`]) or writes into
//! ([`Direction::FromConsumer`]). Bytes move directly between the region and
//! the consumer's buffer; nothing is staged through the command body.
//!
//! Region memory is reference counted. Cloning a region shares the same
//! backing, so the caller keeps a clone to read results back while the
//! pending command holds another. The backing stays alive until the last
//! clone is gone, which is what makes an interrupted caller safe: the
//! consumer may still finish copying into a command nobody waits for.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Size of a page-backed buffer.
pub const PAGE_SIZE: usize = 4096;

/// Which way bulk data flows through a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Caller data the consumer reads (e.g. a file-write payload).
    ToConsumer,
    /// Space the consumer fills in (e.g. a file-read payload).
    FromConsumer,
}

/// Errors building a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    /// The requested window does not fit in the page.
    #[error("window {offset}+{len} does not fit in a page")]
    OutOfBounds { offset: usize, len: usize },
}

#[repr(C, align(4096))]
struct PageBytes([u8; PAGE_SIZE]);

/// A page-aligned 4 KiB buffer that can back one or more regions.
#[derive(Clone)]
pub struct Page {
    bytes: Arc<Mutex<Box<PageBytes>>>,
}

impl Page {
    /// Allocates a zeroed page.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Box::new(PageBytes([0; PAGE_SIZE])))),
        }
    }

    /// Allocates a page and fills its head with `src` (truncated to a page).
    #[must_use]
    pub fn from_slice(src: &[u8]) -> Self {
        let page = Self::zeroed();
        let n = src.len().min(PAGE_SIZE);
        page.bytes.lock().0[..n].copy_from_slice(&src[..n]);
        page
    }

    /// Copies the page contents out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.lock().0.to_vec()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum Backing {
    Heap(Arc<Mutex<Vec<u8>>>),
    Page(Page),
}

/// A window of caller memory taking part in a scatter/gather transfer.
#[derive(Clone)]
pub struct Region {
    backing: Backing,
    offset: usize,
    len: usize,
    direction: Direction,
}

impl Region {
    /// Bulk data for the consumer to read.
    #[must_use]
    pub fn to_consumer(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len();
        Self {
            backing: Backing::Heap(Arc::new(Mutex::new(bytes))),
            offset: 0,
            len,
            direction: Direction::ToConsumer,
        }
    }

    /// A zeroed buffer of `len` bytes for the consumer to fill.
    #[must_use]
    pub fn from_consumer(len: usize) -> Self {
        Self {
            backing: Backing::Heap(Arc::new(Mutex::new(vec![0; len]))),
            offset: 0,
            len,
            direction: Direction::FromConsumer,
        }
    }

    /// A window `offset..offset + len` of `page`.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::OutOfBounds`] if the window leaves the page.
    pub fn page(
        page: &Page,
        offset: usize,
        len: usize,
        direction: Direction,
    ) -> Result<Self, RegionError> {
        match offset.checked_add(len) {
            Some(end) if end <= PAGE_SIZE => Ok(Self {
                backing: Backing::Page(page.clone()),
                offset,
                len,
                direction,
            }),
            _ => Err(RegionError::OutOfBounds { offset, len }),
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }

    /// Copies the whole region into `dst`, which must be exactly `len` bytes.
    pub(crate) fn copy_out(&self, dst: &mut [u8]) {
        debug_assert_eq!(dst.len(), self.len);
        let range = self.offset..self.offset + self.len;
        match &self.backing {
            Backing::Heap(bytes) => dst.copy_from_slice(&bytes.lock()[range]),
            Backing::Page(page) => dst.copy_from_slice(&page.bytes.lock().0[range]),
        }
    }

    /// Fills the region from the head of `src`; returns the bytes consumed.
    pub(crate) fn copy_in(&self, src: &[u8]) -> usize {
        let n = src.len().min(self.len);
        let range = self.offset..self.offset + n;
        match &self.backing {
            Backing::Heap(bytes) => bytes.lock()[range].copy_from_slice(&src[..n]),
            Backing::Page(page) => page.bytes.lock().0[range].copy_from_slice(&src[..n]),
        }
        n
    }

    /// Copies the region's current contents out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.len];
        self.copy_out(&mut out);
        out
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Heap(_) => "heap",
            Backing::Page(_) => "page",
        };
        f.debug_struct("Region")
            .field("backing", &kind)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("direction", &self.direction)
            .finish()
    }
}

/// Total length of a region list.
#[cfg(test)]
pub(crate) fn total_len(regions: &[Region]) -> usize {
    regions.iter().map(Region::len).sum()
}

/// Copies whole regions into `dst` in order, stopping at the first that does
/// not fit.
///
/// Returns the bytes written and the number of regions copied.
pub(crate) fn gather(regions: &[Region], dst: &mut [u8]) -> (usize, usize) {
    let mut written = 0;
    let mut copied = 0;
    for region in regions {
        let end = written + region.len();
        if end > dst.len() {
            break;
        }
        region.copy_out(&mut dst[written..end]);
        written = end;
        copied += 1;
    }
    (written, copied)
}

/// Distributes `src` across `regions` in order.
///
/// Returns how many bytes landed in regions; the rest of `src` did not fit.
pub(crate) fn scatter(regions: &[Region], src: &[u8]) -> usize {
    let mut written = 0;
    for region in regions {
        if written == src.len() {
            break;
        }
        written += region.copy_in(&src[written..]);
    }
    written
}
