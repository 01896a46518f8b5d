//! Kernel request buffers and the size-class pool they come from.
//!
//! A [`NativeRequestBuffer`] is the memory the kernel writes a parsed request
//! into. Its size is negotiated: a receive starts with an estimate and the
//! kernel answers "more data" with the size it needs. Buffers are owned by
//! exactly one accept operation until the request they hold is handed to the
//! application, and go back to their [`BufferPool`] class on drop.
//!
//! Classes are powers of two from 4 KiB to 64 KiB; anything larger is
//! allocated on demand and freed normally.

use std::fmt;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::transport::{ConnectionId, RequestId};

/// Smallest pooled class.
pub const MIN_CLASS_SIZE: usize = 4096;

const CLASS_COUNT: usize = 5;

/// Buffers kept per class when idle.
const DEFAULT_CLASS_DEPTH: usize = 64;

/// Request metadata the kernel writes next to the raw head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeRequestHeader {
    pub request_id: RequestId,
    pub connection_id: ConnectionId,
    /// Context value of the url prefix the request was routed through.
    pub url_context: u64,
    pub unknown_header_count: u16,
    pub authenticated: bool,
}

struct PoolInner {
    classes: Vec<ArrayQueue<Vec<u8>>>,
}

impl PoolInner {
    fn class_for(size: usize) -> Option<usize> {
        (0..CLASS_COUNT).find(|&class| size <= MIN_CLASS_SIZE << class)
    }
}

/// Size-class arena for request buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_depth(DEFAULT_CLASS_DEPTH)
    }

    /// Creates a pool keeping at most `depth` idle buffers per class.
    pub fn with_depth(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            inner: Arc::new(PoolInner {
                classes: (0..CLASS_COUNT).map(|_| ArrayQueue::new(depth)).collect(),
            }),
        }
    }

    /// Hands out a buffer able to hold `size` bytes.
    ///
    /// Sizes up to the largest class reuse idle storage from that class;
    /// larger sizes get a dedicated allocation.
    pub fn acquire(&self, size: usize) -> NativeRequestBuffer {
        let class = PoolInner::class_for(size);
        let storage = match class {
            Some(class) => self.inner.classes[class]
                .pop()
                .unwrap_or_else(|| vec![0; MIN_CLASS_SIZE << class]),
            None => vec![0; size],
        };

        NativeRequestBuffer {
            storage,
            size,
            filled: 0,
            header: NativeRequestHeader::default(),
            home: class.map(|class| (self.inner.clone(), class)),
        }
    }

    /// Number of idle buffers held for the class serving `size`.
    pub fn idle(&self, size: usize) -> usize {
        PoolInner::class_for(size)
            .map(|class| self.inner.classes[class].len())
            .unwrap_or(0)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory the kernel fills with one request.
pub struct NativeRequestBuffer {
    storage: Vec<u8>,
    /// Negotiated size; the kernel never writes past it.
    size: usize,
    filled: usize,
    header: NativeRequestHeader,
    home: Option<(Arc<PoolInner>, usize)>,
}

impl NativeRequestBuffer {
    /// Negotiated size of this buffer.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Request id the kernel last wrote into this buffer.
    pub fn request_id(&self) -> RequestId {
        self.header.request_id
    }

    pub fn header(&self) -> &NativeRequestHeader {
        &self.header
    }

    /// Bytes the kernel wrote.
    pub fn data(&self) -> &[u8] {
        &self.storage[..self.filled]
    }

    pub fn is_filled(&self) -> bool {
        self.filled > 0
    }

    /// Kernel side: store a request.
    ///
    /// The header is always written so the request id survives a too-small
    /// buffer. Returns `Err(needed)` when `head` does not fit.
    pub fn fill(&mut self, header: NativeRequestHeader, head: &[u8]) -> Result<usize, usize> {
        self.write_header(header);
        if head.len() > self.size {
            return Err(head.len());
        }
        self.storage[..head.len()].copy_from_slice(head);
        self.filled = head.len();
        Ok(head.len())
    }

    /// Kernel side: record request metadata without any head bytes.
    pub fn write_header(&mut self, header: NativeRequestHeader) {
        self.header = header;
        self.filled = 0;
    }

    fn clear(&mut self) {
        self.filled = 0;
        self.header = NativeRequestHeader::default();
    }
}

impl fmt::Debug for NativeRequestBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeRequestBuffer")
            .field("size", &self.size)
            .field("filled", &self.filled)
            .field("header", &self.header)
            .finish()
    }
}

impl Drop for NativeRequestBuffer {
    fn drop(&mut self) {
        if let Some((pool, class)) = self.home.take() {
            self.clear();
            let storage = std::mem::take(&mut self.storage);
            // a full class just frees the storage
            let _ = pool.classes[class].push(storage);
        }
    }
}
