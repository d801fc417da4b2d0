//! Pool of packet buffers with reference counts for zero-copy multicast
//! fanout (§4.1).
//!
//! A buffer's lifetime is the `Arc<Buffer>` strong count: `clone` hands out
//! another `Arc` over the same bytes, `free` drops one, and the buffer is
//! reclaimed automatically when the last `Arc` drops. Descriptors are kept
//! in a capacity-bounded slab; each thread defers descriptor removal into a
//! small local batch so the common alloc/free path only touches the shared
//! lock once every [`LOCAL_BATCH`] frees instead of on every call.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use slab::Slab;

use crate::error::{Result, RouterError};
use crate::wire::{Packet, PacketHeader};

const LOCAL_BATCH: usize = 128;
pub const DEFAULT_MAX_DESCRIPTORS: usize = 1 << 17;
pub const DEFAULT_MAX_BUFFERS: usize = 1 << 16;

struct Buffer {
    payload: Bytes,
    live: Arc<AtomicUsize>,
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Descriptor {
    header: PacketHeader,
    buffer: Arc<Buffer>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PacketHandle(usize);

struct Inner {
    descriptors: Slab<Descriptor>,
}

pub struct PacketStore {
    inner: Mutex<Inner>,
    max_descriptors: usize,
    max_buffers: usize,
    live_buffers: Arc<AtomicUsize>,
}

thread_local! {
    static PENDING_FREE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

impl PacketStore {
    pub fn new(max_descriptors: usize, max_buffers: usize) -> Self {
        PacketStore {
            inner: Mutex::new(Inner {
                descriptors: Slab::with_capacity(max_descriptors.min(4096)),
            }),
            max_descriptors,
            max_buffers,
            live_buffers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_DESCRIPTORS, DEFAULT_MAX_BUFFERS)
    }

    /// Allocate a fresh buffer and descriptor for `packet`.
    pub fn alloc(&self, packet: Packet) -> Result<PacketHandle> {
        if self.live_buffers.fetch_add(1, Ordering::AcqRel) >= self.max_buffers {
            self.live_buffers.fetch_sub(1, Ordering::AcqRel);
            return Err(RouterError::OutOfPackets);
        }
        let buffer = Arc::new(Buffer {
            payload: packet.payload,
            live: self.live_buffers.clone(),
        });
        self.insert_descriptor(Descriptor {
            header: packet.header,
            buffer,
        })
    }

    /// Create a new descriptor sharing the same underlying buffer — the
    /// zero-copy path used for multicast replication.
    pub fn clone_pkt(&self, handle: PacketHandle) -> Result<PacketHandle> {
        let (header, buffer) = self.with_descriptor(handle, |d| (d.header.clone(), d.buffer.clone()))?;
        self.insert_descriptor(Descriptor { header, buffer })
    }

    /// Allocate a fresh buffer that is a byte-for-byte copy of `handle`'s
    /// payload, independent of the original.
    pub fn full_copy(&self, handle: PacketHandle) -> Result<PacketHandle> {
        let (header, payload) =
            self.with_descriptor(handle, |d| (d.header.clone(), d.buffer.payload.clone()))?;
        self.alloc(Packet { header, payload })
    }

    pub fn header(&self, handle: PacketHandle) -> Result<PacketHeader> {
        self.with_descriptor(handle, |d| d.header.clone())
    }

    pub fn payload(&self, handle: PacketHandle) -> Result<Bytes> {
        self.with_descriptor(handle, |d| d.buffer.payload.clone())
    }

    pub fn set_header(&self, handle: PacketHandle, header: PacketHeader) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let d = inner
            .descriptors
            .get_mut(handle.0)
            .ok_or_else(|| RouterError::Internal("stale packet handle".into()))?;
        d.header = header;
        Ok(())
    }

    /// Release this descriptor's hold on its buffer. The buffer itself is
    /// reclaimed once every descriptor referencing it has been freed.
    pub fn free(&self, handle: PacketHandle) {
        PENDING_FREE.with(|cell| {
            let mut pending = cell.borrow_mut();
            pending.push(handle.0);
            if pending.len() >= LOCAL_BATCH {
                self.flush(&mut pending);
            }
        });
    }

    fn flush(&self, pending: &mut Vec<usize>) {
        let mut inner = self.inner.lock().unwrap();
        for key in pending.drain(..) {
            inner.descriptors.try_remove(key);
        }
    }

    fn with_descriptor<T>(&self, handle: PacketHandle, f: impl FnOnce(&Descriptor) -> T) -> Result<T> {
        let inner = self.inner.lock().unwrap();
        inner
            .descriptors
            .get(handle.0)
            .map(f)
            .ok_or_else(|| RouterError::Internal("stale packet handle".into()))
    }

    fn insert_descriptor(&self, d: Descriptor) -> Result<PacketHandle> {
        let mut inner = self.inner.lock().unwrap();
        if inner.descriptors.len() >= self.max_descriptors {
            drop(inner);
            return Err(RouterError::OutOfPackets);
        }
        Ok(PacketHandle(inner.descriptors.insert(d)))
    }

    /// Force any thread-local pending frees to be applied now. Used at
    /// shutdown so descriptor/buffer counts settle before reporting stats.
    pub fn flush_pending(&self) {
        PENDING_FREE.with(|cell| {
            let mut pending = cell.borrow_mut();
            if !pending.is_empty() {
                self.flush(&mut pending);
            }
        });
    }

    pub fn live_buffer_count(&self) -> usize {
        self.live_buffers.load(Ordering::Acquire)
    }
}
