// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Byte buffers with registration metadata.
//!
//! Data-plane operations take any [`FabricBuf`]. [`UniqueBuf`] is the
//! move-only owner used on ordinary data paths; [`SharedBuf`] is cheaply
//! clonable for broadcast patterns where one payload is handed to several
//! endpoints and no single holder is guaranteed to outlive the others.
//!
//! Registration state (remote-access key, local descriptor, registered flag)
//! is written by the owning connection when it registers the buffer, via
//! [`FabricBuf::register_callback`]. The bytes of a buffer involved in a
//! posted operation are lent to the provider until the matching completion
//! is drained; the buffer must outlive every operation referring to it.

use std::cell::UnsafeCell;
use std::ops::{Index, IndexMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::fabric::LocalDesc;
use crate::MAX_MSG_SIZE;

/// The contract shared by both buffer flavors.
pub trait FabricBuf {
    /// Size in bytes, fixed at construction.
    fn size(&self) -> usize;

    /// Base pointer for read-only posts.
    fn as_raw(&self) -> *const u8;

    /// Base pointer for posts that write into the buffer.
    fn as_raw_mut(&mut self) -> *mut u8;

    /// Copy `input` into the buffer starting at `offset`.
    fn copy_to(&mut self, input: &[u8], offset: usize);

    /// Copy bytes starting at `offset` out of the buffer into `output`.
    fn copy_from(&self, output: &mut [u8], offset: usize);

    /// Invoked by the registering connection once a memory region covering
    /// this buffer exists.
    fn register_callback(&mut self, key: u64, desc: LocalDesc);

    fn is_registered(&self) -> bool;

    /// The remote-access key. Only meaningful after registration.
    fn key(&self) -> u64;

    /// The local-access descriptor, if the buffer has been registered.
    fn descriptor(&self) -> Option<LocalDesc>;
}

/// Exclusively owned buffer. Move-only; the default for single-owner data
/// paths.
pub struct UniqueBuf {
    data: Box<[u8]>,
    registered: bool,
    key: u64,
    desc: Option<LocalDesc>,
}

impl UniqueBuf {
    /// A buffer of [`MAX_MSG_SIZE`] bytes.
    pub fn new() -> UniqueBuf {
        UniqueBuf::with_size(MAX_MSG_SIZE)
    }

    pub fn with_size(size: usize) -> UniqueBuf {
        UniqueBuf {
            data: vec![0u8; size].into_boxed_slice(),
            registered: false,
            key: 0,
            desc: None,
        }
    }

    /// Copy the bytes of `s` plus a terminating zero to the front of the
    /// buffer.
    pub fn assign(&mut self, s: &str) {
        let bytes = s.as_bytes();
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.data[bytes.len()] = 0;
    }

    /// The whole buffer as a slice.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for UniqueBuf {
    fn default() -> UniqueBuf {
        UniqueBuf::new()
    }
}

impl FabricBuf for UniqueBuf {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn as_raw(&self) -> *const u8 {
        self.data.as_ptr()
    }

    fn as_raw_mut(&mut self) -> *mut u8 {
        self.data.as_mut_ptr()
    }

    fn copy_to(&mut self, input: &[u8], offset: usize) {
        self.data[offset..offset + input.len()].copy_from_slice(input);
    }

    fn copy_from(&self, output: &mut [u8], offset: usize) {
        output.copy_from_slice(&self.data[offset..offset + output.len()]);
    }

    fn register_callback(&mut self, key: u64, desc: LocalDesc) {
        self.registered = true;
        self.key = key;
        self.desc = Some(desc);
    }

    fn is_registered(&self) -> bool {
        self.registered
    }

    fn key(&self) -> u64 {
        assert!(self.registered, "key() on an unregistered buffer");
        self.key
    }

    fn descriptor(&self) -> Option<LocalDesc> {
        self.desc
    }
}

impl Index<usize> for UniqueBuf {
    type Output = u8;
    fn index(&self, idx: usize) -> &u8 {
        &self.data[idx]
    }
}

impl IndexMut<usize> for UniqueBuf {
    fn index_mut(&mut self, idx: usize) -> &mut u8 {
        &mut self.data[idx]
    }
}

/// Registration state and bytes of a [`SharedBuf`], kept together in one
/// reference-counted cell.
struct SharedCell {
    data: UnsafeCell<Box<[u8]>>,
    len: usize,
    registered: AtomicBool,
    key: AtomicU64,
    desc: AtomicU64,
}

// SAFETY: the bytes behind `data` are exclusive-access while involved in any
// posted operation (caller contract, see module docs); all other state is
// atomic.
unsafe impl Send for SharedCell {}
unsafe impl Sync for SharedCell {}

/// Reference-counted buffer. Clones share bytes and registration state; the
/// storage is released when the last clone drops.
pub struct SharedBuf {
    cell: Arc<SharedCell>,
}

impl SharedBuf {
    pub fn new() -> SharedBuf {
        SharedBuf::with_size(MAX_MSG_SIZE)
    }

    pub fn with_size(size: usize) -> SharedBuf {
        SharedBuf {
            cell: Arc::new(SharedCell {
                data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
                len: size,
                registered: AtomicBool::new(false),
                key: AtomicU64::new(0),
                desc: AtomicU64::new(0),
            }),
        }
    }

    /// Copy the bytes of `s` plus a terminating zero to the front of the
    /// buffer.
    pub fn assign(&mut self, s: &str) {
        let bytes = s.as_bytes();
        self.copy_to(bytes, 0);
        self.copy_to(&[0], bytes.len());
    }

    pub fn byte(&self, idx: usize) -> u8 {
        assert!(idx < self.cell.len);
        // SAFETY: in-bounds read; exclusivity of concurrent writers is the
        // caller contract described in the module docs.
        unsafe { (*self.cell.data.get())[idx] }
    }

    pub fn set_byte(&mut self, idx: usize, value: u8) {
        assert!(idx < self.cell.len);
        self.slice_mut()[idx] = value;
    }

    fn slice_mut(&self) -> &mut [u8] {
        // SAFETY: see the Send/Sync justification on SharedCell.
        unsafe { &mut *self.cell.data.get() }
    }
}

impl Default for SharedBuf {
    fn default() -> SharedBuf {
        SharedBuf::new()
    }
}

impl Clone for SharedBuf {
    fn clone(&self) -> SharedBuf {
        SharedBuf {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl FabricBuf for SharedBuf {
    fn size(&self) -> usize {
        self.cell.len
    }

    fn as_raw(&self) -> *const u8 {
        // SAFETY: see the Send/Sync justification on SharedCell.
        unsafe { (*self.cell.data.get()).as_ptr() }
    }

    fn as_raw_mut(&mut self) -> *mut u8 {
        // SAFETY: see the Send/Sync justification on SharedCell.
        unsafe { (*self.cell.data.get()).as_mut_ptr() }
    }

    fn copy_to(&mut self, input: &[u8], offset: usize) {
        self.slice_mut()[offset..offset + input.len()].copy_from_slice(input);
    }

    fn copy_from(&self, output: &mut [u8], offset: usize) {
        let len = output.len();
        output.copy_from_slice(&self.slice_mut()[offset..offset + len]);
    }

    fn register_callback(&mut self, key: u64, desc: LocalDesc) {
        self.cell.key.store(key, Ordering::Relaxed);
        self.cell.desc.store(desc.0, Ordering::Relaxed);
        self.cell.registered.store(true, Ordering::Release);
    }

    fn is_registered(&self) -> bool {
        self.cell.registered.load(Ordering::Acquire)
    }

    fn key(&self) -> u64 {
        assert!(self.is_registered(), "key() on an unregistered buffer");
        self.cell.key.load(Ordering::Relaxed)
    }

    fn descriptor(&self) -> Option<LocalDesc> {
        if self.is_registered() {
            Some(LocalDesc(self.cell.desc.load(Ordering::Relaxed)))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_copy_round_trip() {
        let mut buf = UniqueBuf::new();
        assert_eq!(buf.size(), MAX_MSG_SIZE);

        buf.copy_to(b"potato", 10);
        let mut out = [0u8; 6];
        buf.copy_from(&mut out, 10);
        assert_eq!(&out, b"potato");
        assert_eq!(buf[10], b'p');
    }

    #[test]
    fn unique_assign_terminates() {
        let mut buf = UniqueBuf::new();
        buf.assign("ping");
        assert_eq!(&buf.bytes()[..5], b"ping\0");
    }

    #[test]
    fn unique_registration_state() {
        let mut buf = UniqueBuf::with_size(64);
        assert!(!buf.is_registered());
        assert_eq!(buf.descriptor(), None);

        buf.register_callback(7, LocalDesc(42));
        assert!(buf.is_registered());
        assert_eq!(buf.key(), 7);
        assert_eq!(buf.descriptor(), Some(LocalDesc(42)));
    }

    #[test]
    #[should_panic]
    fn unique_key_before_registration_panics() {
        let _ = UniqueBuf::new().key();
    }

    #[test]
    fn shared_clones_see_writes_and_registration() {
        let mut a = SharedBuf::with_size(128);
        let b = a.clone();

        a.assign("wow");
        let mut out = [0u8; 4];
        b.copy_from(&mut out, 0);
        assert_eq!(&out, b"wow\0");

        a.register_callback(3, LocalDesc(9));
        assert!(b.is_registered());
        assert_eq!(b.key(), 3);
        assert_eq!(b.byte(0), b'w');
    }
}
