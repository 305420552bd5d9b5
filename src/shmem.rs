// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! A minimal shared-memory cell: atomic load, store, and compare-and-swap
//! over a single value.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic access to one shared value.
pub trait SharedMemory<T> {
    fn load(&self) -> T;

    fn store(&self, value: T);

    /// Atomically replace the value with `desired` if it equals `expected`.
    /// Returns the value read, whether or not the swap happened.
    fn compare_and_swap(&self, expected: T, desired: T) -> T;
}

/// Process-local implementation backed by an atomic.
#[derive(Default)]
pub struct LocalSharedMemory {
    data: AtomicU64,
}

impl LocalSharedMemory {
    pub fn new(value: u64) -> LocalSharedMemory {
        LocalSharedMemory {
            data: AtomicU64::new(value),
        }
    }
}

impl SharedMemory<u64> for LocalSharedMemory {
    fn load(&self) -> u64 {
        self.data.load(Ordering::SeqCst)
    }

    fn store(&self, value: u64) {
        self.data.store(value, Ordering::SeqCst)
    }

    fn compare_and_swap(&self, expected: u64, desired: u64) -> u64 {
        match self
            .data
            .compare_exchange(expected, desired, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }
}
