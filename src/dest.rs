//! Destination allocator: a deterministic, collision-free stream of
//! loopback addresses for RTT probes.
//!
//! Each admitted circuit gets its own `127.a.b.c` address so that a
//! refused CONNECT can never be confused with one belonging to another
//! in-flight probe. Addresses are handed out by decrementing a shared
//! counter and decomposing it in base 256; `127.0.0.0` is a legitimate
//! (if unlikely) output once the counter runs low.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Hands out unique `127.a.b.c` addresses by counting down from an
/// initial budget.
pub struct DestAllocator {
    remaining: AtomicU32,
}

impl DestAllocator {
    /// Create an allocator with room for up to `remaining` addresses
    /// (each in `0..=0x00FF_FFFF`, so `remaining` should not exceed
    /// `16_777_216`).
    pub fn new(remaining: u32) -> Self {
        Self {
            remaining: AtomicU32::new(remaining),
        }
    }

    /// Allocate the next address, or `None` once the budget is
    /// exhausted.
    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let mut current = self.remaining.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return None;
            }
            let next = current - 1;
            match self.remaining.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(decompose(next)),
                Err(observed) => current = observed,
            }
        }
    }
}

/// Decompose `n` (treated modulo `2^24`) into a `127.a.b.c` address by
/// base-256 digit extraction, most-significant byte first.
fn decompose(n: u32) -> Ipv4Addr {
    let n = n & 0x00FF_FFFF;
    let a = (n >> 16) & 0xFF;
    let b = (n >> 8) & 0xFF;
    let c = n & 0xFF;
    Ipv4Addr::new(127, a as u8, b as u8, c as u8)
}
