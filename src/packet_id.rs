//! Packet identifier allocation
//!
//! Identifiers are handed out round-robin over 1..=65535. An identifier stays
//! reserved until the operation using it finishes and it is released, so an
//! id is never reused while its handshake is outstanding.

use crate::error::{MqttError, Result};
use std::collections::HashSet;

/// Round-robin allocator of packet identifiers
#[derive(Debug)]
pub struct PacketIdAllocator {
    next_id: u16,
    in_use: HashSet<u16>,
}

impl PacketIdAllocator {
    /// Creates an allocator starting at 1
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: HashSet::new(),
        }
    }

    /// Reserves and returns the next free identifier
    ///
    /// # Errors
    ///
    /// Returns `IdentifiersExhausted` when all 65535 identifiers are reserved
    pub fn next(&mut self) -> Result<u16> {
        if self.in_use.len() >= usize::from(u16::MAX) {
            return Err(MqttError::IdentifiersExhausted);
        }
        loop {
            let candidate = self.next_id;
            self.next_id = if candidate == u16::MAX { 1 } else { candidate + 1 };
            if self.in_use.insert(candidate) {
                return Ok(candidate);
            }
        }
    }

    /// Marks an identifier restored from persistence as taken
    pub fn reserve(&mut self, id: u16) {
        if id != 0 {
            self.in_use.insert(id);
        }
    }

    /// Returns true if the identifier was reserved
    pub fn release(&mut self, id: u16) -> bool {
        self.in_use.remove(&id)
    }

    /// Checks whether `id` is reserved
    #[must_use]
    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    /// Number of reserved identifiers
    #[must_use]
    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    /// Releases every identifier
    pub fn clear(&mut self) {
        self.in_use.clear();
    }
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
