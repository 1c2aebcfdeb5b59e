//! 16-bit identifier pool for clients and channels.
//!
//! Borrowing hands out the lowest previously returned id, falling back to the
//! next never-used value. Once every outstanding id has been returned the pool
//! resets, so a long-lived server with churn restarts numbering at 0 instead of
//! creeping towards the top of the id space.

use std::collections::BTreeSet;

use crate::error::{RelayError, Result};

#[derive(Debug)]
pub struct IdPool {
    label: &'static str,
    free: BTreeSet<u16>,
    // u32 so that 65535 can be handed out and exhaustion still detected.
    next: u32,
    borrowed: usize,
}

impl IdPool {
    /// `label` names the pool in exhaustion errors ("client", "channel").
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            free: BTreeSet::new(),
            next: 0,
            borrowed: 0,
        }
    }

    /// Take an id. Fails only when all 65536 ids are outstanding.
    pub fn borrow(&mut self) -> Result<u16> {
        if let Some(id) = self.free.pop_first() {
            self.borrowed += 1;
            return Ok(id);
        }

        let id = u16::try_from(self.next).map_err(|_| RelayError::IdsExhausted(self.label))?;
        self.next += 1;
        self.borrowed += 1;
        Ok(id)
    }

    /// Give an id back. Returning an id that is not outstanding is ignored.
    pub fn release(&mut self, id: u16) {
        if self.borrowed == 0 || u32::from(id) >= self.next || self.free.contains(&id) {
            tracing::warn!(pool = self.label, id, "release of id that is not outstanding");
            return;
        }

        self.borrowed -= 1;
        if self.borrowed == 0 {
            self.free.clear();
            self.next = 0;
        } else {
            self.free.insert(id);
        }
    }

    /// Number of ids currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.borrowed
    }
}
