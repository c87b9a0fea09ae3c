//! Fastwalk tickets: issuance, buffering and validation
//!
//! Each session holds a small FIFO of outstanding single-use tickets. A walk
//! command must present the oldest one. A replacement ticket is owed for every
//! consumed ticket and is issued once the step that consumed it completes, so
//! a client can never hold more than `capacity` steps of authority at once.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::VecDeque;

use super::types::RejectReason;

/// A single-use admission token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub id: u32,
    pub issued_at: u64,
    pub consumed: bool,
}

/// Outstanding tickets for one session, oldest first
#[derive(Debug)]
pub struct TicketBuffer {
    tickets: VecDeque<Ticket>,
    capacity: usize,
}

impl TicketBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            tickets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest unconsumed ticket
    pub fn front(&self) -> Option<&Ticket> {
        self.tickets.front()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.tickets.iter().any(|t| t.id == id)
    }

    /// Outstanding ticket ids in issuance order
    pub fn ids(&self) -> Vec<u32> {
        self.tickets.iter().map(|t| t.id).collect()
    }

    fn push(&mut self, ticket: Ticket) -> bool {
        if self.is_full() {
            return false;
        }
        self.tickets.push_back(ticket);
        true
    }

    fn pop_front(&mut self) -> Option<Ticket> {
        self.tickets.pop_front()
    }

    fn clear(&mut self) {
        self.tickets.clear();
    }
}

/// Feistel rounds in the id permutation
const ROUNDS: usize = 4;

/// Creates tickets for one session.
///
/// Ids are a keyed permutation of a per-session counter. Distinct counter
/// values always map to distinct ids, so no id repeats within 2^32 issues
/// and nothing has to be remembered to guarantee it. The round keys and the
/// counter's starting point come from a per-session CSPRNG.
pub struct TicketIssuer {
    keys: [u32; ROUNDS],
    counter: u32,
    /// Consumed tickets whose replacement has not been issued yet
    owed: usize,
}

impl TicketIssuer {
    pub fn new() -> Self {
        Self::with_rng(ChaCha20Rng::from_entropy())
    }

    pub fn with_rng(mut rng: ChaCha20Rng) -> Self {
        Self {
            keys: rng.gen(),
            counter: rng.gen(),
            owed: 0,
        }
    }

    /// Fill an empty buffer at world entry. Returns the new ids.
    pub fn issue_initial_batch(&mut self, buffer: &mut TicketBuffer, now: u64) -> Vec<u32> {
        buffer.clear();
        self.owed = 0;

        let mut ids = Vec::with_capacity(buffer.capacity());
        while !buffer.is_full() {
            let ticket = self.mint(now);
            buffer.push(ticket);
            ids.push(ticket.id);
        }
        ids
    }

    /// Record that `ticket` was spent; its replacement becomes owed.
    pub fn on_consumed(&mut self, ticket: &Ticket) {
        debug_assert!(ticket.consumed);
        self.owed += 1;
    }

    /// Issue one owed replacement once the consuming step has completed.
    pub fn replenish(&mut self, buffer: &mut TicketBuffer, now: u64) -> Option<u32> {
        if self.owed == 0 || buffer.is_full() {
            return None;
        }
        self.owed -= 1;
        let ticket = self.mint(now);
        buffer.push(ticket);
        Some(ticket.id)
    }

    pub fn owed(&self) -> usize {
        self.owed
    }

    fn mint(&mut self, now: u64) -> Ticket {
        loop {
            let id = permute(self.counter, &self.keys);
            self.counter = self.counter.wrapping_add(1);
            // Zero is reserved as "no ticket" on the wire
            if id != 0 {
                return Ticket {
                    id,
                    issued_at: now,
                    consumed: false,
                };
            }
        }
    }
}

/// Balanced Feistel network over the two 16-bit halves of `value`.
/// Each round is invertible whatever the round function, so this is a
/// bijection on `u32` for any key schedule.
fn permute(value: u32, keys: &[u32; ROUNDS]) -> u32 {
    let mut left = (value >> 16) as u16;
    let mut right = value as u16;
    for key in keys {
        let mixed = left ^ round(right, *key);
        left = right;
        right = mixed;
    }
    (u32::from(left) << 16) | u32::from(right)
}

fn round(half: u16, key: u32) -> u16 {
    let mut x = u32::from(half) ^ key;
    x = (x ^ (x >> 16)).wrapping_mul(0x7feb_352d);
    x = (x ^ (x >> 15)).wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x as u16
}

impl Default for TicketIssuer {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks a submitted ticket against the session's buffer
pub struct TicketValidator;

impl TicketValidator {
    /// Consume the oldest ticket if `submitted` names it.
    ///
    /// Rejections leave the buffer untouched, so resubmitting the same ticket
    /// yields the same reason.
    pub fn validate(
        buffer: &mut TicketBuffer,
        issuer: &mut TicketIssuer,
        submitted: Option<u32>,
    ) -> Result<Ticket, RejectReason> {
        let oldest = buffer.front().ok_or(RejectReason::NoTicketsAvailable)?;

        let id = submitted.ok_or(RejectReason::UnknownTicket)?;
        if oldest.id != id {
            return Err(if buffer.contains(id) {
                RejectReason::OutOfOrderTicket
            } else {
                RejectReason::UnknownTicket
            });
        }

        let mut ticket = buffer.pop_front().ok_or(RejectReason::NoTicketsAvailable)?;
        ticket.consumed = true;
        issuer.on_consumed(&ticket);
        Ok(ticket)
    }
}
