//! Round-robin scheduler over registered agency connections.

use std::net::SocketAddr;

use crate::protocol::{AgencyId, Document};
use crate::server::WinnersMap;
use crate::utils::TallyError;

/// Maximum number of agencies that can be registered at once, bounded by the
/// single-byte agency ID on the wire.
pub const MAX_AGENCIES: usize = u8::MAX as usize;

/// One registered agency connection.
#[derive(Debug)]
pub struct Agency<Conn> {
    /// Connection exclusively owned while the agency is registered.
    pub conn: Conn,

    /// Peer address, for logging.
    pub peer: SocketAddr,

    /// Agency ID, unset until its first batch arrives.
    pub id: Option<AgencyId>,

    /// Set once the agency's final batch has been ingested.
    pub complete: bool,

    /// Winning documents; only populated during distribution.
    pub winners: Vec<Document>,
}

impl<Conn> Agency<Conn> {
    fn new(conn: Conn, peer: SocketAddr) -> Self {
        Agency {
            conn,
            peer,
            id: None,
            complete: false,
            winners: vec![],
        }
    }

    /// Short label for log lines.
    pub fn label(&self) -> String {
        match self.id {
            Some(id) => format!("agency {} ({})", id, self.peer),
            None => format!("agency ? ({})", self.peer),
        }
    }
}

/// Ordered arena of agencies plus a rotation cursor. The cursor stays within
/// `[0, len)` whenever the arena is non-empty.
#[derive(Debug)]
pub struct Scheduler<Conn> {
    agencies: Vec<Agency<Conn>>,
    cursor: usize,
}

impl<Conn> Default for Scheduler<Conn> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Conn> Scheduler<Conn> {
    pub fn new() -> Self {
        Scheduler {
            agencies: Vec::new(),
            cursor: 0,
        }
    }

    /// Number of registered agencies.
    pub fn len(&self) -> usize {
        self.agencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agencies.is_empty()
    }

    /// Registers a new incomplete agency and points the cursor at it, so it
    /// is the next one returned by `get_next_agency()`. Returns its index.
    pub fn add_agency(
        &mut self,
        conn: Conn,
        peer: SocketAddr,
    ) -> Result<usize, TallyError> {
        if self.agencies.len() >= MAX_AGENCIES {
            return logged_err!(
                "cannot register {}: already {} agencies",
                peer,
                MAX_AGENCIES
            );
        }
        self.agencies.push(Agency::new(conn, peer));
        self.cursor = self.agencies.len() - 1;
        Ok(self.cursor)
    }

    /// Scans forward from the cursor (wrapping) for an incomplete agency.
    /// Returns its index and leaves the cursor right past it, or `None` if a
    /// full cycle found nothing pending.
    pub fn get_next_agency(&mut self) -> Option<usize> {
        let len = self.agencies.len();
        for _ in 0..len {
            let idx = self.cursor;
            self.cursor = (self.cursor + 1) % len;
            if !self.agencies[idx].complete {
                return Some(idx);
            }
        }
        None
    }

    /// Mutable access to the agency at `idx`.
    pub fn agency_mut(&mut self, idx: usize) -> Option<&mut Agency<Conn>> {
        self.agencies.get_mut(idx)
    }

    /// Removes the most recently added agency.
    pub fn pop_agency(&mut self) -> Option<Agency<Conn>> {
        let agency = self.agencies.pop()?;
        if self.cursor >= self.agencies.len() {
            self.cursor = 0;
        }
        Some(agency)
    }

    /// De-registers the agency at `idx`. Agencies after it shift down by one
    /// and the cursor follows them, so rotation order is kept.
    pub fn remove_agency(&mut self, idx: usize) -> Option<Agency<Conn>> {
        if idx >= self.agencies.len() {
            return None;
        }
        let agency = self.agencies.remove(idx);
        if idx < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.agencies.len() {
            self.cursor = 0;
        }
        Some(agency)
    }

    /// IDs already assigned to agencies other than the one at `except_idx`.
    pub fn claimed_ids(&self, except_idx: usize) -> Vec<AgencyId> {
        self.agencies
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != except_idx)
            .filter_map(|(_, agency)| agency.id)
            .collect()
    }

    /// Whether every registered agency has its final batch stored. Vacuously
    /// true with no agencies.
    pub fn all_bets_stored(&self) -> bool {
        self.agencies.iter().all(|agency| agency.complete)
    }

    /// Hands each agency its entry of the winners mapping. Agencies with no
    /// entry get an empty list.
    pub fn assign_winners(&mut self, mut winners: WinnersMap) {
        for agency in self.agencies.iter_mut() {
            agency.winners = agency
                .id
                .and_then(|id| winners.remove(&id))
                .unwrap_or_default();
        }
        for (id, docs) in winners {
            pf_warn!(
                "{} winners of agency {} have no registered connection",
                docs.len(),
                id
            );
        }
    }

    /// Removes every agency at once, for teardown.
    pub fn drain(&mut self) -> Vec<Agency<Conn>> {
        self.cursor = 0;
        std::mem::take(&mut self.agencies)
    }
}
