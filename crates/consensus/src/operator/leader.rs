//! Leader rotation

use super::Operator;
use crate::error::ConsensusError;
use std::time::Instant;

impl Operator {
    /// Current candidate leader, and whether a state is known at all
    pub fn current_leader(&self) -> (u16, bool) {
        (self.peer_permutation.current(), self.current_state.is_some())
    }

    pub fn is_self_leader(&self) -> bool {
        let (leader, known) = self.current_leader();
        known && leader == self.committee.own_index()
    }

    /// Skip to the next alive candidate and re-arm the rotation deadline
    pub fn advance_leader(&mut self) -> Result<u16, ConsensusError> {
        self.peer_permutation.next();
        self.leader_status = None;
        let leader = self.move_to_first_alive_leader()?;
        self.set_leader_rotation_deadline();
        Ok(leader)
    }

    /// Reshuffle candidates from the seed, clear the round and disarm the deadline
    pub fn reset_leader(&mut self, seed: &[u8]) -> Result<u16, ConsensusError> {
        self.peer_permutation.shuffle(seed);
        self.leader_status = None;
        let leader = self.move_to_first_alive_leader()?;
        self.leader_rotation_deadline = None;
        Ok(leader)
    }

    // self is always alive, so one full cycle must find a candidate
    fn move_to_first_alive_leader(&mut self) -> Result<u16, ConsensusError> {
        for _ in 0..self.peer_permutation.len() {
            let candidate = self.peer_permutation.current();
            if self.committee.is_alive(candidate) {
                return Ok(candidate);
            }
            tracing::debug!("Peer #{} is dead, skipping", candidate);
            self.peer_permutation.next();
        }
        Err(ConsensusError::invariant(format!(
            "no alive leader candidate among {} peers",
            self.peer_permutation.len()
        )))
    }

    /// Armed only while some request is ready to be processed
    pub(crate) fn set_leader_rotation_deadline(&mut self) {
        self.leader_rotation_deadline = if !self.has_ready_requests() {
            None
        } else {
            Some(Instant::now() + self.config.leader_rotation_period)
        };
    }
}
