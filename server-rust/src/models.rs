use ledgerfl_protocol::{MetricRecord, Metrics, RoundStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// In-process round state. Only [`crate::coordinator::Coordinator`] mutates
/// it, always behind its mutex.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoundState {
    pub training_active: bool,
    /// Set when the target round was aggregated
    #[serde(default)]
    pub finished: bool,
    pub current_round: u64,
    pub target_round: u64,
    pub expected_participants: usize,
    pub received_this_round: usize,
    /// Rounds whose aggregation has been claimed. Never shrinks.
    #[serde(default)]
    pub aggregated_rounds: BTreeSet<u64>,
    #[serde(default)]
    pub metrics: Vec<MetricRecord>,
}

impl RoundState {
    /// Idle -> Active(start)
    pub fn activate(&mut self, start_round: u64, rounds: u64, participants: usize) {
        self.training_active = true;
        self.finished = false;
        self.current_round = start_round;
        self.target_round = start_round + rounds - 1;
        self.expected_participants = participants;
        self.received_this_round = 0;
    }

    /// Any state -> Idle
    pub fn deactivate(&mut self) {
        self.training_active = false;
    }

    /// Aggregating(target) -> Idle(Finished)
    pub fn finish(&mut self) {
        self.training_active = false;
        self.finished = true;
    }

    /// Aggregating(r) -> Active(next)
    pub fn advance_to(&mut self, next_round: u64) {
        self.current_round = next_round;
        self.received_this_round = 0;
    }

    /// Records an upload for the current round. A re-upload replaces the
    /// metrics but keeps the verified flag. Returns true for a first upload.
    pub fn record_upload(&mut self, participant: &str, reported_accuracy: f64, scored: Metrics) -> bool {
        let round = self.current_round;
        let fresh = MetricRecord::contribution(round, participant, reported_accuracy, scored);
        match self.contribution_mut(round, participant) {
            Some(existing) => {
                let (verified, paid) = (existing.verified, existing.paid);
                *existing = MetricRecord { verified, paid, ..fresh };
                false
            }
            None => {
                self.metrics.push(fresh);
                self.received_this_round += 1;
                true
            }
        }
    }

    /// Flags an unverified contribution as verified (and paid: the bot only
    /// notifies once the ledger payment went out). False when there is
    /// nothing to flag.
    pub fn mark_verified(&mut self, round: u64, participant: &str) -> bool {
        match self.contribution_mut(round, participant) {
            Some(c) if !c.verified => {
                c.verified = true;
                c.paid = true;
                true
            }
            _ => false,
        }
    }

    pub fn verified_participants(&self, round: u64) -> Vec<String> {
        self.metrics
            .iter()
            .filter(|m| m.round == round && !m.is_global() && m.verified)
            .map(|m| m.participant.clone())
            .collect()
    }

    pub fn verified_count(&self, round: u64) -> usize {
        self.metrics
            .iter()
            .filter(|m| m.round == round && !m.is_global() && m.verified)
            .count()
    }

    pub fn is_aggregated(&self, round: u64) -> bool {
        self.aggregated_rounds.contains(&round)
    }

    pub fn has_quorum(&self) -> bool {
        self.verified_count(self.current_round) >= self.expected_participants
    }

    pub fn snapshot(&self) -> RoundStatus {
        RoundStatus {
            training_active: self.training_active,
            finished: self.finished,
            current_round: self.current_round,
            target_round: self.target_round,
            expected_participants: self.expected_participants,
            received_this_round: self.received_this_round,
            verified_this_round: self.verified_count(self.current_round),
            aggregated_rounds: self.aggregated_rounds.iter().copied().collect(),
        }
    }

    fn contribution_mut(&mut self, round: u64, participant: &str) -> Option<&mut MetricRecord> {
        self.metrics
            .iter_mut()
            .find(|m| m.round == round && m.participant == participant && !m.is_global())
    }
}
