use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::model::{
    election::{CandidateId, PositionId},
    mongodb::Id,
};

/// Core candidate tally data, as stored in the database.
///
/// Tallies are derived from committed ballots and are never authoritative;
/// the ledger keeps them in step with the ballot collection by updating both
/// inside the same transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTotalsCore {
    pub election_id: Id,
    pub position_id: PositionId,
    pub candidate_id: CandidateId,
    /// Number of committed ballots for this candidate.
    pub tally: u64,
}

/// New totals ready for DB insertion are just `CandidateTotalsCore`.
pub type NewCandidateTotals = CandidateTotalsCore;

/// Candidate totals from the database, with their unique ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateTotals {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub totals: CandidateTotalsCore,
}

impl Deref for CandidateTotals {
    type Target = CandidateTotalsCore;

    fn deref(&self) -> &Self::Target {
        &self.totals
    }
}
