use std::ops::Deref;

use serde::{Deserialize, Serialize};

use crate::model::{
    election::{CandidateId, PositionId},
    mongodb::Id,
};

/// Core vote-register data: one document per `(voter, election, position)`,
/// listing the candidates the voter has selected for that position.
///
/// A unique index on the triple makes this document the serialisation point
/// for concurrent commits of the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRegisterCore {
    pub voter_id: Id,
    pub election_id: Id,
    pub position_id: PositionId,
    /// Candidates selected so far, in commit order.
    pub candidates: Vec<CandidateId>,
}

impl VoteRegisterCore {
    /// A fresh register containing a single selection.
    pub fn new(
        voter_id: Id,
        election_id: Id,
        position_id: PositionId,
        candidate_id: CandidateId,
    ) -> Self {
        Self {
            voter_id,
            election_id,
            position_id,
            candidates: vec![candidate_id],
        }
    }

    /// Has the voter already selected this candidate?
    pub fn has_selected(&self, candidate_id: &str) -> bool {
        self.candidates.iter().any(|c| c == candidate_id)
    }

    /// How many selections the voter has made for this position.
    pub fn selection_count(&self) -> u32 {
        self.candidates.len() as u32
    }
}

/// A register ready for DB insertion is just one without an ID.
pub type NewVoteRegister = VoteRegisterCore;

/// A vote register from the database, with its unique ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRegister {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub register: VoteRegisterCore,
}

impl Deref for VoteRegister {
    type Target = VoteRegisterCore;

    fn deref(&self) -> &Self::Target {
        &self.register
    }
}
