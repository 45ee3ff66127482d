use std::ops::Deref;

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{
    election::{CandidateId, PositionId},
    mongodb::Id,
};

/// A vote that the voter wishes to cast: a specific candidate for a
/// specific position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotSpec {
    pub position: PositionId,
    pub candidate: CandidateId,
}

/// Core ballot data, as stored in the database.
///
/// A committed ballot is immutable: it is never updated or deleted by
/// voters, only purged wholesale with its election by an administrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotCore {
    /// The voter who cast this ballot.
    pub voter_id: Id,
    /// Election foreign key.
    pub election_id: Id,
    /// Position foreign key.
    pub position_id: PositionId,
    /// The selected candidate.
    pub candidate_id: CandidateId,
    /// Whether the voter passed face verification for this ballot.
    pub face_verified: bool,
    /// When the ballot was cast.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub cast_at: DateTime<Utc>,
}

impl BallotCore {
    pub fn new(
        voter_id: Id,
        election_id: Id,
        position_id: PositionId,
        candidate_id: CandidateId,
        face_verified: bool,
    ) -> Self {
        Self {
            voter_id,
            election_id,
            position_id,
            candidate_id,
            face_verified,
            cast_at: Utc::now(),
        }
    }
}

/// A ballot ready for DB insertion is just `BallotCore` without an ID.
pub type NewBallot = BallotCore;

/// A ballot from the database, with its unique ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub ballot: BallotCore,
}

impl Deref for Ballot {
    type Target = BallotCore;

    fn deref(&self) -> &Self::Target {
        &self.ballot
    }
}
