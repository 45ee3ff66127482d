use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mongodb::bson::{serde_helpers::chrono_datetime_as_bson_datetime, to_bson, Bson};
use serde::{Deserialize, Serialize};

use crate::model::mongodb::{serde_string_map, Id};

/// Unique identifier of a position within its election.
pub type PositionId = u32;

/// Candidates are identified by name within their position.
pub type CandidateId = String;

/// States in the election lifecycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionState {
    /// Scheduled but not yet open for voting.
    Upcoming,
    /// Open for voting (within the start/end window).
    Active,
    /// Closed; no further votes are accepted.
    Completed,
}

impl From<ElectionState> for Bson {
    fn from(state: ElectionState) -> Self {
        to_bson(&state).expect("Serialisation is infallible")
    }
}

/// An election snapshot, as stored in the database.
///
/// Owned by the surrounding CRUD system; the voting core only ever reads
/// these records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Election {
    /// Unique ID.
    #[serde(rename = "_id")]
    pub id: Id,
    /// Election name.
    pub name: String,
    /// Lifecycle state.
    pub state: ElectionState,
    /// Whether voters must pass face verification before casting.
    pub require_face_verification: bool,
    /// Voting window start.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub start_time: DateTime<Utc>,
    /// Voting window end.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub end_time: DateTime<Utc>,
    /// Contested positions by ID.
    #[serde(with = "serde_string_map")]
    pub positions: HashMap<PositionId, Position>,
}

impl Election {
    /// Look up a position by ID.
    pub fn position(&self, position_id: PositionId) -> Option<&Position> {
        self.positions.get(&position_id)
    }

    /// Is this election currently accepting votes?
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.state == ElectionState::Active && self.start_time <= now && now <= self.end_time
    }
}

/// A single contested position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Unique ID within the election.
    pub id: PositionId,
    /// Position name.
    pub name: String,
    /// Selections allowed per voter for this position.
    pub max_votes: u32,
    /// Candidates standing for this position.
    pub candidates: Vec<CandidateId>,
}

impl Position {
    /// Does the given candidate stand for this position?
    pub fn has_candidate(&self, candidate_id: &str) -> bool {
        self.candidates.iter().any(|c| c == candidate_id)
    }
}


#[cfg(test)]
pub use examples::{COMMITTEE, PRESIDENT};
