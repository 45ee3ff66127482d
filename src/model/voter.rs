use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// A voter identity snapshot.
///
/// These records are owned by the external identity subsystem; the voting
/// core only ever reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterIdentity {
    /// Unique ID, stable for the lifetime of the voter.
    #[serde(rename = "_id")]
    pub id: Id,
    /// The voter's department.
    pub department: String,
    /// Whether the voter is eligible to vote at all.
    pub eligible: bool,
}
