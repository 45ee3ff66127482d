use mongodb::bson::doc;

use crate::error::{Error, Result};
use crate::model::{
    auth::VoterToken,
    election::Election,
    mongodb::{Coll, Id},
    voter::VoterIdentity,
};

/// Look up the voter identity snapshot behind a token.
pub async fn voter_by_token(
    token: &VoterToken,
    voters: &Coll<VoterIdentity>,
) -> Result<VoterIdentity> {
    voters
        .find_one(token.voter_id.as_doc(), None)
        .await?
        .ok_or_else(|| Error::not_found(format!("Voter {}", token.voter_id)))
}

/// Look up an election snapshot by ID.
pub async fn election_by_id(election_id: Id, elections: &Coll<Election>) -> Result<Election> {
    elections
        .find_one(election_id.as_doc(), None)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election {}", election_id)))
}
