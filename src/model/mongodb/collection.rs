use std::ops::Deref;

use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};
use rocket::{
    request::{self, FromRequest, Request},
    State,
};

use crate::model::{
    ballot::{Ballot, NewBallot},
    candidate_totals::{CandidateTotals, NewCandidateTotals},
    descriptor::{NewVoterDescriptor, VoterDescriptor},
    election::Election,
    register::{NewVoteRegister, VoteRegister},
    verification::{NewVerificationOutcome, VerificationOutcome},
    voter::VoterIdentity,
};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[rocket::async_trait]
impl<'r, T> FromRequest<'r> for Coll<T>
where
    T: MongoCollection,
{
    type Error = ();

    /// Get the database connection from the managed state and wrap it in a collection.
    ///
    /// Panics iff the [`Database`] is not managed by [`rocket::Rocket`].
    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let db = req.guard::<&State<Database>>().await.unwrap();
        request::Outcome::Success(Coll::from_db(db))
    }
}

// Voter collection (snapshots owned by the external identity subsystem).
const VOTERS: &str = "voters";
impl MongoCollection for VoterIdentity {
    const NAME: &'static str = VOTERS;
}

// Election collection (snapshots owned by the surrounding CRUD system).
const ELECTIONS: &str = "elections";
impl MongoCollection for Election {
    const NAME: &'static str = ELECTIONS;
}

// Reference descriptor collection.
const DESCRIPTORS: &str = "descriptors";
impl MongoCollection for VoterDescriptor {
    const NAME: &'static str = DESCRIPTORS;
}
impl MongoCollection for NewVoterDescriptor {
    const NAME: &'static str = DESCRIPTORS;
}

// Ballot collections.
const BALLOTS: &str = "ballots";
impl MongoCollection for Ballot {
    const NAME: &'static str = BALLOTS;
}
impl MongoCollection for NewBallot {
    const NAME: &'static str = BALLOTS;
}

// Vote register collection.
const VOTE_REGISTERS: &str = "vote_registers";
impl MongoCollection for VoteRegister {
    const NAME: &'static str = VOTE_REGISTERS;
}
impl MongoCollection for NewVoteRegister {
    const NAME: &'static str = VOTE_REGISTERS;
}

// Candidate totals collection.
const CANDIDATE_TOTALS: &str = "candidate_totals";
impl MongoCollection for CandidateTotals {
    const NAME: &'static str = CANDIDATE_TOTALS;
}
impl MongoCollection for NewCandidateTotals {
    const NAME: &'static str = CANDIDATE_TOTALS;
}

// Verification outcome (audit) collection.
const VERIFICATION_OUTCOMES: &str = "verification_outcomes";
impl MongoCollection for VerificationOutcome {
    const NAME: &'static str = VERIFICATION_OUTCOMES;
}
impl MongoCollection for NewVerificationOutcome {
    const NAME: &'static str = VERIFICATION_OUTCOMES;
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // One reference descriptor per voter.
    let descriptor_index = IndexModel::builder()
        .keys(doc! {"voter_id": 1})
        .options(unique.clone())
        .build();
    Coll::<VoterDescriptor>::from_db(db)
        .create_index(descriptor_index, None)
        .await?;

    // One selection per candidate per voter per position.
    let ballot_index = IndexModel::builder()
        .keys(doc! {"voter_id": 1, "election_id": 1, "position_id": 1, "candidate_id": 1})
        .options(unique.clone())
        .build();
    Coll::<Ballot>::from_db(db)
        .create_index(ballot_index, None)
        .await?;

    // One register document per (voter, election, position); this is the
    // serialisation point for concurrent commits.
    let register_index = IndexModel::builder()
        .keys(doc! {"voter_id": 1, "election_id": 1, "position_id": 1})
        .options(unique.clone())
        .build();
    Coll::<VoteRegister>::from_db(db)
        .create_index(register_index, None)
        .await?;

    // One tally document per candidate.
    let totals_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "position_id": 1, "candidate_id": 1})
        .options(unique)
        .build();
    Coll::<CandidateTotals>::from_db(db)
        .create_index(totals_index, None)
        .await?;

    // Verification outcomes are audit records; let the database expire them.
    let outcome_options = IndexOptions::builder()
        .expire_after(std::time::Duration::from_secs(0))
        .build();
    let outcome_index = IndexModel::builder()
        .keys(doc! {"expire_at": 1})
        .options(outcome_options)
        .build();
    Coll::<VerificationOutcome>::from_db(db)
        .create_index(outcome_index, None)
        .await?;

    Ok(())
}
