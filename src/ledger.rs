//! The vote ledger: records each ballot exactly once and keeps the derived
//! tallies in step, under concurrent writers.
//!
//! Every commit runs as a multi-document transaction over three writes:
//!
//! 1. a guarded claim on the voter's [`VoteRegister`] for the position
//!    (a single atomic document update, or a first-time insert racing on
//!    the unique index);
//! 2. the immutable ballot insert, with its own unique index as backstop;
//! 3. an upserted increment of the candidate's tally.
//!
//! The register's unique index on `(voter_id, election_id, position_id)`
//! is the sole serialisation point: concurrent commits for the same key
//! are strictly ordered there, commits for different keys are fully
//! concurrent. Duplicate-key violations surface as [`CommitError::DuplicateVote`];
//! transient transaction errors are retried with bounded backoff and are
//! never assumed committed.

use mongodb::{
    bson::doc,
    error::{Error as DbError, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    options::{FindOneAndUpdateOptions, ReturnDocument},
    Client, ClientSession, Database,
};
use rocket::{
    request::{self, FromRequest, Request},
    tokio::time::{sleep, Duration},
    State,
};
use thiserror::Error;

use crate::events::{VoteCommitted, VoteNotifier};
use crate::model::{
    ballot::{Ballot, NewBallot},
    candidate_totals::CandidateTotals,
    mongodb::{is_duplicate_key_error, Coll},
    register::{NewVoteRegister, VoteRegister},
};

/// Transaction attempts before giving up on transient errors.
const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// Base backoff between transaction retries.
const RETRY_BACKOFF_MS: u64 = 20;

/// Errors from [`VoteLedger::commit`].
#[derive(Debug, Error)]
pub enum CommitError {
    /// The ledger already holds a conflicting ballot for this
    /// `(voter, election, position)` key. Terminal; never retried.
    #[error("Voter has already voted for this position")]
    DuplicateVote,
    /// Storage fault. The caller may retry with backoff and must not
    /// assume the ballot was committed.
    #[error(transparent)]
    Unavailable(#[from] DbError),
}

/// The transactional vote-recording core. Constructed per request.
pub struct VoteLedger<'r> {
    client: Client,
    ballots: Coll<NewBallot>,
    registers: Coll<VoteRegister>,
    new_registers: Coll<NewVoteRegister>,
    totals: Coll<CandidateTotals>,
    notifier: &'r VoteNotifier,
}

impl<'r> VoteLedger<'r> {
    pub fn new(client: Client, db: &Database, notifier: &'r VoteNotifier) -> Self {
        Self {
            client,
            ballots: Coll::from_db(db),
            registers: Coll::from_db(db),
            new_registers: Coll::from_db(db),
            totals: Coll::from_db(db),
            notifier,
        }
    }

    /// Commit a ballot exactly once.
    ///
    /// Atomic and linearizable per `(voter, election, position)` key: of
    /// two concurrent commits for the same key, exactly one succeeds and
    /// the other observes [`CommitError::DuplicateVote`]. On success the
    /// candidate's tally has been incremented in the same transaction and
    /// a [`VoteCommitted`] event has been published (fire-and-forget).
    ///
    /// Not cancel-safe once the register claim has been submitted; callers
    /// must await the result.
    pub async fn commit(&self, ballot: NewBallot, max_votes: u32) -> Result<Ballot, CommitError> {
        let mut attempt = 1;
        loop {
            let mut session = self.client.start_session(None).await?;
            session.start_transaction(None).await?;

            let outcome = self.try_commit(&mut session, &ballot, max_votes).await;
            match outcome {
                Ok((committed, tally)) => match commit_with_retry(&mut session).await {
                    Ok(()) => {
                        info!(
                            "Committed ballot {} (voter {}, election {}, position {})",
                            committed.id,
                            committed.voter_id,
                            committed.election_id,
                            committed.position_id
                        );
                        self.notifier.publish(VoteCommitted {
                            election_id: committed.election_id,
                            position_id: committed.position_id,
                            candidate_id: committed.candidate_id.clone(),
                            tally,
                        });
                        return Ok(committed);
                    }
                    Err(err) if retryable(&err, attempt) => {
                        warn!("Ballot commit attempt {attempt} failed transiently: {err}");
                    }
                    Err(err) => return Err(err.into()),
                },
                Err(TryCommitError::Duplicate) => {
                    let _ = session.abort_transaction().await;
                    return Err(CommitError::DuplicateVote);
                }
                Err(TryCommitError::RegisterRace) => {
                    let _ = session.abort_transaction().await;
                    // A register for this key appeared underneath us. For a
                    // single-select position that settles it. For
                    // multi-select, a register that already rules this
                    // selection out is a duplicate, not a race; only a
                    // genuine race goes again through the update path.
                    if max_votes <= 1
                        || self.is_duplicate_selection(&ballot, max_votes).await?
                        || attempt >= MAX_COMMIT_ATTEMPTS
                    {
                        return Err(CommitError::DuplicateVote);
                    }
                }
                Err(TryCommitError::Db(err)) => {
                    let _ = session.abort_transaction().await;
                    if !retryable(&err, attempt) {
                        return Err(err.into());
                    }
                    warn!("Ballot commit attempt {attempt} failed transiently: {err}");
                }
            }

            sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt))).await;
            attempt += 1;
        }
    }

    /// After losing a register-creation race, check whether the existing
    /// register already rules this selection out (candidate present or
    /// budget full). Advisory read; the guarded update stays the
    /// authority on retry.
    async fn is_duplicate_selection(
        &self,
        ballot: &NewBallot,
        max_votes: u32,
    ) -> Result<bool, DbError> {
        let filter = doc! {
            "voter_id": *ballot.voter_id,
            "election_id": *ballot.election_id,
            "position_id": ballot.position_id,
        };
        Ok(self
            .registers
            .find_one(filter, None)
            .await?
            .map(|register| {
                register.has_selected(&ballot.candidate_id)
                    || register.selection_count() >= max_votes
            })
            .unwrap_or(false))
    }

    /// One transaction body: claim the register slot, insert the ballot,
    /// bump the tally. Runs inside the caller's transaction.
    async fn try_commit(
        &self,
        session: &mut ClientSession,
        ballot: &NewBallot,
        max_votes: u32,
    ) -> Result<(Ballot, u64), TryCommitError> {
        // Claim the selection slot with a single guarded update: the
        // candidate must be absent and the selection count below the
        // position's budget.
        let claim_filter = doc! {
            "voter_id": *ballot.voter_id,
            "election_id": *ballot.election_id,
            "position_id": ballot.position_id,
            "candidates": { "$ne": &ballot.candidate_id },
            "$expr": { "$lt": [{ "$size": "$candidates" }, i64::from(max_votes)] },
        };
        let claim_update = doc! {
            "$push": { "candidates": &ballot.candidate_id },
        };
        let claimed = self
            .registers
            .update_one_with_session(claim_filter, claim_update, None, session)
            .await?;

        if claimed.matched_count == 0 {
            // Either no register exists yet, or this selection is not
            // allowed. Let the unique index arbitrate.
            let register = NewVoteRegister::new(
                ballot.voter_id,
                ballot.election_id,
                ballot.position_id,
                ballot.candidate_id.clone(),
            );
            self.new_registers
                .insert_one_with_session(&register, None, session)
                .await
                .map_err(|err| {
                    if is_duplicate_key_error(&err) {
                        TryCommitError::RegisterRace
                    } else {
                        TryCommitError::Db(err)
                    }
                })?;
        }

        // The immutable ballot itself. Its unique index is a backstop; a
        // violation here means the register and ballots disagreed, which
        // the surrounding transaction resolves as a duplicate.
        let ballot_id = self
            .ballots
            .insert_one_with_session(ballot, None, session)
            .await
            .map_err(|err| {
                if is_duplicate_key_error(&err) {
                    TryCommitError::Duplicate
                } else {
                    TryCommitError::Db(err)
                }
            })?
            .inserted_id
            .as_object_id()
            .unwrap() // Valid because the ID comes directly from the DB.
            .into();

        // Bump the derived tally inside the same transaction so counter
        // and ballots never diverge.
        let totals_filter = doc! {
            "election_id": *ballot.election_id,
            "position_id": ballot.position_id,
            "candidate_id": &ballot.candidate_id,
        };
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();
        let totals = self
            .totals
            .find_one_and_update_with_session(
                totals_filter,
                doc! { "$inc": { "tally": 1 } },
                options,
                session,
            )
            .await?
            .expect("Upsert always returns the updated document");

        let committed = Ballot {
            id: ballot_id,
            ballot: ballot.clone(),
        };
        Ok((committed, totals.tally))
    }
}

#[derive(Debug)]
enum TryCommitError {
    /// This exact selection already exists.
    Duplicate,
    /// Lost a race to create the register for this key.
    RegisterRace,
    Db(DbError),
}

impl From<DbError> for TryCommitError {
    fn from(err: DbError) -> Self {
        Self::Db(err)
    }
}

/// Commit the transaction, retrying while the outcome is unknown.
async fn commit_with_retry(session: &mut ClientSession) -> Result<(), DbError> {
    loop {
        match session.commit_transaction().await {
            Ok(()) => return Ok(()),
            Err(err) if err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) => {
                warn!("Transaction commit outcome unknown, retrying: {err}");
            }
            Err(err) => return Err(err),
        }
    }
}

fn retryable(err: &DbError, attempt: u32) -> bool {
    attempt < MAX_COMMIT_ATTEMPTS && err.contains_label(TRANSIENT_TRANSACTION_ERROR)
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for VoteLedger<'r> {
    type Error = ();

    /// Assemble the ledger from managed state.
    ///
    /// Panics iff the [`Client`], [`Database`] or [`VoteNotifier`] are not
    /// managed by [`rocket::Rocket`].
    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        let client = req.guard::<&State<Client>>().await.unwrap();
        let db = req.guard::<&State<Database>>().await.unwrap();
        let notifier = req.guard::<&State<VoteNotifier>>().await.unwrap();
        request::Outcome::Success(VoteLedger::new(
            client.inner().clone(),
            db,
            notifier.inner(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mongodb::Database;

    use crate::model::{
        ballot::Ballot,
        election::{COMMITTEE, PRESIDENT},
        mongodb::Id,
    };

    async fn ledger<'a>(db: &Database, notifier: &'a VoteNotifier) -> VoteLedger<'a> {
        let client = crate::db_client().await;
        VoteLedger::new(client, db, notifier)
    }

    fn ballot(voter: Id, election: Id, position: u32, candidate: &str) -> NewBallot {
        NewBallot::new(voter, election, position, candidate.to_string(), true)
    }

    #[backend_test]
    async fn commit_is_exactly_once_per_key(db: Database) {
        // This test exercises the full transaction path, so enable logging.
        log4rs_test_utils::test_logging::init_logging_once_for(["univote_backend"], None, None);

        let notifier = VoteNotifier::new();
        let ledger = ledger(&db, &notifier).await;
        let (voter, election) = (Id::new(), Id::new());

        let committed = ledger
            .commit(ballot(voter, election, PRESIDENT, "Alice"), 1)
            .await
            .unwrap();
        assert_eq!(committed.candidate_id, "Alice");
        assert_eq!(committed.position_id, PRESIDENT);

        // The same selection again is a duplicate...
        let err = ledger
            .commit(ballot(voter, election, PRESIDENT, "Alice"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::DuplicateVote));

        // ...and so is any other candidate for a single-select position.
        let err = ledger
            .commit(ballot(voter, election, PRESIDENT, "Bob"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::DuplicateVote));

        // Exactly one ballot was recorded, and the tally agrees.
        let ballots = Coll::<Ballot>::from_db(&db);
        let count = ballots
            .count_documents(doc! {"voter_id": *voter}, None)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let totals = Coll::<CandidateTotals>::from_db(&db);
        let alice = totals
            .find_one(doc! {"election_id": *election, "candidate_id": "Alice"}, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alice.tally, 1);
        let bob = totals
            .find_one(doc! {"election_id": *election, "candidate_id": "Bob"}, None)
            .await
            .unwrap();
        assert!(bob.is_none());
    }

    #[backend_test]
    async fn concurrent_commits_for_same_key_exactly_one_wins(db: Database) {
        let notifier = VoteNotifier::new();
        let ledger = ledger(&db, &notifier).await;
        let (voter, election) = (Id::new(), Id::new());

        // Two concurrent commits for the same (voter, election, position)
        // with different candidates.
        let (a, b) = rocket::tokio::join!(
            ledger.commit(ballot(voter, election, PRESIDENT, "Alice"), 1),
            ledger.commit(ballot(voter, election, PRESIDENT, "Bob"), 1),
        );

        let outcomes = [&a, &b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(CommitError::DuplicateVote)))
                .count(),
            1
        );

        // Never two ballots, never zero.
        let ballots = Coll::<Ballot>::from_db(&db);
        let count = ballots
            .count_documents(doc! {"voter_id": *voter}, None)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[backend_test]
    async fn multi_select_allows_distinct_candidates_up_to_budget(db: Database) {
        let notifier = VoteNotifier::new();
        let ledger = ledger(&db, &notifier).await;
        let (voter, election) = (Id::new(), Id::new());

        ledger
            .commit(ballot(voter, election, COMMITTEE, "Carol"), 2)
            .await
            .unwrap();
        ledger
            .commit(ballot(voter, election, COMMITTEE, "Dan"), 2)
            .await
            .unwrap();

        // Repeating a candidate is a duplicate.
        let err = ledger
            .commit(ballot(voter, election, COMMITTEE, "Carol"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::DuplicateVote));

        // A third distinct candidate overflows the budget.
        let err = ledger
            .commit(ballot(voter, election, COMMITTEE, "Erin"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::DuplicateVote));

        let registers = Coll::<VoteRegister>::from_db(&db);
        let register = registers
            .find_one(doc! {"voter_id": *voter}, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(register.candidates, vec!["Carol", "Dan"]);
    }

    #[backend_test]
    async fn settled_register_resolves_insert_race_as_duplicate(db: Database) {
        let notifier = VoteNotifier::new();
        let ledger = ledger(&db, &notifier).await;
        let (voter, election) = (Id::new(), Id::new());

        // A register created by another writer already holds this
        // candidate; the losing commit must settle as a duplicate on its
        // first round, not retry its way there.
        Coll::<NewVoteRegister>::from_db(&db)
            .insert_one(
                NewVoteRegister::new(voter, election, COMMITTEE, "Carol".to_string()),
                None,
            )
            .await
            .unwrap();

        let err = ledger
            .commit(ballot(voter, election, COMMITTEE, "Carol"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, CommitError::DuplicateVote));

        // No ballot was ever written.
        let ballots = Coll::<Ballot>::from_db(&db);
        let count = ballots
            .count_documents(doc! {"voter_id": *voter}, None)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[backend_test]
    async fn concurrent_multi_select_commits_both_succeed(db: Database) {
        let notifier = VoteNotifier::new();
        let ledger = ledger(&db, &notifier).await;
        let (voter, election) = (Id::new(), Id::new());

        // Different candidates within budget must not conflict.
        let (a, b) = rocket::tokio::join!(
            ledger.commit(ballot(voter, election, COMMITTEE, "Carol"), 2),
            ledger.commit(ballot(voter, election, COMMITTEE, "Dan"), 2),
        );
        a.unwrap();
        b.unwrap();

        let ballots = Coll::<Ballot>::from_db(&db);
        let count = ballots
            .count_documents(doc! {"voter_id": *voter}, None)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[backend_test]
    async fn commit_publishes_vote_committed_event(db: Database) {
        let notifier = VoteNotifier::new();
        let mut events = notifier.subscribe();
        let ledger = ledger(&db, &notifier).await;
        let (voter, election) = (Id::new(), Id::new());

        ledger
            .commit(ballot(voter, election, PRESIDENT, "Alice"), 1)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.election_id, election);
        assert_eq!(event.position_id, PRESIDENT);
        assert_eq!(event.candidate_id, "Alice");
        assert_eq!(event.tally, 1);
    }
}
