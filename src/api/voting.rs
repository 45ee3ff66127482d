use std::collections::HashMap;

use chrono::Utc;
use mongodb::bson::doc;
use rocket::{futures::TryStreamExt, http::Status, serde::json::Json, Route};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::ledger::{CommitError, VoteLedger};
use crate::model::{
    auth::{VerificationProof, VoterToken},
    ballot::{BallotSpec, NewBallot},
    candidate_totals::CandidateTotals,
    election::{CandidateId, Election, PositionId},
    mongodb::{Coll, Id},
    register::VoteRegister,
    voter::VoterIdentity,
};
use crate::validate::validate;

use super::common::{election_by_id, voter_by_token};

pub fn routes() -> Vec<Route> {
    routes![cast_votes, get_votes, candidate_totals]
}

/// The per-intent result of a cast request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CastResult {
    position: PositionId,
    candidate: CandidateId,
    #[serde(flatten)]
    outcome: CastOutcome,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
enum CastOutcome {
    /// The ballot was durably committed.
    Committed { ballot_id: String },
    /// The ledger already held a conflicting ballot. Terminal.
    AlreadyVoted,
}

/// Cast a batch of vote intents.
///
/// All intents are validated up-front with no side effects; any rejection
/// fails the whole request before anything is written. Commits then run
/// one ledger transaction per intent, so every returned `committed` result
/// is durable even if a later intent turns out to be a duplicate.
#[post(
    "/voter/elections/<election_id>/votes/cast",
    data = "<ballot_specs>",
    format = "json"
)]
async fn cast_votes(
    token: VoterToken,
    election_id: Id,
    ballot_specs: Json<Vec<BallotSpec>>,
    proof: Option<VerificationProof>,
    voters: Coll<VoterIdentity>,
    elections: Coll<Election>,
    registers: Coll<VoteRegister>,
    ledger: VoteLedger<'_>,
) -> Result<Json<Vec<CastResult>>> {
    let voter = voter_by_token(&token, &voters).await?;
    let election = election_by_id(election_id, &elections).await?;

    // The voter's existing registers for this election, by position.
    let filter = doc! { "voter_id": *voter.id, "election_id": *election.id };
    let existing: Vec<VoteRegister> = registers.find(filter, None).await?.try_collect().await?;
    let by_position: HashMap<PositionId, &VoteRegister> =
        existing.iter().map(|r| (r.position_id, r)).collect();

    // Validate every intent before any write.
    let now = Utc::now();
    let mut validated = Vec::with_capacity(ballot_specs.0.len());
    for spec in &ballot_specs.0 {
        let position = validate(
            spec,
            &election,
            &voter,
            proof.as_ref(),
            by_position.get(&spec.position).copied(),
            now,
        )
        .map_err(|reason| {
            Error::Status(
                Status::UnprocessableEntity,
                format!(
                    "Rejected vote for position {}, candidate '{}': {reason}",
                    spec.position, spec.candidate
                ),
            )
        })?;
        validated.push((spec, position.max_votes));
    }

    let face_verified = proof
        .as_ref()
        .map(|p| p.covers(voter.id, election.id))
        .unwrap_or(false);

    // Commit each ballot exactly once. Duplicates surface per-intent; the
    // earlier commits of this batch stand regardless.
    let mut results = Vec::with_capacity(validated.len());
    for (spec, max_votes) in validated {
        let ballot = NewBallot::new(
            voter.id,
            election.id,
            spec.position,
            spec.candidate.clone(),
            face_verified,
        );
        let outcome = match ledger.commit(ballot, max_votes).await {
            Ok(committed) => CastOutcome::Committed {
                ballot_id: committed.id.to_string(),
            },
            Err(CommitError::DuplicateVote) => CastOutcome::AlreadyVoted,
            Err(CommitError::Unavailable(err)) => return Err(err.into()),
        };
        results.push(CastResult {
            position: spec.position,
            candidate: spec.candidate.clone(),
            outcome,
        });
    }

    Ok(Json(results))
}

/// The voter's committed selections for an election, by position.
#[get("/voter/elections/<election_id>/votes")]
async fn get_votes(
    token: VoterToken,
    election_id: Id,
    registers: Coll<VoteRegister>,
) -> Result<Json<HashMap<PositionId, Vec<CandidateId>>>> {
    let filter = doc! { "voter_id": *token.voter_id, "election_id": *election_id };
    let existing: Vec<VoteRegister> = registers.find(filter, None).await?.try_collect().await?;
    let votes = existing
        .into_iter()
        .map(|r| (r.position_id, r.register.candidates))
        .collect();
    Ok(Json(votes))
}

/// Derived candidate tallies for one position, for live charts.
/// Candidates nobody has voted for yet appear with a zero tally.
#[get("/elections/<election_id>/positions/<position_id>/totals")]
async fn candidate_totals(
    election_id: Id,
    position_id: PositionId,
    elections: Coll<Election>,
    totals: Coll<CandidateTotals>,
) -> Result<Json<HashMap<CandidateId, u64>>> {
    let election = election_by_id(election_id, &elections).await?;
    let position = election
        .position(position_id)
        .ok_or_else(|| Error::not_found(format!("Position {}", position_id)))?;

    let mut tallies: HashMap<CandidateId, u64> = position
        .candidates
        .iter()
        .map(|candidate| (candidate.clone(), 0))
        .collect();

    let filter = doc! { "election_id": *election.id, "position_id": position_id };
    let mut cursor = totals.find(filter, None).await?;
    while let Some(total) = cursor.try_next().await? {
        tallies.insert(total.candidate_id.clone(), total.tally);
    }

    Ok(Json(tallies))
}

#[cfg(test)]
mod tests {
    use mongodb::Database;
    use rocket::{
        http::ContentType,
        local::asynchronous::Client,
        serde::json::{serde_json::json, Value},
    };

    use crate::config::Config;
    use crate::model::{
        ballot::Ballot,
        election::{COMMITTEE, PRESIDENT},
    };

    use super::*;

    async fn seed(db: &Database) -> (VoterIdentity, Election) {
        let voter = VoterIdentity::example();
        let election = Election::unverified_example();
        Coll::<VoterIdentity>::from_db(db)
            .insert_one(&voter, None)
            .await
            .unwrap();
        Coll::<Election>::from_db(db)
            .insert_one(&election, None)
            .await
            .unwrap();
        (voter, election)
    }

    fn config(client: &Client) -> &Config {
        client.rocket().state::<Config>().unwrap()
    }

    #[backend_test]
    async fn cast_then_duplicate_then_read_back(client: Client, db: Database) {
        let (voter, election) = seed(&db).await;
        let token = VoterToken::for_voter(voter.id).into_cookie(config(&client));

        // First cast commits.
        let response = client
            .post(format!("/voter/elections/{}/votes/cast", election.id))
            .header(ContentType::JSON)
            .cookie(token.clone())
            .body(json!([{"position": PRESIDENT, "candidate": "Alice"}]).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let results = response.into_json::<Value>().await.unwrap();
        assert_eq!(results[0]["outcome"], "committed");
        assert_eq!(results[0]["candidate"], "Alice");

        // A second intent for the same position is reported per-intent, not
        // as a request failure.
        let response = client
            .post(format!("/voter/elections/{}/votes/cast", election.id))
            .header(ContentType::JSON)
            .cookie(token.clone())
            .body(json!([{"position": PRESIDENT, "candidate": "Bob"}]).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let results = response.into_json::<Value>().await.unwrap();
        assert_eq!(results[0]["outcome"], "alreadyVoted");

        // The voter sees their committed selections.
        let response = client
            .get(format!("/voter/elections/{}/votes", election.id))
            .cookie(token)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let votes = response.into_json::<Value>().await.unwrap();
        assert_eq!(votes[PRESIDENT.to_string()], json!(["Alice"]));
    }

    #[backend_test]
    async fn batch_cast_across_positions(client: Client, db: Database) {
        let (voter, election) = seed(&db).await;
        let token = VoterToken::for_voter(voter.id).into_cookie(config(&client));

        let body = json!([
            {"position": PRESIDENT, "candidate": "Alice"},
            {"position": COMMITTEE, "candidate": "Carol"},
            {"position": COMMITTEE, "candidate": "Dan"},
        ]);
        let response = client
            .post(format!("/voter/elections/{}/votes/cast", election.id))
            .header(ContentType::JSON)
            .cookie(token)
            .body(body.to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let results = response.into_json::<Value>().await.unwrap();
        assert_eq!(results.as_array().unwrap().len(), 3);
        for result in results.as_array().unwrap() {
            assert_eq!(result["outcome"], "committed");
        }
    }

    #[backend_test]
    async fn cast_requires_a_voter_token(client: Client, db: Database) {
        let (_, election) = seed(&db).await;

        let response = client
            .post(format!("/voter/elections/{}/votes/cast", election.id))
            .header(ContentType::JSON)
            .body(json!([{"position": PRESIDENT, "candidate": "Alice"}]).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[backend_test]
    async fn cast_rejects_a_closed_election(client: Client, db: Database) {
        let voter = VoterIdentity::example();
        let election = Election::completed_example();
        Coll::<VoterIdentity>::from_db(&db)
            .insert_one(&voter, None)
            .await
            .unwrap();
        Coll::<Election>::from_db(&db)
            .insert_one(&election, None)
            .await
            .unwrap();
        let token = VoterToken::for_voter(voter.id).into_cookie(config(&client));

        let response = client
            .post(format!("/voter/elections/{}/votes/cast", election.id))
            .header(ContentType::JSON)
            .cookie(token)
            .body(json!([{"position": PRESIDENT, "candidate": "Alice"}]).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);

        // Nothing was written.
        let ballots = Coll::<Ballot>::from_db(&db);
        let count = ballots.count_documents(None, None).await.unwrap();
        assert_eq!(count, 0);
    }

    #[backend_test]
    async fn cast_without_proof_is_rejected_when_verification_is_required(
        client: Client,
        db: Database,
    ) {
        let voter = VoterIdentity::example();
        let election = Election::active_example();
        Coll::<VoterIdentity>::from_db(&db)
            .insert_one(&voter, None)
            .await
            .unwrap();
        Coll::<Election>::from_db(&db)
            .insert_one(&election, None)
            .await
            .unwrap();
        let token = VoterToken::for_voter(voter.id).into_cookie(config(&client));

        let response = client
            .post(format!("/voter/elections/{}/votes/cast", election.id))
            .header(ContentType::JSON)
            .cookie(token.clone())
            .body(json!([{"position": PRESIDENT, "candidate": "Alice"}]).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);

        // With a proof for this voter and election, the same cast commits,
        // and the ballot records that it was face-verified.
        let proof =
            VerificationProof::new(voter.id, election.id, 0.3).into_cookie(config(&client));
        let response = client
            .post(format!("/voter/elections/{}/votes/cast", election.id))
            .header(ContentType::JSON)
            .cookie(token)
            .cookie(proof)
            .body(json!([{"position": PRESIDENT, "candidate": "Alice"}]).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let ballot = Coll::<Ballot>::from_db(&db)
            .find_one(doc! { "voter_id": *voter.id }, None)
            .await
            .unwrap()
            .unwrap();
        assert!(ballot.face_verified);
    }

    #[backend_test]
    async fn a_proof_for_another_election_does_not_count(client: Client, db: Database) {
        let voter = VoterIdentity::example();
        let election = Election::active_example();
        Coll::<VoterIdentity>::from_db(&db)
            .insert_one(&voter, None)
            .await
            .unwrap();
        Coll::<Election>::from_db(&db)
            .insert_one(&election, None)
            .await
            .unwrap();
        let token = VoterToken::for_voter(voter.id).into_cookie(config(&client));
        let proof = VerificationProof::new(voter.id, Id::new(), 0.3).into_cookie(config(&client));

        let response = client
            .post(format!("/voter/elections/{}/votes/cast", election.id))
            .header(ContentType::JSON)
            .cookie(token)
            .cookie(proof)
            .body(json!([{"position": PRESIDENT, "candidate": "Alice"}]).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
    }

    #[backend_test]
    async fn totals_are_zero_filled_and_live(client: Client, db: Database) {
        let (voter, election) = seed(&db).await;
        let token = VoterToken::for_voter(voter.id).into_cookie(config(&client));

        // Before any votes, every candidate shows a zero tally.
        let response = client
            .get(format!(
                "/elections/{}/positions/{}/totals",
                election.id, PRESIDENT
            ))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let totals = response.into_json::<Value>().await.unwrap();
        assert_eq!(totals, json!({"Alice": 0, "Bob": 0}));

        client
            .post(format!("/voter/elections/{}/votes/cast", election.id))
            .header(ContentType::JSON)
            .cookie(token)
            .body(json!([{"position": PRESIDENT, "candidate": "Alice"}]).to_string())
            .dispatch()
            .await;

        let response = client
            .get(format!(
                "/elections/{}/positions/{}/totals",
                election.id, PRESIDENT
            ))
            .dispatch()
            .await;
        let totals = response.into_json::<Value>().await.unwrap();
        assert_eq!(totals, json!({"Alice": 1, "Bob": 0}));
    }

    #[backend_test]
    async fn totals_for_an_unknown_position_are_not_found(client: Client, db: Database) {
        let (_, election) = seed(&db).await;

        let response = client
            .get(format!("/elections/{}/positions/99/totals", election.id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);
    }
}
