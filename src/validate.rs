//! The ballot validator: pure precondition checks on a vote intent.
//!
//! Checks run in a fixed order and the first failure wins; no side effects
//! occur here. The register check is advisory only — the ledger re-enforces
//! it atomically at commit time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::model::{
    auth::VerificationProof,
    ballot::BallotSpec,
    election::{Election, Position},
    register::VoteRegister,
    voter::VoterIdentity,
};

/// Why a ballot intent was rejected. Not retryable with the same intent;
/// the voter must correct their input or wait.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "camelCase", tag = "reason")]
pub enum RejectReason {
    #[error("Election is not currently accepting votes")]
    ElectionClosed,
    #[error("Position does not belong to this election")]
    UnknownPosition,
    #[error("Candidate does not stand for this position")]
    UnknownCandidate,
    #[error("Voter is not eligible to vote")]
    IneligibleVoter,
    #[error("Face verification is required for this election")]
    VerificationRequired,
    #[error("Voter has already voted for this position")]
    AlreadyVoted,
}

/// Validate a ballot intent against the election rules.
///
/// `proof` is the (already signature- and expiry-checked) verification
/// proof from the request, if any; `register` is the voter's existing vote
/// register for this position, if any. Returns the resolved position on
/// success so the caller can hand its `max_votes` to the ledger.
pub fn validate<'e>(
    intent: &BallotSpec,
    election: &'e Election,
    voter: &VoterIdentity,
    proof: Option<&VerificationProof>,
    register: Option<&VoteRegister>,
    now: DateTime<Utc>,
) -> Result<&'e Position, RejectReason> {
    if !election.is_open_at(now) {
        return Err(RejectReason::ElectionClosed);
    }

    let position = election
        .position(intent.position)
        .ok_or(RejectReason::UnknownPosition)?;

    if !position.has_candidate(&intent.candidate) {
        return Err(RejectReason::UnknownCandidate);
    }

    if !voter.eligible {
        return Err(RejectReason::IneligibleVoter);
    }

    if election.require_face_verification {
        let covered = proof
            .map(|p| p.covers(voter.id, election.id))
            .unwrap_or(false);
        if !covered {
            return Err(RejectReason::VerificationRequired);
        }
    }

    if let Some(register) = register {
        if register.has_selected(&intent.candidate)
            || register.selection_count() >= position.max_votes
        {
            return Err(RejectReason::AlreadyVoted);
        }
    }

    Ok(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration;

    use crate::model::{
        election::{ElectionState, COMMITTEE, PRESIDENT},
        mongodb::Id,
        register::{VoteRegister, VoteRegisterCore},
    };

    fn intent(position: u32, candidate: &str) -> BallotSpec {
        BallotSpec {
            position,
            candidate: candidate.to_string(),
        }
    }

    fn proof_for(voter: &VoterIdentity, election: &Election) -> VerificationProof {
        VerificationProof::new(voter.id, election.id, 0.3)
    }

    fn register_with(
        voter: &VoterIdentity,
        election: &Election,
        position: u32,
        candidates: &[&str],
    ) -> VoteRegister {
        VoteRegister {
            id: Id::new(),
            register: VoteRegisterCore {
                voter_id: voter.id,
                election_id: election.id,
                position_id: position,
                candidates: candidates.iter().map(|c| c.to_string()).collect(),
            },
        }
    }

    #[test]
    fn valid_intent_passes() {
        let election = Election::active_example();
        let voter = VoterIdentity::example();
        let proof = proof_for(&voter, &election);

        let position = validate(
            &intent(PRESIDENT, "Alice"),
            &election,
            &voter,
            Some(&proof),
            None,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(position.id, PRESIDENT);
    }

    #[test]
    fn completed_election_rejects_everything() {
        let election = Election::completed_example();
        let voter = VoterIdentity::example();
        // Even a valid verification proof cannot help.
        let proof = proof_for(&voter, &election);

        let result = validate(
            &intent(PRESIDENT, "Alice"),
            &election,
            &voter,
            Some(&proof),
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::ElectionClosed));
    }

    #[test]
    fn upcoming_election_rejects() {
        let election = Election::upcoming_example();
        let voter = VoterIdentity::example();

        let result = validate(
            &intent(PRESIDENT, "Alice"),
            &election,
            &voter,
            None,
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::ElectionClosed));
    }

    #[test]
    fn active_election_outside_window_rejects() {
        let mut election = Election::active_example();
        election.state = ElectionState::Active;
        election.end_time = Utc::now() - Duration::minutes(1);
        let voter = VoterIdentity::example();
        let proof = proof_for(&voter, &election);

        let result = validate(
            &intent(PRESIDENT, "Alice"),
            &election,
            &voter,
            Some(&proof),
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::ElectionClosed));
    }

    #[test]
    fn unknown_position_rejects() {
        let election = Election::active_example();
        let voter = VoterIdentity::example();
        let proof = proof_for(&voter, &election);

        let result = validate(
            &intent(99, "Alice"),
            &election,
            &voter,
            Some(&proof),
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::UnknownPosition));
    }

    #[test]
    fn unknown_candidate_rejects() {
        let election = Election::active_example();
        let voter = VoterIdentity::example();
        let proof = proof_for(&voter, &election);

        let result = validate(
            &intent(PRESIDENT, "Mallory"),
            &election,
            &voter,
            Some(&proof),
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::UnknownCandidate));
    }

    #[test]
    fn ineligible_voter_rejects() {
        let election = Election::active_example();
        let voter = VoterIdentity::ineligible_example();
        let proof = proof_for(&voter, &election);

        let result = validate(
            &intent(PRESIDENT, "Alice"),
            &election,
            &voter,
            Some(&proof),
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::IneligibleVoter));
    }

    #[test]
    fn missing_proof_rejects_when_verification_required() {
        let election = Election::active_example();
        let voter = VoterIdentity::example();

        let result = validate(
            &intent(PRESIDENT, "Alice"),
            &election,
            &voter,
            None,
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::VerificationRequired));
    }

    #[test]
    fn proof_for_another_election_rejects() {
        let election = Election::active_example();
        let voter = VoterIdentity::example();
        let other_proof = VerificationProof::new(voter.id, Id::new(), 0.3);

        let result = validate(
            &intent(PRESIDENT, "Alice"),
            &election,
            &voter,
            Some(&other_proof),
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::VerificationRequired));
    }

    #[test]
    fn proof_for_another_voter_rejects() {
        let election = Election::active_example();
        let voter = VoterIdentity::example();
        let other_proof = VerificationProof::new(Id::new(), election.id, 0.3);

        let result = validate(
            &intent(PRESIDENT, "Alice"),
            &election,
            &voter,
            Some(&other_proof),
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::VerificationRequired));
    }

    #[test]
    fn no_proof_needed_when_verification_not_required() {
        let election = Election::unverified_example();
        let voter = VoterIdentity::example();

        assert!(validate(
            &intent(PRESIDENT, "Alice"),
            &election,
            &voter,
            None,
            None,
            Utc::now(),
        )
        .is_ok());
    }

    #[test]
    fn single_select_position_rejects_second_selection() {
        let election = Election::unverified_example();
        let voter = VoterIdentity::example();
        let register = register_with(&voter, &election, PRESIDENT, &["Alice"]);

        // A different candidate is still a second selection.
        let result = validate(
            &intent(PRESIDENT, "Bob"),
            &election,
            &voter,
            None,
            Some(&register),
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::AlreadyVoted));
    }

    #[test]
    fn multi_select_position_allows_up_to_max_votes() {
        let election = Election::unverified_example();
        let voter = VoterIdentity::example();
        let register = register_with(&voter, &election, COMMITTEE, &["Carol"]);

        // Second distinct candidate is fine (max_votes = 2)...
        assert!(validate(
            &intent(COMMITTEE, "Dan"),
            &election,
            &voter,
            None,
            Some(&register),
            Utc::now(),
        )
        .is_ok());

        // ...but repeating a candidate is not.
        let result = validate(
            &intent(COMMITTEE, "Carol"),
            &election,
            &voter,
            None,
            Some(&register),
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::AlreadyVoted));

        // And a third selection overflows the budget.
        let full = register_with(&voter, &election, COMMITTEE, &["Carol", "Dan"]);
        let result = validate(
            &intent(COMMITTEE, "Erin"),
            &election,
            &voter,
            None,
            Some(&full),
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::AlreadyVoted));
    }

    #[test]
    fn check_order_reports_most_fundamental_failure_first() {
        // Closed election beats missing verification.
        let election = Election::completed_example();
        let voter = VoterIdentity::ineligible_example();
        let result = validate(
            &intent(99, "Mallory"),
            &election,
            &voter,
            None,
            None,
            Utc::now(),
        );
        assert_eq!(result, Err(RejectReason::ElectionClosed));
    }
}
