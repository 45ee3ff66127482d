use chrono::Duration;
use mongodb::bson::doc;
use rocket::{
    http::{CookieJar, Status},
    serde::json::Json,
    Route, State,
};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::face::{FaceMatcher, Frame};
use crate::model::{
    auth::{VerificationProof, VoterToken},
    descriptor::{NewVoterDescriptor, VoterDescriptor},
    election::Election,
    mongodb::{Coll, Id},
    verification::NewVerificationOutcome,
    voter::VoterIdentity,
};
use crate::session::{SessionState, VerificationSession};

use super::common::{election_by_id, voter_by_token};

/// How long verification audit records are retained before the TTL index
/// removes them.
const OUTCOME_RETENTION_DAYS: i64 = 30;

pub fn routes() -> Vec<Route> {
    routes![register_descriptor, verify]
}

/// A registration capture from which to derive the reference descriptor.
#[derive(Debug, Deserialize)]
struct RegistrationRequest {
    frame: Frame,
}

/// Register, or explicitly re-register, the voter's reference descriptor.
///
/// The frame must contain exactly one face. Raw frames are never stored;
/// only the extracted descriptor is.
#[post("/voter/descriptor", data = "<request>", format = "json")]
async fn register_descriptor(
    token: VoterToken,
    request: Json<RegistrationRequest>,
    matcher: &State<FaceMatcher>,
    voters: Coll<VoterIdentity>,
    descriptors: Coll<NewVoterDescriptor>,
) -> Result<()> {
    let voter = voter_by_token(&token, &voters).await?;

    let descriptor = matcher.extract(&request.0.frame).await.map_err(|err| {
        Error::Status(
            Status::UnprocessableEntity,
            format!("Cannot register face: {err}"),
        )
    })?;

    // Upsert so re-registration replaces the old reference; a voter never
    // holds more than one (enforced by the unique index too).
    let replacement = NewVoterDescriptor::new(voter.id, descriptor);
    let options = mongodb::options::ReplaceOptions::builder()
        .upsert(true)
        .build();
    descriptors
        .replace_one(doc! { "voter_id": *voter.id }, &replacement, options)
        .await?;

    info!("Registered reference descriptor for voter {}", voter.id);
    Ok(())
}

/// The result of a verification session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VerificationResponse {
    state: SessionState,
    distance: Option<f64>,
    attempts_used: u32,
}

/// Run one verification session for this voter and election over an
/// ordered batch of captured frames.
///
/// On `Verified`, a proof cookie scoped to this `(voter, election)` pair
/// is set, expiring after the configured TTL. The session itself lives
/// and dies with this request; a client that aborts mid-capture leaves
/// nothing behind but an expiring audit record.
#[post(
    "/voter/elections/<election_id>/verification",
    data = "<frames>",
    format = "json"
)]
async fn verify(
    token: VoterToken,
    election_id: Id,
    frames: Json<Vec<Frame>>,
    config: &State<Config>,
    matcher: &State<FaceMatcher>,
    cookies: &CookieJar<'_>,
    voters: Coll<VoterIdentity>,
    elections: Coll<Election>,
    descriptors: Coll<VoterDescriptor>,
    outcomes: Coll<NewVerificationOutcome>,
) -> Result<Json<VerificationResponse>> {
    let voter = voter_by_token(&token, &voters).await?;
    let election = election_by_id(election_id, &elections).await?;

    if !election.require_face_verification {
        return Err(Error::Status(
            Status::BadRequest,
            format!("Election {} does not require face verification", election_id),
        ));
    }
    if !election.is_open_at(chrono::Utc::now()) {
        return Err(Error::Status(
            Status::BadRequest,
            format!("Election {} is not currently accepting votes", election_id),
        ));
    }

    let reference = descriptors
        .find_one(doc! { "voter_id": *voter.id }, None)
        .await?
        .ok_or_else(|| Error::not_found(format!("Registered face for voter {}", voter.id)))?;

    let mut session = VerificationSession::new(
        voter.id,
        election.id,
        reference.descriptor.descriptor.clone(),
        config.max_capture_attempts(),
    );
    let state = session.run(matcher, &frames.0).await.map_err(|err| {
        Error::Status(
            Status::BadGateway,
            format!("Face embedding service unavailable: {err}"),
        )
    })?;

    // Audit every terminal session; never read back to satisfy checks.
    outcomes
        .insert_one(session.outcome(Duration::days(OUTCOME_RETENTION_DAYS)), None)
        .await?;

    if state == SessionState::Verified {
        // Unwrap is safe: a verified session always compared.
        let distance = session.last_distance().unwrap();
        let proof = VerificationProof::new(voter.id, election.id, distance);
        cookies.add(proof.into_cookie(config));
        info!(
            "Voter {} verified for election {} (distance {distance:.3})",
            voter.id, election.id
        );
    }

    Ok(Json(VerificationResponse {
        state,
        distance: session.last_distance(),
        attempts_used: session.attempts_used(),
    }))
}
