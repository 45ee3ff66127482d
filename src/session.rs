//! The verification session: a short-lived state machine turning a live
//! capture attempt into a verified/unverified decision.
//!
//! Sessions are request-local and scoped to a single `(voter, election)`
//! pair; nothing carries over between ballot intents. The only suspension
//! point is the embedder call inside [`FaceMatcher::extract`].

use chrono::Duration;
use serde::Serialize;

use crate::face::{EmbedderError, ExtractError, FaceMatcher, Frame};
use crate::model::{
    descriptor::FaceDescriptor,
    mongodb::Id,
    verification::NewVerificationOutcome,
};

/// Capture attempts allowed per session by default.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// States of a verification session.
///
/// `Verified` and `Aborted` are final; `Unverified` is final for the
/// attempt but permits a retry while budget remains.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    /// Created but not yet started.
    Idle,
    /// Waiting for a frame.
    Capturing,
    /// Comparing a probe against the reference.
    Comparing,
    /// The probe matched the reference.
    Verified,
    /// The last comparison failed; retry possible while budget remains.
    Unverified,
    /// Attempt budget exhausted without a match.
    Aborted,
}

impl SessionState {
    /// No further frames will be accepted in this state.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Verified | Self::Aborted)
    }
}

/// A verification session for one ballot intent.
pub struct VerificationSession {
    voter_id: Id,
    election_id: Id,
    reference: FaceDescriptor,
    state: SessionState,
    remaining_attempts: u32,
    attempts_used: u32,
    last_distance: Option<f64>,
}

impl VerificationSession {
    /// Create a session against the voter's registered reference
    /// descriptor, with a bounded attempt budget.
    pub fn new(
        voter_id: Id,
        election_id: Id,
        reference: FaceDescriptor,
        max_attempts: u32,
    ) -> Self {
        Self {
            voter_id,
            election_id,
            reference,
            state: SessionState::Idle,
            remaining_attempts: max_attempts,
            attempts_used: 0,
            last_distance: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    /// Distance of the most recent comparison, if one took place.
    pub fn last_distance(&self) -> Option<f64> {
        self.last_distance
    }

    /// Start capturing. `Idle -> Capturing`.
    pub fn start(&mut self) {
        if self.state == SessionState::Idle {
            self.state = SessionState::Capturing;
        }
    }

    /// Feed one captured frame through extraction and comparison.
    ///
    /// Valid from `Capturing` (and from `Unverified`, which re-enters
    /// capture as the retry). Frames submitted in a final state are
    /// ignored. The probe descriptor is dropped on return and never
    /// persisted. Embedder faults propagate without consuming budget.
    pub async fn submit_frame(
        &mut self,
        matcher: &FaceMatcher,
        frame: &Frame,
    ) -> Result<SessionState, EmbedderError> {
        match self.state {
            SessionState::Idle => self.start(),
            // Retrying a failed match re-enters capture.
            SessionState::Unverified => self.state = SessionState::Capturing,
            SessionState::Capturing => {}
            SessionState::Comparing | SessionState::Verified | SessionState::Aborted => {
                return Ok(self.state);
            }
        }

        let probe = match matcher.extract(frame).await {
            Ok(probe) => probe,
            Err(ExtractError::Capture(err)) => {
                debug!("Capture attempt failed for voter {}: {err}", self.voter_id);
                // `Capturing -> Idle` retry, or `Aborted` once exhausted.
                self.consume_attempt(SessionState::Capturing);
                return Ok(self.state);
            }
            Err(ExtractError::Embedder(err)) => return Err(err),
        };

        self.state = SessionState::Comparing;
        let distance = matcher.distance(&probe, &self.reference);
        self.last_distance = Some(distance);

        if matcher.is_match(distance) {
            self.state = SessionState::Verified;
        } else {
            self.consume_attempt(SessionState::Unverified);
        }
        Ok(self.state)
    }

    /// Drive the session over an ordered batch of captured frames until a
    /// final state is reached or the frames run out. A session that runs
    /// out of frames without verifying is abandoned.
    pub async fn run(
        &mut self,
        matcher: &FaceMatcher,
        frames: &[Frame],
    ) -> Result<SessionState, EmbedderError> {
        self.start();
        for frame in frames {
            if self.submit_frame(matcher, frame).await?.is_final() {
                break;
            }
        }
        Ok(self.abandon())
    }

    /// The client has given up. Any non-verified state becomes `Aborted`.
    pub fn abandon(&mut self) -> SessionState {
        if self.state != SessionState::Verified {
            self.state = SessionState::Aborted;
        }
        self.state
    }

    /// The terminal audit record for this session.
    pub fn outcome(&self, retain_for: Duration) -> NewVerificationOutcome {
        NewVerificationOutcome::new(
            self.voter_id,
            self.election_id,
            self.state == SessionState::Verified,
            self.last_distance,
            self.attempts_used,
            retain_for,
        )
    }

    fn consume_attempt(&mut self, next: SessionState) {
        self.attempts_used += 1;
        // Saturate so a zero attempt budget aborts instead of underflowing.
        self.remaining_attempts = self.remaining_attempts.saturating_sub(1);
        self.state = if self.remaining_attempts == 0 {
            SessionState::Aborted
        } else {
            next
        };
    }
}
