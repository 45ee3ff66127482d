use std::ops::Deref;

use chrono::{DateTime, Duration, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// Core verification outcome data, as stored in the database.
///
/// These are audit records only: they are never read back to satisfy a
/// future verification check (that is the job of the signed proof cookie,
/// which cannot be replayed across voters or elections). The database
/// expires them via a TTL index on `expire_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcomeCore {
    /// The voter who attempted verification.
    pub voter_id: Id,
    /// The election the attempt was scoped to.
    pub election_id: Id,
    /// When the session reached a terminal state.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub verified_at: DateTime<Utc>,
    /// Whether the probe matched the reference descriptor.
    pub matched: bool,
    /// Distance of the final comparison, if one took place.
    pub distance: Option<f64>,
    /// Capture attempts consumed by the session.
    pub attempts_used: u32,
    /// When the audit record expires.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub expire_at: DateTime<Utc>,
}

impl VerificationOutcomeCore {
    pub fn new(
        voter_id: Id,
        election_id: Id,
        matched: bool,
        distance: Option<f64>,
        attempts_used: u32,
        retain_for: Duration,
    ) -> Self {
        let verified_at = Utc::now();
        Self {
            voter_id,
            election_id,
            verified_at,
            matched,
            distance,
            attempts_used,
            expire_at: verified_at + retain_for,
        }
    }
}

/// An outcome ready for DB insertion is just one without an ID.
pub type NewVerificationOutcome = VerificationOutcomeCore;

/// A verification outcome from the database, with its unique ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub outcome: VerificationOutcomeCore,
}

impl Deref for VerificationOutcome {
    type Target = VerificationOutcomeCore;

    fn deref(&self) -> &Self::Target {
        &self.outcome
    }
}
