use std::ops::Deref;

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::mongodb::Id;

/// The fixed length of every face descriptor, as produced by the external
/// embedding capability.
pub const DESCRIPTOR_LENGTH: usize = 128;

/// A face embedding vector of exactly [`DESCRIPTOR_LENGTH`] components.
///
/// A *reference* descriptor is persisted once per voter at registration; a
/// *probe* descriptor is extracted per verification attempt and discarded
/// after comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct FaceDescriptor(Vec<f64>);

impl FaceDescriptor {
    /// Construct a descriptor, rejecting vectors of the wrong length.
    pub fn new(components: Vec<f64>) -> Result<Self, DescriptorLengthError> {
        if components.len() == DESCRIPTOR_LENGTH {
            Ok(Self(components))
        } else {
            Err(DescriptorLengthError(components.len()))
        }
    }

    /// Euclidean distance to another descriptor.
    ///
    /// Zero iff the descriptors are identical; for normalised embeddings the
    /// result lies in [0, 2].
    pub fn distance_to(&self, other: &FaceDescriptor) -> f64 {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt()
    }
}

#[derive(Debug, Error)]
#[error("Face descriptor must have {DESCRIPTOR_LENGTH} components, got {0}")]
pub struct DescriptorLengthError(usize);

impl TryFrom<Vec<f64>> for FaceDescriptor {
    type Error = DescriptorLengthError;

    fn try_from(components: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(components)
    }
}

impl From<FaceDescriptor> for Vec<f64> {
    fn from(descriptor: FaceDescriptor) -> Self {
        descriptor.0
    }
}

impl Deref for FaceDescriptor {
    type Target = [f64];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Core reference-descriptor data, as stored in the database.
///
/// There is at most one of these per voter; it is replaced only by explicit
/// re-registration, never silently overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoterDescriptorCore {
    /// The voter this reference belongs to.
    pub voter_id: Id,
    /// The reference descriptor captured at registration.
    pub descriptor: FaceDescriptor,
    /// When the reference was (re-)registered.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub registered_at: DateTime<Utc>,
}

impl VoterDescriptorCore {
    pub fn new(voter_id: Id, descriptor: FaceDescriptor) -> Self {
        Self {
            voter_id,
            descriptor,
            registered_at: Utc::now(),
        }
    }
}

/// A reference descriptor ready for DB insertion is just one without an ID.
pub type NewVoterDescriptor = VoterDescriptorCore;

/// A reference descriptor from the database, with its unique ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoterDescriptor {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub descriptor: VoterDescriptorCore,
}

impl Deref for VoterDescriptor {
    type Target = VoterDescriptorCore;

    fn deref(&self) -> &Self::Target {
        &self.descriptor
    }
}
