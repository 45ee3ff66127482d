//! The face matcher: wraps the external embedding capability and turns a
//! captured frame into a match/no-match decision against a reference
//! descriptor.

use data_encoding::BASE64;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::model::descriptor::{DescriptorLengthError, FaceDescriptor};

/// A captured camera frame, opaque to the core.
///
/// Frames pass straight through to the embedder and are never persisted;
/// over the API they travel base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Frame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// Recoverable capture failures: the frame did not contain exactly one
/// face. A voting system must never guess identity, so extraction fails
/// explicitly rather than picking one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("No face found in the captured frame")]
    NoFaceFound,
    #[error("More than one face found in the captured frame")]
    MultipleFacesFound,
}

/// Failures of the embedding capability itself (transport or bad data).
/// These are not capture attempts and do not consume the attempt budget.
#[derive(Debug, Error)]
pub enum EmbedderError {
    #[error("Failed to reach the embedding service: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Embedding service returned a malformed descriptor: {0}")]
    BadDescriptor(#[from] DescriptorLengthError),
}

/// Errors from [`FaceMatcher::extract`].
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Embedder(#[from] EmbedderError),
}

/// The external face-embedding capability: returns one descriptor per face
/// detected in the frame.
#[rocket::async_trait]
pub trait FaceEmbedder: Send + Sync {
    async fn embed(&self, frame: &Frame) -> Result<Vec<FaceDescriptor>, EmbedderError>;
}

/// Production embedder: POSTs the frame to the configured embedding
/// service and decodes the returned descriptor list.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
}

impl HttpEmbedder {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    frame: &'a Frame,
}

#[derive(Deserialize)]
struct EmbedResponse {
    descriptors: Vec<Vec<f64>>,
}

#[rocket::async_trait]
impl FaceEmbedder for HttpEmbedder {
    async fn embed(&self, frame: &Frame) -> Result<Vec<FaceDescriptor>, EmbedderError> {
        let response = self
            .client
            .post(&self.url)
            .json(&EmbedRequest { frame })
            .send()
            .await?
            .error_for_status()?
            .json::<EmbedResponse>()
            .await?;
        response
            .descriptors
            .into_iter()
            .map(|components| Ok(FaceDescriptor::new(components)?))
            .collect()
    }
}

/// The face matcher: descriptor extraction plus thresholded comparison.
pub struct FaceMatcher {
    embedder: Box<dyn FaceEmbedder>,
    threshold: f64,
}

impl FaceMatcher {
    pub fn new(embedder: impl FaceEmbedder + 'static, threshold: f64) -> Self {
        Self {
            embedder: Box::new(embedder),
            threshold,
        }
    }

    /// Extract the descriptor of the single face in the frame.
    ///
    /// Fails explicitly when zero or more than one face is found.
    pub async fn extract(&self, frame: &Frame) -> Result<FaceDescriptor, ExtractError> {
        let mut descriptors = self.embedder.embed(frame).await?;
        match descriptors.len() {
            0 => Err(CaptureError::NoFaceFound.into()),
            1 => Ok(descriptors.remove(0)),
            _ => Err(CaptureError::MultipleFacesFound.into()),
        }
    }

    /// Euclidean distance between two descriptors.
    pub fn distance(&self, a: &FaceDescriptor, b: &FaceDescriptor) -> f64 {
        a.distance_to(b)
    }

    /// Does the given distance count as a match?
    pub fn is_match(&self, distance: f64) -> bool {
        distance < self.threshold
    }
}
