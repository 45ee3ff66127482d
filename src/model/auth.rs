use chrono::{serde::ts_seconds, DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, TokenData, Validation};
use rocket::{
    http::{Cookie, SameSite, Status},
    outcome::{try_outcome, IntoOutcome},
    request::{FromRequest, Outcome},
    Request, State,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::Duration as CookieDuration;

use crate::config::Config;
use crate::error::Error;
use crate::model::mongodb::Id;

pub const VOTER_TOKEN_COOKIE: &str = "voter_token";
pub const VERIFICATION_COOKIE: &str = "verification_proof";

/// A verified voter identity, handed in by the external identity subsystem
/// as a JWT cookie signed with the shared secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoterToken {
    pub voter_id: Id,
}

impl VoterToken {
    /// A token for the given voter.
    pub fn for_voter(voter_id: Id) -> Self {
        Self { voter_id }
    }

    /// Serialise into a signed cookie.
    pub fn into_cookie(self, config: &Config) -> Cookie<'static> {
        into_signed_cookie(VOTER_TOKEN_COOKIE, self, config.auth_ttl(), config)
    }

    /// Deserialise from a signed cookie.
    pub fn from_cookie(cookie: &Cookie<'_>, config: &Config) -> Result<Self, Error> {
        from_signed_cookie(cookie, config)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for VoterToken {
    type Error = Error;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        // Unwrap is safe as `Config` is always managed.
        let config = req.guard::<&State<Config>>().await.unwrap();

        let cookie = match req.cookies().get(VOTER_TOKEN_COOKIE) {
            Some(cookie) => cookie,
            None => {
                return Outcome::Failure((
                    Status::Unauthorized,
                    Error::Status(Status::Unauthorized, "No voter token".to_string()),
                ));
            }
        };

        match Self::from_cookie(cookie, config) {
            Ok(token) => Outcome::Success(token),
            Err(err) => Outcome::Failure((Status::Unauthorized, err)),
        }
    }
}

/// Proof that a verification session reached `Verified`.
///
/// Scoped to a single `(voter, election)` pair and expiring after the
/// configured TTL, so it cannot be replayed for other voters, elections,
/// or ballot intents made after the TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationProof {
    pub voter_id: Id,
    pub election_id: Id,
    /// Distance of the matching comparison, retained for audit.
    pub distance: f64,
}

impl VerificationProof {
    pub fn new(voter_id: Id, election_id: Id, distance: f64) -> Self {
        Self {
            voter_id,
            election_id,
            distance,
        }
    }

    /// Does this proof cover the given ballot intent?
    pub fn covers(&self, voter_id: Id, election_id: Id) -> bool {
        self.voter_id == voter_id && self.election_id == election_id
    }

    /// Serialise into a signed cookie.
    pub fn into_cookie(self, config: &Config) -> Cookie<'static> {
        into_signed_cookie(VERIFICATION_COOKIE, self, config.verification_ttl(), config)
    }

    /// Deserialise from a signed cookie.
    pub fn from_cookie(cookie: &Cookie<'_>, config: &Config) -> Result<Self, Error> {
        from_signed_cookie(cookie, config)
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for VerificationProof {
    type Error = Error;

    /// Forward (rather than fail) when absent, expired, or invalid, so
    /// handlers can take an `Option<VerificationProof>` and leave the
    /// decision to the ballot validator.
    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        // Unwrap is safe as `Config` is always managed.
        let config = req.guard::<&State<Config>>().await.unwrap();
        let cookie = try_outcome!(req.cookies().get(VERIFICATION_COOKIE).or_forward(()));
        match Self::from_cookie(cookie, config) {
            Ok(proof) => Outcome::Success(proof),
            Err(_) => Outcome::Forward(()),
        }
    }
}

/// Cookie claims: the token itself plus an expiry datetime.
#[derive(Serialize, Deserialize)]
struct Claims<T> {
    #[serde(flatten, bound = "T: Serialize + DeserializeOwned")]
    token: T,
    #[serde(rename = "exp", with = "ts_seconds")]
    expire_at: DateTime<Utc>,
}

fn into_signed_cookie<T: Serialize + DeserializeOwned>(
    name: &'static str,
    token: T,
    ttl: chrono::Duration,
    config: &Config,
) -> Cookie<'static> {
    let claims = Claims {
        token,
        expire_at: Utc::now() + ttl,
    };

    let jwt = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret()),
    )
    .expect("JWT encoding is infallible with default settings");

    Cookie::build(name, jwt)
        .max_age(CookieDuration::seconds(ttl.num_seconds()))
        .http_only(true)
        .same_site(SameSite::Strict)
        .finish()
}

fn from_signed_cookie<T: Serialize + DeserializeOwned>(
    cookie: &Cookie<'_>,
    config: &Config,
) -> Result<T, Error> {
    let token = jsonwebtoken::decode(
        cookie.value(),
        &DecodingKey::from_secret(config.jwt_secret()),
        &Validation::default(),
    )
    .map(|claims: TokenData<Claims<T>>| claims.claims.token)?;
    Ok(token)
}
