use chrono::Duration;
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::face::{FaceMatcher, HttpEmbedder};
use crate::model::mongodb::ensure_indexes_exist;

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Deserialize)]
pub struct Config {
    // non-secrets
    #[serde(default = "defaults::auth_ttl")]
    auth_ttl: u32,
    #[serde(default = "defaults::verification_ttl")]
    verification_ttl: u32,
    #[serde(default = "defaults::max_capture_attempts")]
    max_capture_attempts: u32,
    // secrets
    jwt_secret: String,
}

impl Config {
    /// Valid lifetime of voter identity tokens in seconds.
    pub fn auth_ttl(&self) -> Duration {
        Duration::seconds(self.auth_ttl.into())
    }

    /// Valid lifetime of a `Verified` outcome in seconds. Once expired,
    /// the voter must verify again for the same election.
    pub fn verification_ttl(&self) -> Duration {
        Duration::seconds(self.verification_ttl.into())
    }

    /// Capture attempts allowed per verification session.
    pub fn max_capture_attempts(&self) -> u32 {
        self.max_capture_attempts
    }

    /// Secret key used to sign JWTs, shared with the identity subsystem.
    pub fn jwt_secret(&self) -> &[u8] {
        self.jwt_secret.as_bytes()
    }
}

mod defaults {
    pub fn auth_ttl() -> u32 {
        3600
    }

    pub fn verification_ttl() -> u32 {
        300
    }

    pub fn max_capture_attempts() -> u32 {
        crate::session::DEFAULT_MAX_ATTEMPTS
    }

    pub fn match_threshold() -> f64 {
        0.6
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
}

/// A fairing that loads the MongoDB config, connects to the database,
/// performs any setup necessary, and places both a `Client` and a `Database`
/// into managed state.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");
        // Construct the connection.
        let client = match MongoClient::with_uri_str(config.db_uri).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        let db = client.database(&get_database_name());

        // Ensure the required indexes exist; the ledger's correctness
        // depends on them.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to connect to database: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        // Manage the state.
        rocket = rocket.manage(client).manage(db);
        Ok(rocket)
    }
}

/// Get the name of the database to use (production version).
#[cfg(not(test))]
fn get_database_name() -> String {
    "univote".to_string()
}

/// Get the name of the database to use (test version).
/// Use a random name to avoid collisions between tests.
#[cfg(test)]
pub(crate) fn get_database_name() -> String {
    let random: u32 = rand::random();
    let db = format!("test{random}");
    info!("Using database {db}");
    db
}

/// Configuration for the face matcher.
#[derive(Deserialize)]
struct MatcherConfig {
    // non-secrets
    embedder_url: String,
    #[serde(default = "defaults::match_threshold")]
    match_threshold: f64,
}

/// A fairing that loads the matcher config and places a [`FaceMatcher`]
/// backed by the external embedding service into managed state.
pub struct MatcherFairing;

#[rocket::async_trait]
impl Fairing for MatcherFairing {
    fn info(&self) -> Info {
        Info {
            name: "Face matcher",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<MatcherConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load face matcher config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let matcher = FaceMatcher::new(
            HttpEmbedder::new(config.embedder_url),
            config.match_threshold,
        );
        info!("Loaded face matcher config");

        // Manage the state.
        rocket = rocket.manage(matcher);
        Ok(rocket)
    }
}
