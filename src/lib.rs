#[macro_use]
extern crate rocket;

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use rocket::{Build, Rocket};

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod face;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod session;
pub mod validate;

use config::{ConfigFairing, DatabaseFairing, MatcherFairing};
use events::VoteNotifier;
use logging::LoggerFairing;

/// Construct the full server, ready to launch.
pub async fn build() -> Rocket<Build> {
    base_rocket().attach(DatabaseFairing).attach(MatcherFairing)
}

/// Everything except the database connection and the face matcher, which
/// tests provide themselves.
fn base_rocket() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(ConfigFairing)
        .attach(LoggerFairing)
        .manage(VoteNotifier::new())
}

/// Get a database connection for tests, using the configured `db_uri`.
#[cfg(test)]
pub(crate) async fn db_client() -> mongodb::Client {
    let db_uri = rocket::Config::figment()
        .extract_inner::<String>("db_uri")
        .expect("`db_uri` not set");
    mongodb::Client::with_uri_str(&db_uri)
        .await
        .expect("Could not connect to database")
}

/// Get a fresh database name for tests.
#[cfg(test)]
pub(crate) fn database() -> String {
    config::get_database_name()
}

/// Construct a server against the given database connection. Instead of
/// the production HTTP-backed face matcher, the managed matcher decodes
/// the "detected" faces straight out of the frame bytes, so tests script
/// the embedder per frame via [`face::stub::frame_of`].
#[cfg(test)]
pub(crate) async fn rocket_for_db(client: mongodb::Client, db_name: &str) -> Rocket<Build> {
    let db = client.database(db_name);
    model::mongodb::ensure_indexes_exist(&db)
        .await
        .expect("Failed to create indexes");
    let matcher = face::FaceMatcher::new(face::stub::EchoEmbedder, 0.6);
    base_rocket().manage(client).manage(db).manage(matcher)
}
