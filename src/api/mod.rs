use rocket::Route;

mod common;
mod verification;
mod voting;

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(verification::routes());
    routes.extend(voting::routes());
    routes
}
