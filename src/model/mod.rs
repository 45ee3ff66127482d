pub mod auth;
pub mod ballot;
pub mod candidate_totals;
pub mod descriptor;
pub mod election;
pub mod mongodb;
pub mod register;
pub mod verification;
pub mod voter;
