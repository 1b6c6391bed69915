// Scans module - the metered action surface (quota gate + usage ledger)

pub mod handlers;
pub mod models;
pub mod routes;


pub use routes::scans_routes;
