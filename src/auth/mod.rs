// Authentication module - bearer verification, provisioning, session cookies

pub mod extractors;
pub mod handlers;
pub mod models;
pub mod routes;

#[cfg(test)]
mod tests;

pub use extractors::{AuthedUser, OptionalAuthedUser};
pub use routes::auth_routes;
