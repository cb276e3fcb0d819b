//! Router construction.

pub mod routes;

pub use routes::routes;
