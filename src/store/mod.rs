//! Durable storage of the four entity kinds, with transparent secret-field
//! encode/decode hooks on write/read.

pub mod models;
pub mod repository;

pub use models::*;
pub use repository::Store;
