pub mod auth;
pub mod domain;
pub mod error;
pub mod protocol;
pub mod timestamp;
