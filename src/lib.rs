// Library exports for Mural
// This allows integration tests and the binary to share one router

pub mod auth;
pub mod backend;
pub mod config;
pub mod db;
pub mod error;
pub mod extractors;
pub mod feed;
pub mod profile;
pub mod routes;
pub mod state;
