pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod directory;
pub mod error;
pub mod locks;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod scheduling;
pub mod store;
