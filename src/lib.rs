pub mod clients;
pub mod config;
pub mod models;
pub mod templates;
pub mod utils;
pub mod workers;
