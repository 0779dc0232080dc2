pub mod config;
pub mod contacts;
pub mod csv;
pub mod db;
pub mod enrich;
pub mod export;
pub mod fetch;
pub mod http;
pub mod listing;
pub mod parser;
