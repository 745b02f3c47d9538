pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod engine;
pub mod infra;
pub mod search;
