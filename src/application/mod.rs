//! Collaborator contracts and shared application types.

pub mod error;
pub mod pagination;
pub mod repos;
