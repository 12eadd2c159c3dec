//! Core primitives shared by every pipeline stage.
//!
//! Storage conventions (versioned entities, aliases, identities), integrity
//! helpers (canonical hashing, signatures, atomic writes) and the typed
//! artifact states live here. Command surfaces live in [`crate::plugins`].

pub mod alias;
pub mod artifact;
pub mod audit;
pub mod config;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod layout;
pub mod output;
pub mod registry;
pub mod scan;
pub mod signing;
pub mod time;
pub mod tokens;
pub mod versioned;
