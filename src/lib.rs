//! Collaborative editing backend.
//!
//! The sync side keeps one authoritative copy of every buffer in a
//! workspace and reconciles editors' patches against it
//! ([`buffer`], [`room`]). The placement side keeps each workspace
//! replicated across a fleet of storage nodes ([`placement`], [`node`]).

pub mod agent;
pub mod buffer;
pub mod cli;
pub mod config;
pub mod fingerprint;
pub mod node;
pub mod patch;
pub mod placement;
pub mod room;
pub mod storage;

/// Workspace ID. A workspace is served by one [`room::Room`] and stored as
/// one unit on a node.
pub type WorkspaceId = u64;
