// ABOUTME: Configuration crate root for edgenode
// ABOUTME: Re-exports the environment variable name constants shared by every edgenode package

pub mod constants;

pub use constants::*;
