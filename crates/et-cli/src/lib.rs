//! ephemeral-tunnel: command-line front end
//!
//! Argument parsing and configuration merging live here so they can be
//! tested without spawning the binary.

pub mod args;
pub mod output;
