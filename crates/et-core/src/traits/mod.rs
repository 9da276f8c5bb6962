//! Collaborator traits
//!
//! The tunnel engine talks to the outside world only through these traits,
//! so sessions can run against cloud services or in-process stubs.

mod directory;
mod resolver;

pub use directory::DirectoryService;
pub use resolver::{AddressResolver, StaticResolver};
