//! et-cloud: Google Cloud collaborators for ephemeral-tunnel
//!
//! [`OsLoginDirectory`] registers and removes SSH keys through the OS Login
//! API; [`ComputeResolver`] looks up an instance's external address through
//! the Compute Engine API. Both authenticate with a bearer token from a
//! [`TokenSource`]: the tunnel's explicit token, or one minted from its
//! service account key.

mod auth;
mod compute;
mod http;
mod oslogin;

pub use auth::{ServiceAccountKey, TokenSource, DEFAULT_TOKEN_URI, TOKEN_SCOPE};
pub use compute::{ComputeResolver, COMPUTE_BASE_URL};
pub use oslogin::{OsLoginDirectory, OSLOGIN_BASE_URL, TOKENINFO_URL};
