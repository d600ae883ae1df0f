//! Everything that talks to the X platform: wire types, the API client
//! boundary, OAuth plumbing, and the per-user token lifecycle.

pub mod client;
pub mod connection;
pub mod oauth;
pub mod types;

pub use client::{HttpXApi, XApi};
pub use connection::{AccessGrant, TokenManager};
pub use oauth::{AppOAuthCredentials, ClientAuthStrategy};
