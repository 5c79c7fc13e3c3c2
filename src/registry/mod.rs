//! Registry transport: authentication and the v2 HTTP client

pub mod auth;
pub mod client;

pub use auth::{AuthChallenge, AuthHeader, RegistryAuthenticator};
pub use client::{BlobMount, RegistryClient, RegistryClientBuilder};
