pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod handler;
pub mod server;
pub mod store;

pub use auth::{AuthenticationOutcome, CredentialStore};
pub use client::ThlClient;
pub use config::Config;
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use server::{DistributionServer, ServerLifecycleState, ShutdownReport};
pub use store::{LogStore, MemoryLogStore};
