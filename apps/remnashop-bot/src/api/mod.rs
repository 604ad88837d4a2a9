pub mod client;

pub use client::{ApiError, RemnawaveClient, RemoteUser};
