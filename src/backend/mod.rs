pub mod auth;
pub mod client;
pub mod credentials;

pub use auth::{AuthClient, LoginOutcome, RegisterRequest, Session, UserProfile};
pub use client::ApiClient;
pub use credentials::{CredentialProvider, LocalStore, StoredCredentials};
