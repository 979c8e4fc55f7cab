//! Process-wide HTTP clients
//!
//! Every adapter and transfer shares the same connection pools. The API
//! client bounds whole requests; the transfer client only bounds connection
//! setup because product bodies can take hours, and it never follows
//! redirects on its own so the engine can count hops and re-attach
//! credentials.

use once_cell::sync::Lazy;
use reqwest::{redirect, Client};
use std::sync::Arc;
use std::time::Duration;

/// HTTP connect timeout (seconds) - time to establish TCP connection
const HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;
/// API request timeout (seconds) - overall time for a search or token call
const API_REQUEST_TIMEOUT_SECS: u64 = 60;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Global client for catalogue, token and metadata requests
pub static GLOBAL_API_CLIENT: Lazy<Arc<Client>> = Lazy::new(|| {
    Arc::new(
        Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(API_REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| Client::new()),
    )
});

/// Global client for product transfers
pub static GLOBAL_TRANSFER_CLIENT: Lazy<Arc<Client>> = Lazy::new(|| Arc::new(transfer_client()));

/// Build a client configured like the transfer singleton
pub fn transfer_client() -> Client {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
        .redirect(redirect::Policy::none())
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Get the global API client
pub fn global_api_client() -> Arc<Client> {
    GLOBAL_API_CLIENT.clone()
}

/// Get the global transfer client
pub fn global_transfer_client() -> Arc<Client> {
    GLOBAL_TRANSFER_CLIENT.clone()
}
