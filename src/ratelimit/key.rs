//! Limiter key generation and handling.

use serde::{Deserialize, Serialize};

/// A key that uniquely identifies one caller's state on one route.
///
/// The route key names the configured limit, the client key buckets
/// individual callers (an IP address, a user id, an e-mail address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LimiterKey {
    /// The route this state belongs to
    pub route: String,
    /// The caller within the route
    pub client: String,
}

impl LimiterKey {
    /// Create a new limiter key from a route and a client key.
    pub fn new(route: &str, client: &str) -> Self {
        Self {
            route: route.to_string(),
            client: client.to_string(),
        }
    }

    /// Convert the key to a string representation.
    ///
    /// This is useful for logging and debugging.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.route, self.client)
    }
}

impl std::fmt::Display for LimiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
