//! Optional identity verification for incoming connections.

/// Maps a connection token (from the WebSocket URL query) to a user id.
/// `None` means anonymous; the router then mints a fresh user id.
pub trait IdentityVerifier: Send + Sync {
    fn verify(&self, token: Option<&str>) -> Option<String>;
}

/// Default verifier: everyone is anonymous.
#[derive(Debug, Default)]
pub struct NoAuth;

impl IdentityVerifier for NoAuth {
    fn verify(&self, _token: Option<&str>) -> Option<String> {
        None
    }
}
