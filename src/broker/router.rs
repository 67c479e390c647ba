//! Identity provider to surface routing.

use broker_core::{IdentityProvider, Surface};
use tracing::debug;

use super::AuthError;

/// Enforces which identity provider may reach which surface.
///
/// The mapping is fixed: the admin surface only admits `admin-idp`
/// principals and the member surface only admits `member-idp` principals.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProviderRouter;

impl IdentityProviderRouter {
    /// Create the router.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Fail with [`AuthError::ProviderMismatch`] unless `provider` serves `surface`.
    pub fn check(self, provider: IdentityProvider, surface: Surface) -> Result<(), AuthError> {
        if surface.required_provider() == provider {
            return Ok(());
        }
        debug!(provider = %provider, surface = %surface, "Provider routed to wrong surface");
        Err(AuthError::ProviderMismatch { provider, surface })
    }
}
