//! Auth broker core types.
//!
//! Dependency-light primitives shared by every broker subsystem: the
//! [`IdentityProvider`] and [`Surface`] enums used for provider routing, the
//! per-request [`Principal`], and the Directory Store [`RecordStatus`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role that marks a principal as an administrator.
pub const ADMIN_ROLE: &str = "admin";

/// Role held by every signed-in principal.
pub const AUTHENTICATED_ROLE: &str = "authenticated";

/// Error returned when a string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Identity provider that authenticated a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityProvider {
    /// Organizational directory used by administrators.
    AdminIdp,
    /// External consumer-identity tenant used by members.
    MemberIdp,
}

impl IdentityProvider {
    /// Every configured provider, in routing order.
    pub const ALL: [Self; 2] = [Self::AdminIdp, Self::MemberIdp];

    /// Canonical wire name (`admin-idp` / `member-idp`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AdminIdp => "admin-idp",
            Self::MemberIdp => "member-idp",
        }
    }
}

impl fmt::Display for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentityProvider {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin-idp" => Ok(Self::AdminIdp),
            "member-idp" => Ok(Self::MemberIdp),
            other => Err(UnknownVariant {
                kind: "identity provider",
                value: other.to_string(),
            }),
        }
    }
}

/// Area of the application a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    /// Administrative endpoints.
    Admin,
    /// General-member endpoints.
    Member,
}

impl Surface {
    /// The only provider allowed to authenticate requests for this surface.
    #[must_use]
    pub const fn required_provider(self) -> IdentityProvider {
        match self {
            Self::Admin => IdentityProvider::AdminIdp,
            Self::Member => IdentityProvider::MemberIdp,
        }
    }

    /// Lowercase name used in logs and audit events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Member => "member",
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a [`Principal`] can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Parsed from the reverse proxy's assertion header; trusted only because
    /// the proxy sits on a trusted network boundary.
    Asserted,
    /// Extracted from a bearer JWT whose signature and claims were verified.
    Verified,
}

/// The caller of a single request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    /// Provider-unique subject identifier.
    pub subject_id: String,
    /// Lowercase email, the Directory Store join key.
    pub email: String,
    /// Provider that authenticated the caller.
    pub issuing_provider: IdentityProvider,
    /// Roles asserted by the identity provider itself.
    pub provider_roles: BTreeSet<String>,
    /// Display handle, when the provider supplies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Tenant identifier (`tid`) for token-derived principals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Whether the principal was cryptographically verified.
    pub trust: TrustLevel,
}

impl Principal {
    /// `true` only for principals extracted from a verified bearer token.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.trust == TrustLevel::Verified
    }

    /// Domain part of the email (everything after the last `@`).
    #[must_use]
    pub fn email_domain(&self) -> &str {
        self.email.rsplit_once('@').map_or("", |(_, domain)| domain)
    }
}

/// Lifecycle state of a Directory Store authorization record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Roles on the record apply.
    #[default]
    Active,
    /// The user is denied everything, whatever else is claimed.
    Suspended,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Suspended => f.write_str("suspended"),
        }
    }
}

/// Trim and lowercase an email address.
///
/// Returns `None` unless the result has a non-empty local part and a
/// non-empty domain separated by `@`.
#[must_use]
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    let (local, domain) = email.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() || email.chars().any(char::is_whitespace) {
        return None;
    }
    Some(email)
}
