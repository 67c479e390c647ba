//! Audit logging for authorization decisions and record changes.
//!
//! Every event is emitted via `tracing::info!` with the serialized event in
//! an `audit` field, so the trail can be extracted by any log aggregator.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `auth.granted` | A request was authorized for a surface |
//! | `auth.denied` | Decoding, verification, routing or resolution failed |
//! | `record.provisioned` | A record was auto-provisioned on first sign-in |
//! | `record.updated` | An administrator changed a record's roles or status |
//! | `token.delegated` | An on-behalf-of exchange succeeded |
//! | `token.delegation_failed` | An on-behalf-of exchange failed |
//!
//! Raw tokens and client secrets never appear in an event.

use broker_core::{IdentityProvider, Principal, Surface};
use serde::Serialize;

use super::AuthError;
use super::directory::AuthorizationRecord;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"auth.granted"`).
    pub event: &'static str,
    /// Surface the request targeted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub surface: Option<Surface>,
    /// Provider that authenticated the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<IdentityProvider>,
    /// Provider subject id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Email of the affected user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Effective or granted roles.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    /// Admin flag of the decision.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_admin: Option<bool>,
    /// Email of the administrator who made a change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Requested downstream scopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    /// Error code (`snake_case` [`AuthError`] kind or `suspended`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
    /// Human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            surface: None,
            provider: None,
            subject: None,
            email: None,
            roles: None,
            is_admin: None,
            actor: None,
            scopes: None,
            error: None,
            reason: None,
        }
    }

    fn with_principal(mut self, principal: &Principal) -> Self {
        self.provider = Some(principal.issuing_provider);
        self.subject = Some(principal.subject_id.clone());
        self.email = Some(principal.email.clone());
        self
    }

    /// Construct an `auth.granted` event.
    #[must_use]
    pub fn granted<'a>(
        surface: Surface,
        principal: &Principal,
        roles: impl IntoIterator<Item = &'a String>,
        is_admin: bool,
    ) -> Self {
        let mut event = Self::new("auth.granted").with_principal(principal);
        event.surface = Some(surface);
        event.roles = Some(roles.into_iter().cloned().collect());
        event.is_admin = Some(is_admin);
        event
    }

    /// Construct an `auth.denied` event for an [`AuthError`].
    #[must_use]
    pub fn denied(surface: Surface, principal: Option<&Principal>, err: &AuthError) -> Self {
        Self::denied_with(surface, principal, err.kind().as_str(), err.to_string())
    }

    /// Construct an `auth.denied` event with an explicit code.
    #[must_use]
    pub fn denied_with(
        surface: Surface,
        principal: Option<&Principal>,
        error: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        let mut event = Self::new("auth.denied");
        if let Some(principal) = principal {
            event = event.with_principal(principal);
        }
        event.surface = Some(surface);
        event.error = Some(error);
        event.reason = Some(reason.into());
        event
    }

    /// Construct a `record.provisioned` event.
    #[must_use]
    pub fn provisioned(record: &AuthorizationRecord) -> Self {
        let mut event = Self::new("record.provisioned");
        event.email = Some(record.email.clone());
        event.roles = Some(record.roles.iter().cloned().collect());
        event
    }

    /// Construct a `record.updated` event.
    #[must_use]
    pub fn record_updated(record: &AuthorizationRecord, actor: &str, change: impl Into<String>) -> Self {
        let mut event = Self::new("record.updated");
        event.email = Some(record.email.clone());
        event.roles = Some(record.roles.iter().cloned().collect());
        event.actor = Some(actor.to_string());
        event.reason = Some(change.into());
        event
    }

    /// Construct a `token.delegated` event.
    #[must_use]
    pub fn delegated(principal: &Principal, scopes: &[String]) -> Self {
        let mut event = Self::new("token.delegated").with_principal(principal);
        event.scopes = Some(scopes.to_vec());
        event
    }

    /// Construct a `token.delegation_failed` event.
    #[must_use]
    pub fn delegation_failed(principal: &Principal, scopes: &[String], err: &AuthError) -> Self {
        let mut event = Self::new("token.delegation_failed").with_principal(principal);
        event.scopes = Some(scopes.to_vec());
        event.error = Some(err.kind().as_str());
        event.reason = Some(err.to_string());
        event
    }
}

/// Emit an audit event via `tracing::info!`.
///
/// ```text
/// INFO auth_broker::broker::audit audit={"event":"auth.granted",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "broker audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing;
    use broker_core::RecordStatus;

    #[test]
    fn granted_event_carries_decision() {
        // GIVEN: a resolved principal
        let principal = testing::principal(IdentityProvider::AdminIdp, "ops@corp.example.com");
        let roles = vec!["admin".to_string(), "authenticated".to_string()];

        // WHEN: build granted event
        let event = AuditEvent::granted(Surface::Admin, &principal, &roles, true);

        // THEN: surface, provider and decision are populated
        assert_eq!(event.event, "auth.granted");
        assert_eq!(event.surface, Some(Surface::Admin));
        assert_eq!(event.provider, Some(IdentityProvider::AdminIdp));
        assert_eq!(event.is_admin, Some(true));
        assert!(event.error.is_none());
    }

    #[test]
    fn denied_event_uses_error_kind() {
        let event = AuditEvent::denied(Surface::Member, None, &AuthError::TokenExpired);

        assert_eq!(event.event, "auth.denied");
        assert_eq!(event.error, Some("token_expired"));
        assert!(event.email.is_none());
    }

    #[test]
    fn record_events_name_actor_and_change() {
        let record = AuthorizationRecord::new(
            "user@corp.example.com",
            ["authenticated".to_string()],
            RecordStatus::Active,
        );

        let event = AuditEvent::record_updated(&record, "ops@corp.example.com", "suspended");

        assert_eq!(event.event, "record.updated");
        assert_eq!(event.actor.as_deref(), Some("ops@corp.example.com"));
        assert_eq!(event.reason.as_deref(), Some("suspended"));
        assert_eq!(AuditEvent::provisioned(&record).event, "record.provisioned");
    }

    #[test]
    fn delegation_events_serialize_without_tokens() {
        let principal = testing::principal(IdentityProvider::MemberIdp, "ana@example.org");
        let scopes = vec!["api://downstream/.default".to_string()];
        let events = [
            AuditEvent::delegated(&principal, &scopes),
            AuditEvent::delegation_failed(
                &principal,
                &scopes,
                &AuthError::ConsentRequired("AADSTS65001".to_string()),
            ),
        ];

        for event in events {
            let json = serde_json::to_string(&event).unwrap();
            assert!(json.contains("\"provider\":\"member-idp\""), "{json}");
            assert!(!json.contains("access_token"));
        }
    }
}
