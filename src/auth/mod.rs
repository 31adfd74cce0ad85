use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};

use crate::shared::error::ApiError;

/// Closed role set. Parsing normalizes whatever casing the gateway sends
/// ("Manager", "MANAGER", " manager ") into one of these three values; the
/// rest of the crate only ever compares enum variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Employee,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Role> {
        match raw.trim().to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "employee" => Some(Role::Employee),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Employee => "employee",
        }
    }

    /// Capitalized form for user-facing notification text.
    pub fn display(&self) -> &'static str {
        match self {
            Role::Admin => "Admin",
            Role::Manager => "Manager",
            Role::Employee => "Employee",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller identity, trusted from the `x-user-*` headers set by the
/// authenticating gateway in front of this service.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub name: String,
    pub email: String,
    pub role: Role,
}

fn header_value(parts: &Parts, key: &str) -> Option<String> {
    parts
        .headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let name = header_value(parts, "x-user-name")
            .ok_or_else(|| ApiError::Unauthorized("missing x-user-name header".to_string()))?;
        let email = header_value(parts, "x-user-email")
            .ok_or_else(|| ApiError::Unauthorized("missing x-user-email header".to_string()))?;
        let raw_role = header_value(parts, "x-user-role")
            .ok_or_else(|| ApiError::Unauthorized("missing x-user-role header".to_string()))?;
        let role = Role::parse(&raw_role)
            .ok_or_else(|| ApiError::Forbidden(format!("unknown role: {}", raw_role)))?;
        Ok(AuthUser { name, email, role })
    }
}

/// Per-endpoint role gate. Handlers call this before touching the pool so
/// a disallowed caller is rejected without a database round trip.
pub fn require_role(user: &AuthUser, allowed: &[Role]) -> Result<(), ApiError> {
    if allowed.contains(&user.role) {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!(
            "role {} may not perform this operation",
            user.role
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_normalizes_case_and_whitespace() {
        assert_eq!(Role::parse("Manager"), Some(Role::Manager));
        assert_eq!(Role::parse("  ADMIN "), Some(Role::Admin));
        assert_eq!(Role::parse("employee"), Some(Role::Employee));
        assert_eq!(Role::parse("supervisor"), None);
        assert_eq!(Role::parse(""), None);
    }

    #[test]
    fn require_role_rejects_outsiders() {
        let user = AuthUser {
            name: "Dana".to_string(),
            email: "dana@example.com".to_string(),
            role: Role::Employee,
        };
        assert!(require_role(&user, &[Role::Admin, Role::Manager]).is_err());
        assert!(require_role(&user, &[Role::Employee]).is_ok());
    }
}
