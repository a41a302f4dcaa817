use axum::http::HeaderMap;
use uuid::Uuid;

use crate::error::AppError;

pub const ROLE_MEMBER: &str = "member";
pub const ROLE_SUPERVISOR: &str = "supervisor";
pub const ROLE_ADMIN: &str = "admin";

/// Caller identity from trusted headers set by the authenticating edge
/// proxy. Credential mechanics (tokens, password storage) live upstream of
/// this service; by the time a request reaches us the headers are verified.
#[derive(Debug, Clone)]
pub struct Identity {
    /// None for anonymous callers
    pub user_id: Option<Uuid>,
    pub role: String,
}

impl Identity {
    pub fn is_supervisor(&self) -> bool {
        self.role == ROLE_SUPERVISOR || self.role == ROLE_ADMIN
    }

    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }

    pub fn require_supervisor(&self, operation: &str) -> Result<(), AppError> {
        if self.is_supervisor() {
            return Ok(());
        }
        Err(AppError::Forbidden {
            message: format!("Operation '{operation}' requires the supervisor or admin role"),
            docs_hint: Some("Supervisory operations are limited to staff identities.".to_string()),
        })
    }

    pub fn require_admin(&self, operation: &str) -> Result<(), AppError> {
        if self.is_admin() {
            return Ok(());
        }
        Err(AppError::Forbidden {
            message: format!("Operation '{operation}' requires the admin role"),
            docs_hint: None,
        })
    }
}

/// Extract identity from `x-user-id` (optional UUID) and `x-user-role`
/// (defaults to "member").
pub fn extract_identity(headers: &HeaderMap) -> Result<Identity, AppError> {
    let user_id = match headers.get("x-user-id") {
        None => None,
        Some(value) => {
            let raw = value.to_str().map_err(|_| AppError::Validation {
                message: "x-user-id must be a valid UTF-8 string".to_string(),
                field: Some("headers.x-user-id".to_string()),
                received: None,
                docs_hint: None,
            })?;
            Some(Uuid::parse_str(raw).map_err(|_| AppError::Validation {
                message: "x-user-id must be a valid UUID".to_string(),
                field: Some("headers.x-user-id".to_string()),
                received: Some(serde_json::Value::String(raw.to_string())),
                docs_hint: Some("Omit the header entirely for anonymous sessions.".to_string()),
            })?)
        }
    };

    let role = match headers.get("x-user-role") {
        None => ROLE_MEMBER.to_string(),
        Some(value) => {
            let raw = value.to_str().map_err(|_| AppError::Validation {
                message: "x-user-role must be a valid UTF-8 string".to_string(),
                field: Some("headers.x-user-role".to_string()),
                received: None,
                docs_hint: None,
            })?;
            match raw {
                ROLE_MEMBER | ROLE_SUPERVISOR | ROLE_ADMIN => raw.to_string(),
                other => {
                    return Err(AppError::Validation {
                        message: format!("Unknown role '{other}'"),
                        field: Some("headers.x-user-role".to_string()),
                        received: Some(serde_json::Value::String(other.to_string())),
                        docs_hint: Some("Valid roles: member, supervisor, admin.".to_string()),
                    });
                }
            }
        }
    };

    Ok(Identity { user_id, role })
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};
    use uuid::Uuid;

    use super::{ROLE_MEMBER, extract_identity};

    #[test]
    fn missing_headers_yield_anonymous_member() {
        let identity = extract_identity(&HeaderMap::new()).unwrap();
        assert!(identity.user_id.is_none());
        assert_eq!(identity.role, ROLE_MEMBER);
        assert!(!identity.is_supervisor());
    }

    #[test]
    fn valid_headers_parse() {
        let user_id = Uuid::now_v7();
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_str(&user_id.to_string()).unwrap());
        headers.insert("x-user-role", HeaderValue::from_static("supervisor"));

        let identity = extract_identity(&headers).unwrap();
        assert_eq!(identity.user_id, Some(user_id));
        assert!(identity.is_supervisor());
        assert!(!identity.is_admin());
    }

    #[test]
    fn invalid_uuid_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("not-a-uuid"));
        assert!(extract_identity(&headers).is_err());
    }

    #[test]
    fn unknown_role_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-role", HeaderValue::from_static("superuser"));
        assert!(extract_identity(&headers).is_err());
    }

    #[test]
    fn admin_satisfies_supervisor_checks() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-role", HeaderValue::from_static("admin"));
        let identity = extract_identity(&headers).unwrap();
        assert!(identity.require_supervisor("list sessions").is_ok());
        assert!(identity.require_admin("end any session").is_ok());
    }
}
