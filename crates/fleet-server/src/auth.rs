use axum::extract::{FromRef, FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{HostConfig, OperatorConfig};
use crate::error::ApiError;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
}

impl Role {
    pub fn can_dispatch(self) -> bool {
        matches!(self, Role::Admin | Role::Operator)
    }
}

/// Known agent keys and operator tokens.
#[derive(Debug, Default)]
pub struct Credentials {
    agents: HashMap<String, String>,
    operators: HashMap<String, Operator>,
}

impl Credentials {
    pub fn new(hosts: &[HostConfig], operators: &[OperatorConfig]) -> Self {
        Self {
            agents: hosts
                .iter()
                .map(|host| (host.api_key.clone(), host.id.clone()))
                .collect(),
            operators: operators
                .iter()
                .map(|operator| {
                    (
                        operator.token.clone(),
                        Operator {
                            name: operator.name.clone(),
                            role: operator.role,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn knows_host(&self, host_id: &str) -> bool {
        self.agents.values().any(|known| known == host_id)
    }

    fn host_for_key(&self, key: &str) -> Option<&str> {
        self.agents.get(key).map(String::as_str)
    }

    fn operator_for_token(&self, token: &str) -> Option<&Operator> {
        self.operators.get(token)
    }
}

/// The host an agent request speaks for, derived from its API key only.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub host_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub name: String,
    pub role: Role,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AgentIdentity
where
    Arc<Credentials>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let credentials = Arc::<Credentials>::from_ref(state);
        let key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthenticated)?;
        let host_id = credentials
            .host_for_key(key)
            .ok_or(ApiError::Unauthenticated)?;
        Ok(AgentIdentity {
            host_id: host_id.to_string(),
        })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for Operator
where
    Arc<Credentials>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let credentials = Arc::<Credentials>::from_ref(state);
        let bearer = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string);
        // Browsers cannot set headers on a WebSocket upgrade.
        let token = match bearer {
            Some(token) => token,
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(query)| query.token)
                .ok_or(ApiError::Unauthenticated)?,
        };
        credentials
            .operator_for_token(token.trim())
            .cloned()
            .ok_or(ApiError::Unauthenticated)
    }
}

impl Operator {
    pub fn require_dispatch(&self) -> Result<(), ApiError> {
        if self.role.can_dispatch() {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "{} may not issue commands",
                self.name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn credentials() -> Arc<Credentials> {
        Arc::new(Credentials::new(
            &[HostConfig {
                id: "h1".to_string(),
                name: None,
                api_key: "h1-key-0123456789".to_string(),
            }],
            &[OperatorConfig {
                name: "carol".to_string(),
                token: "carol-token-0123456789".to_string(),
                role: Role::Viewer,
            }],
        ))
    }

    #[tokio::test]
    async fn agent_key_maps_to_host() {
        let state = credentials();
        let (mut parts, _) = Request::builder()
            .header(API_KEY_HEADER, "h1-key-0123456789")
            .body(())
            .expect("request")
            .into_parts();
        let agent = AgentIdentity::from_request_parts(&mut parts, &state)
            .await
            .expect("identity");
        assert_eq!(agent.host_id, "h1");

        let (mut parts, _) = Request::builder()
            .header(API_KEY_HEADER, "nope")
            .body(())
            .expect("request")
            .into_parts();
        assert!(AgentIdentity::from_request_parts(&mut parts, &state)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn operator_token_from_query() {
        let state = credentials();
        let (mut parts, _) = Request::builder()
            .uri("/api/commands/1/stream?token=carol-token-0123456789")
            .body(())
            .expect("request")
            .into_parts();
        let operator = Operator::from_request_parts(&mut parts, &state)
            .await
            .expect("operator");
        assert_eq!(operator.role, Role::Viewer);
        assert!(operator.require_dispatch().is_err());
        assert!(state.knows_host("h1"));
        assert!(!state.knows_host("h2"));
    }
}
