//! Caller identity taken from request headers.

use std::convert::Infallible;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use engine::Actor;

pub const ACTOR_HEADER: &str = "x-actor-id";
/// Comma-separated role list.
pub const ROLES_HEADER: &str = "x-actor-roles";

/// The authenticated caller. Authentication itself happens upstream; requests
/// without headers act as `anonymous` with no roles.
#[derive(Debug, Clone)]
pub struct RequestActor(pub Actor);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestActor {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header(parts, ACTOR_HEADER).map(str::trim).filter(|id| !id.is_empty()).unwrap_or("anonymous");
        let roles: Vec<&str> = header(parts, ROLES_HEADER)
            .map(|raw| raw.split(',').map(str::trim).filter(|r| !r.is_empty()).collect())
            .unwrap_or_default();
        Ok(Self(Actor::new(id, &roles)))
    }
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}
