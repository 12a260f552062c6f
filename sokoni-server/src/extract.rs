//! Request extractors.
//!
//! Authentication itself lives upstream: the gateway validates the JWT and
//! forwards the identity as `x-user-id` / `x-user-role` headers. The engine
//! still makes every authorization decision (buyer / seller / admin) per
//! operation.

use axum::extract::FromRequestParts;
use http::header::HeaderMap;
use http::request::Parts;
use sokoni_api::error::ApiError;
use sokoni_api::types::{Actor, Role};
use sokoni_common::ids::UserId;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// The authenticated requester, extracted from the gateway headers.
#[derive(Clone, Debug)]
pub struct AuthActor(pub Actor);

impl<S: Send + Sync> FromRequestParts<S> for AuthActor {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers).map(AuthActor)
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::authentication("missing identity"))?;
    let user_id: UserId = user_id
        .parse()
        .map_err(|_| ApiError::authentication("unusable identity"))?;

    let role = match headers
        .get(USER_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        None => Role::User,
        Some(raw) => raw
            .parse()
            .map_err(|_| ApiError::authentication("unusable role"))?,
    };

    // First hop of the forwarded chain, for the audit log.
    let ip = headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned());

    Ok(Actor { user_id, role, ip })
}

#[cfg(test)]
mod test {
    use http::HeaderValue;

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn extracts_user_and_role() {
        let actor = actor_from_headers(&headers(&[
            ("x-user-id", "7"),
            ("x-user-role", "admin"),
            ("x-forwarded-for", "203.0.113.9, 10.0.0.1"),
        ]))
        .unwrap();
        assert_eq!(actor.user_id, UserId(7));
        assert_eq!(actor.role, Role::Admin);
        assert_eq!(actor.ip.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn role_defaults_to_user() {
        let actor =
            actor_from_headers(&headers(&[("x-user-id", "3")])).unwrap();
        assert_eq!(actor.role, Role::User);
        assert_eq!(actor.ip, None);
    }

    #[test]
    fn missing_or_bad_identity_is_401() {
        for set in [
            Vec::new(),
            vec![("x-user-id", "not-a-number")],
            vec![("x-user-id", "1"), ("x-user-role", "superuser")],
        ] {
            let err = actor_from_headers(&headers(&set)).unwrap_err();
            assert_eq!(
                err.kind,
                sokoni_api::error::ErrorKind::Authentication
            );
        }
    }
}
