use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{AppState, Role};

/// Session tokens are stored as hex SHA-256, never in clear.
pub fn hash_access_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthContext {
    pub fn require(&self, allowed: &[Role]) -> Result<(), ApiError> {
        if self.role == Role::Admin || allowed.contains(&self.role) {
            Ok(())
        } else {
            tracing::debug!(user_id = %self.user_id, role = self.role.as_str(), "role rejected");
            Err(ApiError::forbidden())
        }
    }
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::session_expired())?;

            let actor = state
                .ledger
                .session_actor(&hash_access_token(authz.token()))
                .await?
                .ok_or_else(ApiError::session_expired)?;

            Ok(AuthContext {
                user_id: actor.user_id,
                role: actor.role,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_hash_is_hex_sha256() {
        let h = hash_access_token("dev-token");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_access_token("dev-token"));
        assert_ne!(h, hash_access_token("dev-token2"));
    }

    #[test]
    fn admin_passes_every_role_check() {
        let admin = AuthContext {
            user_id: Uuid::new_v4(),
            role: Role::Admin,
        };
        assert!(admin.require(&[Role::Pharmacist]).is_ok());
        let nurse = AuthContext {
            role: Role::Nurse,
            ..admin
        };
        assert!(nurse.require(&[Role::Accountant]).is_err());
        assert!(nurse.require(&[Role::Nurse]).is_ok());
    }
}
