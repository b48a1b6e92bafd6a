//! Caller authentication
//!
//! Turns the `Authorization` header into a [`Principal`]. With a JWT secret
//! configured the principal is the token's `sub`; without one the bearer
//! token is treated as an opaque principal identifier and forwarded as-is
//! to the auth service.

pub mod jwt;

pub use jwt::{extract_token_from_header, Claims, JwtValidator, TokenValidationResult};

use crate::types::{KmsError, Result};

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    /// Raw bearer token, forwarded to the auth service
    pub token: String,
}

#[derive(Clone)]
pub enum BearerAuth {
    Jwt(JwtValidator),
    Opaque,
}

impl BearerAuth {
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<Principal> {
        let token = extract_token_from_header(auth_header)
            .ok_or_else(|| KmsError::Unauthorized("missing bearer token".into()))?;

        match self {
            Self::Jwt(validator) => {
                let result = validator.verify_token(token);
                match result.claims {
                    Some(claims) if result.valid => Ok(Principal {
                        id: claims.sub,
                        token: token.to_string(),
                    }),
                    _ => Err(KmsError::Unauthorized(
                        result.error.unwrap_or_else(|| "invalid token".into()),
                    )),
                }
            }
            Self::Opaque => Ok(Principal {
                id: token.to_string(),
                token: token.to_string(),
            }),
        }
    }
}
