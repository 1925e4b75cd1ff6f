//! Credential validation, token issuance, and per-request identity
//! extraction.
//!
//! A trait-free struct wrapping a `Store`, with one `thiserror` error enum
//! for every way registration, login, or token verification can fail.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use repository::{RepositoryError, Store};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bearer tokens are valid for this long after issuance.
pub const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login already taken")]
    Conflict,
    /// Deliberately uniform for both "no such user" and "wrong password",
    /// to avoid leaking which one it was (user-enumeration defense).
    #[error("invalid login or password")]
    Unauthorized,
    #[error("storage error: {0}")]
    Store(#[from] RepositoryError),
    #[error("failed to hash password: {0}")]
    Hash(String),
    #[error("failed to issue or verify token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Subject: the user id, as a string (JWT `sub` is conventionally text).
    sub: String,
    exp: usize,
}

/// Handles registration, login, and bearer-token issuance/verification.
pub struct AuthService {
    store: Arc<dyn Store>,
    jwt_secret: String,
}

impl AuthService {
    pub fn new(store: Arc<dyn Store>, jwt_secret: impl Into<String>) -> Self {
        Self {
            store,
            jwt_secret: jwt_secret.into(),
        }
    }

    /// Hashes `password` with Argon2 (adaptive cost), inserts the user via
    /// the Store, and returns a signed bearer token.
    pub async fn register(&self, login: &str, password: &str) -> Result<String, AuthError> {
        let hash = hash_password(password)?;
        let user_id = match self.store.add_user(login, hash.as_bytes()).await {
            Ok(id) => id,
            Err(RepositoryError::DuplicateLogin) => return Err(AuthError::Conflict),
            Err(e) => return Err(AuthError::Store(e)),
        };
        self.issue_token(user_id)
    }

    /// Looks up the user, verifies the password, and returns a signed
    /// bearer token. Both "no such user" and "wrong password" surface as
    /// the same [`AuthError::Unauthorized`].
    pub async fn login(&self, login: &str, password: &str) -> Result<String, AuthError> {
        let user = match self.store.get_user(login).await {
            Ok(user) => user,
            Err(RepositoryError::NotFound) => return Err(AuthError::Unauthorized),
            Err(e) => return Err(AuthError::Store(e)),
        };

        let stored = std::str::from_utf8(&user.password_hash)
            .map_err(|e| AuthError::Hash(e.to_string()))?;
        let parsed = PasswordHash::new(stored).map_err(|e| AuthError::Hash(e.to_string()))?;
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| AuthError::Unauthorized)?;

        self.issue_token(user.id)
    }

    /// Validates signature and expiry, rejects unexpected signing
    /// algorithms, and returns the encoded user id.
    pub fn extract_user_id(&self, token: &str) -> Result<i64, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256];
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &validation,
        )?;
        data.claims
            .sub
            .parse()
            .map_err(|_| AuthError::Unauthorized)
    }

    fn issue_token(&self, user_id: i64) -> Result<String, AuthError> {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs()
            + TOKEN_TTL_SECS;
        let claims = Claims {
            sub: user_id.to_string(),
            exp: exp as usize,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )?;
        Ok(token)
    }
}

fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut argon2::password_hash::rand_core::OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use repository::fake::FakeStore;

    fn service() -> AuthService {
        AuthService::new(Arc::new(FakeStore::new()), "test-secret")
    }

    #[tokio::test]
    async fn register_then_login_round_trips() {
        let svc = service();
        let token = svc.register("alice", "hunter2").await.unwrap();
        let user_id = svc.extract_user_id(&token).unwrap();

        let login_token = svc.login("alice", "hunter2").await.unwrap();
        assert_eq!(svc.extract_user_id(&login_token).unwrap(), user_id);
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_conflict() {
        let svc = service();
        svc.register("alice", "hunter2").await.unwrap();
        let err = svc.register("alice", "different").await.unwrap_err();
        assert!(matches!(err, AuthError::Conflict));
    }

    #[tokio::test]
    async fn wrong_password_is_unauthorized() {
        let svc = service();
        svc.register("alice", "hunter2").await.unwrap();
        let err = svc.login("alice", "wrong").await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn unknown_login_is_unauthorized_not_not_found() {
        let svc = service();
        let err = svc.login("ghost", "whatever").await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let svc = service();
        let token = svc.register("alice", "hunter2").await.unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(svc.extract_user_id(&tampered).is_err());
    }
}
