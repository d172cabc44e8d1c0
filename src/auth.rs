//! Password hashing, random tokens and administrative user management.

use crate::db::{Database, User, now_timestamp};
use crate::error::{AppError, Result};
use argon2::{
    Argon2,
    password_hash::{
        PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
        rand_core::{OsRng, RngCore},
    },
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Generate a secure random token (43 URL-safe characters).
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// User administration.
pub struct AuthService {
    db: Database,
}

impl AuthService {
    /// Create a new auth service.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a new user (admin function).
    pub fn create_user(
        &self,
        email: &str,
        password: &str,
        role: &str,
        name: Option<&str>,
    ) -> Result<User> {
        let email = email.trim();
        if email.is_empty() || email.len() > 254 {
            return Err(AppError::InvalidFormat(
                "Email must be 1-254 characters".to_string(),
            ));
        }

        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
            _ => {
                return Err(AppError::InvalidFormat(format!(
                    "Not an email address: {}",
                    email
                )));
            }
        }

        if password.len() < 4 {
            return Err(AppError::InvalidFormat(
                "Password must be at least 4 characters".to_string(),
            ));
        }

        if role != "admin" && role != "user" {
            return Err(AppError::InvalidFormat(
                "Role must be 'admin' or 'user'".to_string(),
            ));
        }

        let now = now_timestamp();
        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.to_lowercase(),
            password_hash: hash_password(password)?,
            name: name.map(str::to_string),
            role: role.to_string(),
            created_at: now,
            updated_at: now,
        };

        self.db.create_user(&user)?;
        Ok(user)
    }

    /// Check a login.
    pub fn authenticate(&self, email: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.db.get_user_by_email(&email.trim().to_lowercase())? else {
            return Ok(None);
        };
        Ok(verify_password(password, &user.password_hash)?.then_some(user))
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.list_users()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_and_verify() {
        let password = "test_password_123";
        let hash = hash_password(password).unwrap();

        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_generate_token() {
        let token1 = generate_token();
        let token2 = generate_token();

        assert_eq!(token1.len(), 43); // Base64 of 32 bytes
        assert_ne!(token1, token2);
    }

    #[test]
    fn test_create_user_and_authenticate() {
        let auth = AuthService::new(Database::open_memory().unwrap());
        let user = auth
            .create_user("Reader@Example.org", "secret", "admin", Some("Reader"))
            .unwrap();
        assert_eq!(user.email, "reader@example.org");

        assert!(auth.authenticate("reader@example.org", "secret").unwrap().is_some());
        assert!(auth.authenticate("reader@example.org", "nope").unwrap().is_none());
        assert!(auth.authenticate("nobody@example.org", "secret").unwrap().is_none());
    }

    #[test]
    fn test_create_user_validation() {
        let auth = AuthService::new(Database::open_memory().unwrap());
        assert!(auth.create_user("not-an-email", "secret", "user", None).is_err());
        assert!(auth.create_user("a@b.c", "abc", "user", None).is_err());
        assert!(auth.create_user("a@b.c", "secret", "root", None).is_err());
    }
}
