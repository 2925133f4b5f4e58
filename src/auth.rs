// src/auth.rs
//
// Authentication for the GL admin API
// Provides:
// - JWT issuing and validation (session and API tokens)
// - Password hashing with Argon2
// - User and API token management

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite};
use tracing::info;

// JWT claims. `sub` is the user id for session tokens and the api_tokens
// row id for API tokens, so revocation checks hit the right row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: String,       // "admin" or "operator"
    pub token_type: String, // "session" or "api"
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub role: String,
    pub enabled: bool,
    pub email: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub last_login: Option<String>,
    pub password_changed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiToken {
    pub id: i64,
    pub name: String,
    pub token_hash: String,
    pub user_id: i64,
    pub expires_at: Option<String>,
    pub created_at: String,
    pub last_used: Option<String>,
    pub revoked: bool,
}

/// JWT issuing and verification
#[derive(Clone)]
pub struct JwtService {
    secret: String,
    session_hours: i64,
}

impl JwtService {
    pub fn new(secret: String, session_hours: i64) -> Self {
        Self { secret, session_hours }
    }

    /// Generate a session token for an interactive login
    pub fn generate_session_token(&self, user_id: i64, username: &str, role: &str) -> Result<String> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.session_hours);

        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            role: role.to_string(),
            token_type: "session".to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        self.encode_token(&claims)
    }

    /// Generate an API token (custom expiration, defaults to one year)
    pub fn generate_api_token(
        &self,
        token_id: i64,
        username: &str,
        role: &str,
        expires_in_days: Option<i64>,
    ) -> Result<String> {
        let now = Utc::now();
        let exp = if let Some(days) = expires_in_days {
            now + Duration::days(days)
        } else {
            now + Duration::days(365)
        };

        let claims = Claims {
            sub: token_id.to_string(),
            username: username.to_string(),
            role: role.to_string(),
            token_type: "api".to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        self.encode_token(&claims)
    }

    /// Validate and decode a JWT token
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        self.decode_token(token)
    }

    /// Simple JWT encoding using HMAC-SHA256
    fn encode_token(&self, claims: &Claims) -> Result<String> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let header = serde_json::json!({
            "alg": "HS256",
            "typ": "JWT"
        });

        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_string(&header)?);
        let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_string(claims)?);
        let signature_input = format!("{}.{}", header_b64, claims_b64);

        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|e| anyhow!("HMAC error: {}", e))?;
        mac.update(signature_input.as_bytes());
        let signature = mac.finalize();
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature.into_bytes().as_slice());

        Ok(format!("{}.{}.{}", header_b64, claims_b64, signature_b64))
    }

    /// Simple JWT decoding
    fn decode_token(&self, token: &str) -> Result<Claims> {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(anyhow!("Invalid JWT format"));
        }

        let claims_b64 = parts[1];
        let signature_b64 = parts[2];
        let signature_input = format!("{}.{}", parts[0], parts[1]);

        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
            .map_err(|e| anyhow!("HMAC error: {}", e))?;
        mac.update(signature_input.as_bytes());
        let expected_signature = mac.finalize();
        let expected_signature_b64 = URL_SAFE_NO_PAD.encode(expected_signature.into_bytes().as_slice());

        if signature_b64 != expected_signature_b64 {
            return Err(anyhow!("Invalid signature"));
        }

        let claims_json = URL_SAFE_NO_PAD
            .decode(claims_b64)
            .map_err(|e| anyhow!("Base64 decode error: {}", e))?;
        let claims: Claims = serde_json::from_slice(&claims_json)?;

        let now = Utc::now().timestamp();
        if claims.exp < now {
            return Err(anyhow!("Token expired"));
        }

        Ok(claims)
    }
}

/// Password hashing with Argon2
pub struct PasswordService;

impl PasswordService {
    pub fn hash_password(password: &str) -> Result<String> {
        use argon2::{
            password_hash::{rand_core::OsRng, PasswordHasher, SaltString},
            Argon2,
        };

        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let password_hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow!("Password hashing error: {}", e))?
            .to_string();

        Ok(password_hash)
    }

    pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
        use argon2::{
            password_hash::{PasswordHash, PasswordVerifier},
            Argon2,
        };

        let parsed_hash = PasswordHash::new(hash)
            .map_err(|e| anyhow!("Invalid hash format: {}", e))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

/// User authentication service
#[derive(Clone)]
pub struct AuthService {
    db: Pool<Sqlite>,
    jwt_service: JwtService,
}

impl AuthService {
    pub fn new(db: Pool<Sqlite>, jwt_secret: String, session_hours: i64) -> Self {
        Self {
            db,
            jwt_service: JwtService::new(jwt_secret, session_hours),
        }
    }

    /// Authenticate with username/password and issue a session token
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<(User, String)> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE username = ? AND enabled = 1")
            .bind(username)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| anyhow!("Invalid credentials"))?;

        if !PasswordService::verify_password(password, &user.password_hash)? {
            return Err(anyhow!("Invalid credentials"));
        }

        sqlx::query("UPDATE users SET last_login = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?")
            .bind(user.id)
            .execute(&self.db)
            .await?;

        let token = self
            .jwt_service
            .generate_session_token(user.id, &user.username, &user.role)?;

        Ok((user, token))
    }

    /// Create a new user
    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: &str,
        email: Option<&str>,
    ) -> Result<User> {
        let password_hash = PasswordService::hash_password(password)?;

        let user: User = sqlx::query_as(
            "INSERT INTO users (username, password_hash, role, email, enabled) \
             VALUES (?, ?, ?, ?, 1) \
             RETURNING *",
        )
        .bind(username)
        .bind(password_hash)
        .bind(role)
        .bind(email)
        .fetch_one(&self.db)
        .await?;

        Ok(user)
    }

    /// Create an API token. The row is inserted first so its id can be
    /// embedded in the JWT, then the token hash is stored.
    pub async fn create_api_token(
        &self,
        name: &str,
        user_id: i64,
        expires_in_days: Option<i64>,
    ) -> Result<(ApiToken, String)> {
        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.db)
            .await?;

        let expires_at = expires_in_days.map(|days| {
            (Utc::now() + Duration::days(days))
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string()
        });

        let token_record: ApiToken = sqlx::query_as(
            "INSERT INTO api_tokens (name, token_hash, user_id, expires_at, revoked) \
             VALUES (?, '', ?, ?, 0) \
             RETURNING *",
        )
        .bind(name)
        .bind(user_id)
        .bind(&expires_at)
        .fetch_one(&self.db)
        .await?;

        let token = self.jwt_service.generate_api_token(
            token_record.id,
            &user.username,
            &user.role,
            expires_in_days,
        )?;

        // Only a hash of the token is kept server side
        use sha2::{Digest, Sha256};
        let token_hash = format!("{:x}", Sha256::digest(token.as_bytes()));

        sqlx::query("UPDATE api_tokens SET token_hash = ? WHERE id = ?")
            .bind(&token_hash)
            .bind(token_record.id)
            .execute(&self.db)
            .await?;

        Ok((token_record, token))
    }

    /// Validate a token (session or API). API tokens are checked against
    /// their database row so revocation and user disabling take effect
    /// before the JWT expires.
    pub async fn validate_token(&self, token: &str) -> Result<Claims> {
        let mut claims = self.jwt_service.validate_token(token)?;

        if claims.token_type == "api" {
            let token_id: i64 = claims.sub.parse()?;
            let record: ApiToken = sqlx::query_as("SELECT * FROM api_tokens WHERE id = ?")
                .bind(token_id)
                .fetch_optional(&self.db)
                .await?
                .ok_or_else(|| anyhow!("Unknown token"))?;

            if record.revoked {
                return Err(anyhow!("Token revoked"));
            }

            let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
                .bind(record.user_id)
                .fetch_optional(&self.db)
                .await?
                .ok_or_else(|| anyhow!("Token owner no longer exists"))?;
            if !user.enabled {
                return Err(anyhow!("Token owner is disabled"));
            }

            // Role changes apply without re-issuing the token
            claims.username = user.username;
            claims.role = user.role;

            sqlx::query("UPDATE api_tokens SET last_used = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?")
                .bind(token_id)
                .execute(&self.db)
                .await?;
        }

        Ok(claims)
    }

    /// Revoke an API token
    pub async fn revoke_token(&self, token_id: i64) -> Result<()> {
        sqlx::query("UPDATE api_tokens SET revoked = 1 WHERE id = ?")
            .bind(token_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// List all users
    pub async fn list_users(&self) -> Result<Vec<User>> {
        let users = sqlx::query_as("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.db)
            .await?;
        Ok(users)
    }

    /// List API tokens for a user
    pub async fn list_user_tokens(&self, user_id: i64) -> Result<Vec<ApiToken>> {
        let tokens =
            sqlx::query_as("SELECT * FROM api_tokens WHERE user_id = ? ORDER BY created_at DESC")
                .bind(user_id)
                .fetch_all(&self.db)
                .await?;
        Ok(tokens)
    }

    /// Seed an admin account on an empty database so the instance is
    /// reachable after first start.
    pub async fn ensure_bootstrap_admin(&self, password: &str) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.db)
            .await?;
        if count == 0 {
            self.create_user("admin", password, "admin", None).await?;
            info!("created bootstrap admin user");
        }
        Ok(())
    }
}
