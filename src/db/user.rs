use argon2::{
    Argon2, PasswordHasher, PasswordVerifier,
    password_hash::{PasswordHash, SaltString},
};
use rand::RngCore;
use sqlx::sqlite::SqlitePool;

use crate::jwt::{Identity, Role};
use crate::presence::OnlineStatus;

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub permissions: Vec<String>,
    pub online_status: OnlineStatus,
}

impl User {
    /// Identity claim set for a session of this user.
    pub fn to_identity(&self, client_id: Option<String>) -> Identity {
        Identity {
            id: self.id,
            login: self.login.clone(),
            email: self.email.clone(),
            full_name: self.full_name.clone(),
            role: self.role,
            permissions: self.permissions.clone(),
            impersonated_from_id: None,
            impersonated_client_id: None,
            client_id,
        }
    }
}

/// Fields of a user to create.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub login: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub permissions: Vec<String>,
    pub password_hash: Option<String>,
}

impl NewUser {
    pub fn new(login: &str, role: Role) -> Self {
        Self {
            login: login.to_string(),
            email: String::new(),
            full_name: String::new(),
            role,
            permissions: Vec::new(),
            password_hash: None,
        }
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_password_hash(mut self, hash: String) -> Self {
        self.password_hash = Some(hash);
        self
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    login: String,
    email: String,
    full_name: String,
    role: String,
    permissions: String,
    online_status: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            login: row.login,
            email: row.email,
            full_name: row.full_name,
            role: Role::from_str(&row.role),
            permissions: row
                .permissions
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
            online_status: OnlineStatus::from_str(&row.online_status),
        }
    }
}

/// Hash a password into a PHC string.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let mut salt_bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)?;
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

impl UserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a user. Returns the user ID.
    pub async fn create(&self, user: &NewUser) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO users (login, email, full_name, role, permissions, password_hash) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.login)
        .bind(&user.email)
        .bind(&user.full_name)
        .bind(user.role.as_str())
        .bind(user.permissions.join(","))
        .bind(&user.password_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Get a user by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, login, email, full_name, role, permissions, online_status FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Get a user by login.
    pub async fn get_by_login(&self, login: &str) -> Result<Option<User>, sqlx::Error> {
        let row: Option<UserRow> = sqlx::query_as(
            "SELECT id, login, email, full_name, role, permissions, online_status FROM users WHERE login = ?",
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    /// Check a login/password pair. Returns the user only on a match.
    pub async fn verify_credentials(
        &self,
        login: &str,
        password: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        let hash: Option<(Option<String>,)> =
            sqlx::query_as("SELECT password_hash FROM users WHERE login = ?")
                .bind(login)
                .fetch_optional(&self.pool)
                .await?;

        let Some((Some(hash),)) = hash else {
            return Ok(None);
        };

        if !verify_password(&hash, password) {
            return Ok(None);
        }

        self.get_by_login(login).await
    }

    /// Persist the preferred presence status.
    pub async fn set_online_status(
        &self,
        id: i64,
        status: OnlineStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET online_status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set the role for a user.
    pub async fn set_role(&self, id: i64, role: Role) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE users SET role = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
