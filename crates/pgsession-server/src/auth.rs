use crate::config::{AuthConfig, UserConfig};
use anyhow::{anyhow, Result};
use argon2::{Argon2, PasswordHasher};
use password_hash::{PasswordHash, PasswordVerifier, SaltString};
use rand_core::OsRng;
use std::collections::{HashMap, HashSet};

/// Users and databases known to the scripted backend.
#[derive(Debug, Clone, Default)]
pub struct AuthManager {
    users: HashMap<String, UserConfig>,
    databases: HashSet<String>,
}

impl AuthManager {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let mut users = HashMap::new();
        for user in &config.users {
            if let Some(hash) = &user.password_hash {
                PasswordHash::new(hash)
                    .map_err(|err| anyhow!("user {}: bad password_hash: {err}", user.username))?;
            }
            users.insert(user.username.clone(), user.clone());
        }
        Ok(Self {
            users,
            databases: config.databases.iter().cloned().collect(),
        })
    }

    /// `None` for an unknown user, otherwise whether a password is required.
    pub fn requires_password(&self, username: &str) -> Option<bool> {
        self.users
            .get(username)
            .map(|user| user.password_hash.is_some() || user.password_plain.is_some())
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        let user = self
            .users
            .get(username)
            .ok_or_else(|| anyhow!("unknown user"))?;
        if let Some(hash) = &user.password_hash {
            let parsed = PasswordHash::new(hash).map_err(|err| anyhow!("{err}"))?;
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .map_err(|_| anyhow!("invalid password"))?;
        } else if let Some(plain) = &user.password_plain {
            if plain != password {
                return Err(anyhow!("invalid password"));
            }
        }
        Ok(())
    }

    pub fn database_allowed(&self, name: &str) -> bool {
        self.databases.is_empty() || self.databases.contains(name)
    }
}

/// Produces an argon2 PHC string for `password_hash`.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("{err}"))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        let config = AuthConfig {
            databases: vec!["test".into()],
            users: vec![
                UserConfig {
                    username: "fred".into(),
                    password_hash: None,
                    password_plain: Some("secret".into()),
                },
                UserConfig {
                    username: "ann".into(),
                    password_hash: Some(hash_password("hunter2").unwrap()),
                    password_plain: None,
                },
                UserConfig {
                    username: "guest".into(),
                    password_hash: None,
                    password_plain: None,
                },
            ],
        };
        AuthManager::new(&config).unwrap()
    }

    #[test]
    fn plain_and_hashed_passwords() {
        let auth = manager();
        assert!(auth.authenticate("fred", "secret").is_ok());
        assert!(auth.authenticate("fred", "wrong").is_err());
        assert!(auth.authenticate("ann", "hunter2").is_ok());
        assert!(auth.authenticate("ann", "hunter3").is_err());
        assert!(auth.authenticate("nobody", "x").is_err());
    }

    #[test]
    fn trust_users_need_no_password() {
        let auth = manager();
        assert_eq!(auth.requires_password("guest"), Some(false));
        assert_eq!(auth.requires_password("fred"), Some(true));
        assert_eq!(auth.requires_password("nobody"), None);
    }

    #[test]
    fn databases_restricted_when_listed() {
        let auth = manager();
        assert!(auth.database_allowed("test"));
        assert!(!auth.database_allowed("prod"));
        assert!(AuthManager::default().database_allowed("anything"));
    }

    #[test]
    fn malformed_hash_rejected_at_load() {
        let config = AuthConfig {
            databases: vec![],
            users: vec![UserConfig {
                username: "x".into(),
                password_hash: Some("not-a-phc-string".into()),
                password_plain: None,
            }],
        };
        assert!(AuthManager::new(&config).is_err());
    }
}
