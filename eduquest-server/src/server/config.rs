use eduquest_shared::auth::Role;
use eduquest_shared::domain::{Child, Parent, Subject};
use serde::Deserialize;
use std::{env, fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub parents: Vec<Parent>,
    pub children: Vec<Child>,
    pub subjects: Vec<Subject>,
    pub jwt_secret: String,
    pub users: Vec<UserConfig>,
    /// IANA timezone the family lives in; "today" for due-date checks and
    /// the overdue sweep is computed in this zone. Defaults to UTC.
    pub timezone: Option<String>,
    pub dev_cors_origin: Option<String>,
    pub listen_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Must match a parent or child id, depending on role.
    pub username: String,
    pub password_hash: String, // bcrypt hash
    pub role: Role,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Yaml(e) => write!(f, "YAML error: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(value: serde_yaml::Error) -> Self {
        ConfigError::Yaml(value)
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
        Self::load_from_path(path)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(&path)?;
        let cfg: AppConfig = serde_yaml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-checks the pairing facts the rest of the server takes as given:
    /// every child references a declared parent, and every login user maps to
    /// a principal of the matching role.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for child in &self.children {
            if !self.parents.iter().any(|p| p.id == child.parent_id) {
                return Err(ConfigError::Invalid(format!(
                    "child {} references unknown parent {}",
                    child.id, child.parent_id
                )));
            }
        }
        for user in &self.users {
            let ok = match user.role {
                Role::Parent => self.parents.iter().any(|p| p.id == user.username),
                Role::Child => self.children.iter().any(|c| c.id == user.username),
            };
            if !ok {
                return Err(ConfigError::Invalid(format!(
                    "user {} has no matching {:?} record",
                    user.username, user.role
                )));
            }
        }
        if let Some(tz) = &self.timezone
            && tz.parse::<chrono_tz::Tz>().is_err()
        {
            return Err(ConfigError::Invalid(format!("unknown timezone: {tz}")));
        }
        Ok(())
    }

    pub fn user(&self, username: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.username == username)
    }

    /// The parent a child id is paired with, from the config facts.
    pub fn parent_of(&self, child_id: &str) -> Option<&str> {
        self.children
            .iter()
            .find(|c| c.id == child_id)
            .map(|c| c.parent_id.as_str())
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.timezone
            .as_deref()
            .and_then(|tz| tz.parse().ok())
            .unwrap_or(chrono_tz::Tz::UTC)
    }
}
