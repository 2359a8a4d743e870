/*
 * Copyright Stalwart Labs Ltd. See the COPYING
 * file at the top-level directory of this distribution.
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::smtp::auth::AuthFraming;

pub const DEFAULT_CONFIG_FILE: &str = "email_config.json";

/// Everything needed for one delivery, as read from `email_config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryConfig {
    pub smtp_server: String,
    #[serde(default = "default_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default = "default_true", alias = "use_ntlm")]
    pub use_challenge_response_auth: bool,
    #[serde(default = "default_level", alias = "ntlm_compatibility")]
    pub auth_compatibility_level: u8,
    #[serde(default)]
    pub include_timestamp: bool,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default)]
    pub helo_host: Option<String>,
    #[serde(default)]
    pub allow_invalid_certs: bool,
    #[serde(default)]
    pub auth_framing: AuthFraming,
    #[serde(default)]
    pub workstation: Option<String>,
}

fn default_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

fn default_level() -> u8 {
    crate::ntlm::DEFAULT_LEVEL
}

fn default_timeout() -> u64 {
    10
}

impl DeliveryConfig {
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|err| crate::Error::Config(err.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| crate::Error::Config(format!("{}: {}", path.display(), err)))?;
        Self::from_json(&json)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

/// Source for the account secret when the configuration has none.
pub trait SecretProvider {
    fn secret(&self) -> Option<String>;
}

/// Reads the secret from an environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSecret {
    pub var: String,
}

impl Default for EnvSecret {
    fn default() -> Self {
        EnvSecret {
            var: "PASSWORD".to_string(),
        }
    }
}

impl SecretProvider for EnvSecret {
    fn secret(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|secret| !secret.is_empty())
    }
}

impl SecretProvider for Option<String> {
    fn secret(&self) -> Option<String> {
        self.clone()
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use crate::{
        config::{EnvSecret, SecretProvider},
        smtp::auth::AuthFraming,
        DeliveryConfig, Error,
    };

    #[test]
    fn defaults() {
        let config = DeliveryConfig::from_json(r#"{"smtp_server": "mail.example.com"}"#).unwrap();
        assert_eq!(config.smtp_port, 587);
        assert!(config.use_challenge_response_auth);
        assert_eq!(config.auth_compatibility_level, 3);
        assert!(!config.include_timestamp);
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.deadline(), None);
        assert_eq!(config.auth_framing, AuthFraming::Continuation);
        assert!(config.recipients.is_empty());
        assert!(config.attachments.is_empty());
        assert_eq!(config.password, None);
    }

    #[test]
    fn alias_field_names() {
        let config = DeliveryConfig::from_json(
            r#"{
                "smtp_server": "mail.example.com",
                "smtp_port": 25,
                "sender": "a@x.com",
                "recipients": ["b@y.com", "c@y.com"],
                "domain": "CORP",
                "subject": "Report",
                "message": "hello",
                "attachments": ["report.pdf"],
                "use_ntlm": false,
                "ntlm_compatibility": 5,
                "include_timestamp": true,
                "auth_framing": "initial-response"
            }"#,
        )
        .unwrap();
        assert_eq!(config.smtp_port, 25);
        assert!(!config.use_challenge_response_auth);
        assert_eq!(config.auth_compatibility_level, 5);
        assert!(config.include_timestamp);
        assert_eq!(config.recipients, vec!["b@y.com", "c@y.com"]);
        assert_eq!(config.auth_framing, AuthFraming::InitialResponse);
    }

    #[test]
    fn invalid_files() {
        assert!(matches!(
            DeliveryConfig::from_json(r#"{"smtp_port": 25}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DeliveryConfig::from_json(r#"{"smtp_server": "x", "smtp_port": "25"}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DeliveryConfig::from_json(r#"{"smtp_server": "x", "auth_framing": "eager"}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            DeliveryConfig::from_file("/nonexistent/email_config.json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"smtp_server": "mail.example.com", "timeout_secs": 3}"#)
            .unwrap();
        let config = DeliveryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.timeout(), std::time::Duration::from_secs(3));
    }

    #[test]
    fn env_secret() {
        let provider = EnvSecret {
            var: "RELAY_SEND_TEST_SECRET".to_string(),
        };
        std::env::remove_var(&provider.var);
        assert_eq!(provider.secret(), None);
        std::env::set_var(&provider.var, "p4ss");
        assert_eq!(provider.secret().as_deref(), Some("p4ss"));
        std::env::remove_var(&provider.var);

        assert_eq!(Some("fixed".to_string()).secret().as_deref(), Some("fixed"));
    }
}
