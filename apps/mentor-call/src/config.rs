use std::env;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::media::MediaConstraints;
use crate::signaling::{Credentials, ReconnectPolicy};

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8090/ws";

pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("TURN server {url} needs both a username and a credential")]
    IncompleteTurn { url: String },
}

#[derive(Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl fmt::Debug for TurnServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnServer")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// One entry of the ICE server list handed to the peer backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    /// Relay fallback for restrictive networks; optional.
    pub turn: Option<TurnServer>,
}

fn default_stun_urls() -> Vec<String> {
    DEFAULT_STUN_URLS.iter().map(|url| url.to_string()).collect()
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn: None,
        }
    }
}

impl IceConfig {
    /// STUN is always present; an empty list means the public defaults.
    pub fn servers(&self) -> Vec<IceServer> {
        let stun_urls = if self.stun_urls.is_empty() {
            default_stun_urls()
        } else {
            self.stun_urls.clone()
        };
        let mut servers = vec![IceServer {
            urls: stun_urls,
            username: None,
            credential: None,
        }];
        if let Some(turn) = &self.turn {
            servers.push(IceServer {
                urls: vec![turn.url.clone()],
                username: Some(turn.username.clone()),
                credential: Some(turn.credential.clone()),
            });
        }
        servers
    }
}

/// What the session does when an established peer connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerFailurePolicy {
    /// Report `Disconnected` and wait for the user.
    #[default]
    Manual,
    /// Tear the link down and rejoin the room so the peer offers again.
    Rejoin { max_attempts: u32 },
}

impl FromStr for PeerFailurePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim().to_ascii_lowercase();
        match value.split_once(':') {
            None if value == "manual" => Ok(PeerFailurePolicy::Manual),
            None if value == "rejoin" => Ok(PeerFailurePolicy::Rejoin { max_attempts: 3 }),
            Some(("rejoin", attempts)) => attempts
                .parse()
                .map(|max_attempts| PeerFailurePolicy::Rejoin { max_attempts })
                .map_err(|_| format!("invalid rejoin attempt count {attempts:?}")),
            _ => Err("expected manual, rejoin or rejoin:N".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub signaling_url: String,
    pub credentials: Credentials,
    /// Sent to the other participant as `user-info`.
    pub display_name: Option<String>,
    pub ice: IceConfig,
    pub reconnect: ReconnectPolicy,
    pub failure_policy: PeerFailurePolicy,
    pub rejoin_on_reconnect: bool,
    pub constraints: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            credentials: Credentials::Anonymous,
            display_name: None,
            ice: IceConfig::default(),
            reconnect: ReconnectPolicy::default(),
            failure_policy: PeerFailurePolicy::Manual,
            rejoin_on_reconnect: true,
            constraints: MediaConstraints::default(),
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let signaling_url =
            var("MENTOR_CALL_SIGNALING_URL").unwrap_or(defaults.signaling_url);
        let credentials = Credentials::from_token(var("MENTOR_CALL_TOKEN"));
        let display_name = var("MENTOR_CALL_DISPLAY_NAME");

        let stun_urls: Vec<String> = var("MENTOR_CALL_STUN_URLS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let stun_urls = if stun_urls.is_empty() {
            defaults.ice.stun_urls
        } else {
            stun_urls
        };
        let turn = match var("MENTOR_CALL_TURN_URL") {
            Some(url) => match (
                var("MENTOR_CALL_TURN_USERNAME"),
                var("MENTOR_CALL_TURN_CREDENTIAL"),
            ) {
                (Some(username), Some(credential)) => Some(TurnServer {
                    url,
                    username,
                    credential,
                }),
                _ => return Err(ConfigError::IncompleteTurn { url }),
            },
            None => None,
        };

        let reconnect = match var("MENTOR_CALL_RECONNECT_ATTEMPTS") {
            Some(value) => {
                let attempts = value.parse().map_err(|err: std::num::ParseIntError| {
                    ConfigError::Invalid {
                        var: "MENTOR_CALL_RECONNECT_ATTEMPTS",
                        value: value.clone(),
                        reason: err.to_string(),
                    }
                })?;
                defaults.reconnect.with_max_attempts(attempts)
            }
            None => defaults.reconnect,
        };
        let failure_policy = match var("MENTOR_CALL_FAILURE_POLICY") {
            Some(value) => value.parse().map_err(|reason| ConfigError::Invalid {
                var: "MENTOR_CALL_FAILURE_POLICY",
                value: value.clone(),
                reason,
            })?,
            None => defaults.failure_policy,
        };
        let rejoin_on_reconnect = var("MENTOR_CALL_REJOIN_ON_RECONNECT")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.rejoin_on_reconnect);

        Ok(Self {
            signaling_url,
            credentials,
            display_name,
            ice: IceConfig { stun_urls, turn },
            reconnect,
            failure_policy,
            rejoin_on_reconnect,
            constraints: defaults.constraints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_use_public_stun_and_anonymous_credentials() {
        let config = CallConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert!(config.credentials.is_anonymous());
        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn.is_none());
        assert_eq!(config.failure_policy, PeerFailurePolicy::Manual);
        assert!(config.rejoin_on_reconnect);
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn turn_server_requires_credentials() {
        let err = CallConfig::from_lookup(lookup(&[(
            "MENTOR_CALL_TURN_URL",
            "turn:turn.example.org:3478",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::IncompleteTurn { .. }));

        let config = CallConfig::from_lookup(lookup(&[
            ("MENTOR_CALL_TURN_URL", "turn:turn.example.org:3478"),
            ("MENTOR_CALL_TURN_USERNAME", "mentor"),
            ("MENTOR_CALL_TURN_CREDENTIAL", "pw"),
        ]))
        .unwrap();
        let servers = config.ice.servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].username, None);
        assert_eq!(servers[1].username.as_deref(), Some("mentor"));
        assert!(!format!("{:?}", config.ice.turn).contains("pw"));
    }

    #[test]
    fn stun_list_and_policy_are_parsed() {
        let config = CallConfig::from_lookup(lookup(&[
            ("MENTOR_CALL_STUN_URLS", "stun:a.example:3478, stun:b.example:3478,"),
            ("MENTOR_CALL_FAILURE_POLICY", "rejoin:2"),
            ("MENTOR_CALL_RECONNECT_ATTEMPTS", "9"),
            ("MENTOR_CALL_TOKEN", "tok"),
        ]))
        .unwrap();
        assert_eq!(
            config.ice.stun_urls,
            vec!["stun:a.example:3478", "stun:b.example:3478"]
        );
        assert_eq!(
            config.failure_policy,
            PeerFailurePolicy::Rejoin { max_attempts: 2 }
        );
        assert_eq!(config.reconnect.max_attempts, 9);
        assert_eq!(config.credentials.token(), "tok");
    }

    #[test]
    fn blank_stun_list_falls_back_to_public_servers() {
        let config = CallConfig::from_lookup(lookup(&[
            ("MENTOR_CALL_STUN_URLS", " , ,"),
            ("MENTOR_CALL_DISABLE_STUN", "true"),
        ]))
        .unwrap();
        assert_eq!(config.ice.stun_urls, DEFAULT_STUN_URLS.to_vec());

        let bare = IceConfig {
            stun_urls: Vec::new(),
            turn: None,
        };
        let servers = bare.servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, DEFAULT_STUN_URLS.to_vec());
    }

    #[test]
    fn bad_values_are_reported_with_their_variable() {
        let err = CallConfig::from_lookup(lookup(&[("MENTOR_CALL_FAILURE_POLICY", "sometimes")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "MENTOR_CALL_FAILURE_POLICY",
                ..
            }
        ));
        assert_eq!(
            "REJOIN".parse::<PeerFailurePolicy>(),
            Ok(PeerFailurePolicy::Rejoin { max_attempts: 3 })
        );
        assert!("rejoin:x".parse::<PeerFailurePolicy>().is_err());
    }
}
