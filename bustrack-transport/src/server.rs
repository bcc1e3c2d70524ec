use std::time::Duration;

use bustrack_logic::{EntityKey, prelude::*};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

const fn database_host() -> &'static str {
    if let Some(host) = option_env!("BUSTRACK_DATABASE_HOST") {
        host
    } else {
        "localhost"
    }
}

const fn database_port() -> u16 {
    if let Some(port) = option_env!("BUSTRACK_DATABASE_PORT") {
        const_str::parse!(port, u16)
    } else {
        // Firebase emulator default
        9000
    }
}

const fn database_secure() -> bool {
    if let Some(secure) = option_env!("BUSTRACK_DATABASE_SECURE") {
        const_str::eq_ignore_ascii_case!(secure, "true") || const_str::equal!(secure, "1")
    } else {
        false
    }
}

const fn database_http_proto() -> &'static str {
    if database_secure() { "https" } else { "http" }
}

const DATABASE_HOST: &str = database_host();
const DATABASE_PORT: u16 = database_port();
const DATABASE_HTTP_PROTO: &str = database_http_proto();

const DATABASE_SOCKET: &str = const_str::concat!(DATABASE_HOST, ":", DATABASE_PORT);

const DATABASE_URL: &str = const_str::concat!(DATABASE_HTTP_PROTO, "://", DATABASE_SOCKET);
const DATABASE_NAMESPACE: Option<&str> = option_env!("BUSTRACK_DATABASE_NAMESPACE");

/// Where the realtime database lives and how to talk to it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirebaseConfig {
    pub database_url: String,
    /// Database name, only needed when talking to the emulator
    pub namespace: Option<String>,
    /// ID token or database secret sent as the `auth` param
    pub auth_token: Option<String>,
    /// Wait between reconnect attempts of a dropped listener
    pub reconnect_seconds: u32,
    /// A listener that hears nothing for this long is considered dead, the database sends a
    /// keep-alive about every 30 seconds
    pub idle_timeout_seconds: u32,
}

impl Default for FirebaseConfig {
    fn default() -> Self {
        Self {
            database_url: DATABASE_URL.to_string(),
            namespace: DATABASE_NAMESPACE.map(str::to_string),
            auth_token: None,
            reconnect_seconds: 3,
            idle_timeout_seconds: 90,
        }
    }
}

impl FirebaseConfig {
    fn url_for(&self, path: &str) -> Result<Url> {
        let mut url = Url::parse(&self.database_url).context("Invalid database URL")?;
        url.set_path(&format!("/{path}.json"));

        let params = [
            ("ns", self.namespace.as_deref()),
            ("auth", self.auth_token.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|value| (name, value)))
        .collect::<Vec<_>>();

        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        Ok(url)
    }

    /// REST endpoint for the record at `key`
    pub fn key_url(&self, key: &EntityKey) -> Result<Url> {
        self.url_for(key.as_str())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_seconds as u64)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds.max(1) as u64)
    }
}

/// Check the database answers at all, done before starting a session for faster error
/// reporting.
pub async fn database_reachable(config: &FirebaseConfig) -> Result<bool> {
    let mut url = config.url_for("")?;
    url.query_pairs_mut().append_pair("shallow", "true");
    reqwest::get(url)
        .await
        .map(|resp| resp.status() == StatusCode::OK)
        .context("Failed to make request")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> FirebaseConfig {
        FirebaseConfig {
            database_url: url.to_string(),
            namespace: None,
            auth_token: None,
            reconnect_seconds: 1,
            idle_timeout_seconds: 90,
        }
    }

    #[test]
    fn test_key_url() {
        let key = EntityKey::new("/busLocation").unwrap();
        let url = config("https://bus-default-rtdb.firebaseio.com")
            .key_url(&key)
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://bus-default-rtdb.firebaseio.com/busLocation.json"
        );
    }

    #[test]
    fn test_nested_key_with_params() {
        let mut config = config("http://localhost:9000");
        config.namespace = Some("bus-tracking".to_string());
        config.auth_token = Some("s3cret".to_string());

        let key = EntityKey::new("routes/3/bus").unwrap();
        let url = config.key_url(&key).unwrap();

        assert_eq!(
            url.as_str(),
            "http://localhost:9000/routes/3/bus.json?ns=bus-tracking&auth=s3cret"
        );
    }

    #[test]
    fn test_root_url() {
        let url = config("http://localhost:9000").url_for("").unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/.json");
    }

    #[test]
    fn test_bad_database_url() {
        let key = EntityKey::default();
        assert!(config("not a url").key_url(&key).is_err());
    }
}
