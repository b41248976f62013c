//! Provider API key lookup and validation
//!
//! The key is resolved explicitly and handed to the player; nothing reads a
//! global. Sources, in the order the CLI chains them:
//! - `ELEVENLABS_API_KEY` environment variable (also loaded from `.env`)
//! - OS native secret storage (libsecret, Keychain, Credential Manager)
//!
//! Security notes:
//! - Never log the key value
//! - Always use masked display

use std::time::Duration;

use keyring::Entry;

/// Environment variable holding the provider key
pub const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";

/// Provider REST API base, used for key validation
pub const API_BASE_URL: &str = "https://api.elevenlabs.io";

const SERVICE_NAME: &str = "coach-voice";
const API_KEY_NAME: &str = "elevenlabs-api-key";

const VALIDATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from storing or validating credentials
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialError {
    Keyring(String),
    Network(String),
    UnexpectedStatus(u16),
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialError::Keyring(e) => write!(f, "Keyring error: {}", e),
            CredentialError::Network(e) => write!(f, "Network error: {}", e),
            CredentialError::UnexpectedStatus(status) => {
                write!(f, "Unexpected API response: {}", status)
            }
        }
    }
}

impl std::error::Error for CredentialError {}

/// Somewhere an API key may come from
pub trait CredentialSource: Send + Sync {
    /// The key, or `None` if this source has none (errors are logged)
    fn api_key(&self) -> Option<String>;

    fn name(&self) -> &'static str;
}

fn non_empty(key: String) -> Option<String> {
    let key = key.trim().to_string();
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

/// Key from the `ELEVENLABS_API_KEY` environment variable
#[derive(Debug, Clone, Default)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV).ok().and_then(non_empty)
    }

    fn name(&self) -> &'static str {
        "environment"
    }
}

/// Key stored in the OS keyring
#[derive(Debug, Clone)]
pub struct KeyringCredentials {
    service: String,
    account: String,
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self::new(SERVICE_NAME, API_KEY_NAME)
    }
}

impl KeyringCredentials {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<Entry, CredentialError> {
        Entry::new(&self.service, &self.account)
            .map_err(|e| CredentialError::Keyring(format!("failed to create entry: {}", e)))
    }

    /// Store the key. Pass `None` (or an empty key) to delete it.
    pub fn set(&self, key: Option<&str>) -> Result<(), CredentialError> {
        let entry = self.entry()?;

        match key.map(str::trim) {
            Some(k) if !k.is_empty() => {
                entry
                    .set_password(k)
                    .map_err(|e| CredentialError::Keyring(format!("failed to store key: {}", e)))?;
                log::info!("Credentials: stored API key in keyring");
            }
            _ => self.delete()?,
        }

        Ok(())
    }

    pub fn delete(&self) -> Result<(), CredentialError> {
        match self.entry()?.delete_credential() {
            Ok(()) => log::info!("Credentials: deleted API key from keyring"),
            Err(keyring::Error::NoEntry) => {}
            Err(e) => {
                return Err(CredentialError::Keyring(format!(
                    "failed to delete key: {}",
                    e
                )))
            }
        }
        Ok(())
    }
}

impl CredentialSource for KeyringCredentials {
    fn api_key(&self) -> Option<String> {
        let entry = match self.entry() {
            Ok(e) => e,
            Err(e) => {
                log::warn!("Credentials: {}", e);
                return None;
            }
        };

        match entry.get_password() {
            Ok(key) => non_empty(key),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                log::warn!("Credentials: failed to retrieve key: {}", e);
                None
            }
        }
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}

/// A key supplied directly, e.g. from a command-line flag
#[derive(Debug, Clone)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(key: Option<String>) -> Self {
        Self(key)
    }
}

impl CredentialSource for StaticCredential {
    fn api_key(&self) -> Option<String> {
        self.0.clone().and_then(non_empty)
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// First source that yields a key wins
#[derive(Default)]
pub struct CredentialChain {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl CredentialChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment first, then the keyring
    pub fn standard() -> Self {
        Self::new()
            .with(EnvCredentials)
            .with(KeyringCredentials::default())
    }

    pub fn with(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

impl CredentialSource for CredentialChain {
    fn api_key(&self) -> Option<String> {
        self.sources.iter().find_map(|source| {
            let key = source.api_key();
            if key.is_some() {
                log::debug!("Credentials: using API key from {}", source.name());
            }
            key
        })
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

/// Validate a key against the provider's account endpoint
///
/// `Ok(true)` if accepted, `Ok(false)` if rejected, `Err` on network errors
/// or unexpected responses.
pub async fn validate_api_key(key: &str) -> Result<bool, CredentialError> {
    validate_api_key_at(API_BASE_URL, key).await
}

/// Same as [`validate_api_key`] against an explicit base URL
pub async fn validate_api_key_at(base_url: &str, key: &str) -> Result<bool, CredentialError> {
    let key = key.trim();
    if key.is_empty() {
        return Ok(false);
    }

    let client = reqwest::Client::builder()
        .timeout(VALIDATION_TIMEOUT)
        .build()
        .map_err(|e| CredentialError::Network(e.to_string()))?;

    let url = format!("{}/v1/user", base_url.trim_end_matches('/'));

    let response = client
        .get(&url)
        .header("xi-api-key", key)
        .send()
        .await
        .map_err(|e| CredentialError::Network(e.to_string()))?;

    match response.status().as_u16() {
        200 => Ok(true),
        401 => {
            log::debug!("Key validation: unauthorized (invalid key)");
            Ok(false)
        }
        status => {
            log::warn!("Key validation: unexpected status {}", status);
            Err(CredentialError::UnexpectedStatus(status))
        }
    }
}

/// Masked version of a key for display (e.g. "sk_...abc123")
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<&'static str>);

    impl CredentialSource for Fixed {
        fn api_key(&self) -> Option<String> {
            self.0.map(str::to_string)
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("sk_1234567890abcdef"), "sk_...abcdef");
        assert_eq!(mask_key("short"), "*****");
        assert_eq!(mask_key(""), "");
    }

    #[test]
    fn test_static_credential_filters_blank() {
        assert_eq!(StaticCredential::new(Some("  ".into())).api_key(), None);
        assert_eq!(StaticCredential::new(None).api_key(), None);
        assert_eq!(
            StaticCredential::new(Some(" key ".into())).api_key(),
            Some("key".to_string())
        );
    }

    #[test]
    fn test_chain_returns_first_available() {
        let chain = CredentialChain::new()
            .with(Fixed(None))
            .with(Fixed(Some("second")))
            .with(Fixed(Some("third")));
        assert_eq!(chain.api_key(), Some("second".to_string()));

        let empty = CredentialChain::new().with(Fixed(None));
        assert_eq!(empty.api_key(), None);
    }

    #[tokio::test]
    async fn test_validate_empty_key_is_invalid() {
        // No request is made for an empty key
        assert_eq!(validate_api_key_at("http://127.0.0.1:9", "  ").await, Ok(false));
    }

    #[test]
    fn test_credential_error_display() {
        assert_eq!(
            CredentialError::UnexpectedStatus(500).to_string(),
            "Unexpected API response: 500"
        );
    }
}
