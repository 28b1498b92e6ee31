use std::env;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

/// Key-fetch contract the proxy core depends on. Backends (OS keyring,
/// encrypted file) live outside the core; they must map their own failures
/// into [`VaultError`] and must report "no entry" as `Ok(None)`, not as an
/// error.
#[async_trait]
pub trait Vault: Send + Sync {
	async fn fetch(&self, provider: &str) -> Result<Option<SecretString>, VaultError>;
}

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
	#[error("vault backend error: {0}")]
	Backend(String),
}

/// Fallback environment variable for each built-in provider, consulted when
/// the vault has no entry.
pub fn fallback_env_var(provider: &str) -> Option<&'static str> {
	Some(match provider {
		"openai" => "OPENAI_API_KEY",
		"anthropic" => "ANTHROPIC_API_KEY",
		"google" => "GOOGLE_API_KEY",
		"mistral" => "MISTRAL_API_KEY",
		"groq" => "GROQ_API_KEY",
		"openrouter" => "OPENROUTER_API_KEY",
		_ => return None,
	})
}

/// Resolve the credential for a provider: vault first, then the fixed
/// environment fallback. `Ok(None)` means no key anywhere; the caller turns
/// that into `tokfence_missing_api_key`.
pub async fn resolve_key(
	vault: &dyn Vault,
	provider: &str,
) -> Result<Option<SecretString>, VaultError> {
	if let Some(key) = vault.fetch(provider).await? {
		if !key.expose_secret().trim().is_empty() {
			return Ok(Some(key));
		}
	}
	if let Some(var) = fallback_env_var(provider)
		&& let Ok(v) = env::var(var)
		&& !v.trim().is_empty()
	{
		return Ok(Some(SecretString::from(v)));
	}
	Ok(None)
}

/// Vault with no entries. The daemon wires in a real backend; tests and the
/// env-only mode use this.
pub struct EmptyVault;

#[async_trait]
impl Vault for EmptyVault {
	async fn fetch(&self, _provider: &str) -> Result<Option<SecretString>, VaultError> {
		Ok(None)
	}
}

/// Fixed in-memory key set, for tests and ephemeral sessions.
pub struct StaticVault {
	keys: std::collections::BTreeMap<String, SecretString>,
}

impl StaticVault {
	pub fn new(keys: impl IntoIterator<Item = (String, String)>) -> Self {
		Self {
			keys: keys
				.into_iter()
				.map(|(p, k)| (p, SecretString::from(k)))
				.collect(),
		}
	}
}

#[async_trait]
impl Vault for StaticVault {
	async fn fetch(&self, provider: &str) -> Result<Option<SecretString>, VaultError> {
		Ok(self.keys.get(provider).cloned())
	}
}
