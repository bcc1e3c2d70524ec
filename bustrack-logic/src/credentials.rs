use tokio::sync::Mutex;

use crate::prelude::*;

/// Secure storage for the signed in user's bearer token
pub trait CredentialStore: Send + Sync + 'static {
    fn get_token(&self) -> impl Future<Output = Result<Option<String>>> + Send;
    fn set_token(&self, token: &str) -> impl Future<Output = Result> + Send;
    fn clear_token(&self) -> impl Future<Output = Result> + Send;
}

/// Keeps the token in memory only, it's gone when the process exits
#[derive(Default)]
pub struct MemoryCredentials(Mutex<Option<String>>);

impl MemoryCredentials {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self(Mutex::new(Some(token.into())))
    }
}

impl CredentialStore for MemoryCredentials {
    async fn get_token(&self) -> Result<Option<String>> {
        Ok(self.0.lock().await.clone())
    }

    async fn set_token(&self, token: &str) -> Result {
        *self.0.lock().await = Some(token.to_string());
        Ok(())
    }

    async fn clear_token(&self) -> Result {
        *self.0.lock().await = None;
        Ok(())
    }
}
