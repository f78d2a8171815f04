//! Cloud credentials for runner subprocesses.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::RunnerResult;

/// Supplies environment variables that authenticate a runner against an account.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    async fn environment(&self, account_id: &str, region: &str) -> RunnerResult<HashMap<String, String>>;
}

/// Relies on whatever credentials the engine's own environment carries.
#[derive(Debug, Clone, Default)]
pub struct AmbientCredentials;

#[async_trait]
impl CredentialsProvider for AmbientCredentials {
    async fn environment(&self, _account_id: &str, _region: &str) -> RunnerResult<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}
