// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The client facade.
//!
//! A [`Client`] binds provider plugins to their usage managers and exposes
//! the request API: `execute`, `execute_streaming`, availability stats, and
//! the admin surface. Configuration is resolved once at build time
//! (provider defaults, then environment overrides) and is immutable for
//! the life of the process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::executor::{ExecuteOptions, RequestExecutor};
use crate::identity::CredentialRegistry;
use crate::manager::UsageManager;
use crate::provider::{ChunkStream, Provider, ProviderResponse};
use crate::refresher::RefresherHandle;
use crate::selection::AvailabilityStats;

/// Builder for [`Client`]
#[derive(Default)]
pub struct ClientBuilder {
    providers: Vec<Arc<dyn Provider>>,
    storage_dir: Option<PathBuf>,
    options: ExecuteOptions,
}

impl ClientBuilder {
    /// Register a provider plugin
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Persist usage snapshots under this directory (one
    /// `usage_<provider>.json` per provider). Without it, state lives only
    /// in memory.
    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Default execution options for requests that pass `None`
    #[must_use]
    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the client: resolve each provider's configuration, load
    /// persisted usage state, register credentials, and start background
    /// refreshers (when called inside a tokio runtime).
    #[must_use]
    pub fn build(self) -> Client {
        let registry = Arc::new(CredentialRegistry::new());
        let mut providers = HashMap::new();
        let mut managers = HashMap::new();
        let mut refreshers = Vec::new();

        for provider in self.providers {
            let name = provider.name().to_string();
            let config = provider.usage_config().with_env_overrides(&name);
            let storage_path = self
                .storage_dir
                .as_ref()
                .map(|dir| dir.join(format!("usage_{name}.json")));

            let manager = Arc::new(UsageManager::new(
                &name,
                config,
                Arc::clone(&registry),
                storage_path.as_deref(),
            ));
            manager.load_from_storage();

            for accessor in provider.credentials() {
                let priority = provider.credential_priority(&accessor);
                let tier = provider.credential_tier_name(&accessor);
                manager.register_credential(&accessor, priority, tier, None);
            }

            if tokio::runtime::Handle::try_current().is_ok() {
                if let Some(handle) =
                    RefresherHandle::spawn(Arc::clone(&provider), Arc::clone(&manager))
                {
                    refreshers.push(handle);
                }
            } else if provider.refresh_interval().is_some() {
                warn!(
                    provider = %name,
                    "no tokio runtime at build time, background refresher not started"
                );
            }

            debug!(provider = %name, "provider registered");
            providers.insert(name.clone(), provider);
            managers.insert(name, manager);
        }

        Client {
            providers,
            managers,
            refreshers: Mutex::new(refreshers),
            options: self.options,
        }
    }
}

/// The multi-credential rotator client
pub struct Client {
    providers: HashMap<String, Arc<dyn Provider>>,
    managers: HashMap<String, Arc<UsageManager>>,
    refreshers: Mutex<Vec<RefresherHandle>>,
    options: ExecuteOptions,
}

impl Client {
    /// Start building a client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Execute a request against a provider's model, rotating across its
    /// credentials as needed
    pub async fn execute(
        &self,
        provider: &str,
        model: &str,
        payload: &Value,
        options: Option<ExecuteOptions>,
    ) -> Result<ProviderResponse> {
        let (plugin, manager) = self.lookup(provider)?;
        let executor = RequestExecutor::new(plugin, manager);
        executor
            .execute(model, payload, &options.unwrap_or_else(|| self.options.clone()))
            .await
    }

    /// Streaming variant of [`Self::execute`]
    pub async fn execute_streaming(
        &self,
        provider: &str,
        model: &str,
        payload: &Value,
        options: Option<ExecuteOptions>,
    ) -> Result<ChunkStream> {
        let (plugin, manager) = self.lookup(provider)?;
        let executor = RequestExecutor::new(plugin, manager);
        executor
            .execute_streaming(model, payload, &options.unwrap_or_else(|| self.options.clone()))
            .await
    }

    /// Availability summary for a provider's model
    pub fn availability_stats(
        &self,
        provider: &str,
        model: &str,
        quota_group: Option<&str>,
    ) -> Result<AvailabilityStats> {
        let (plugin, manager) = self.lookup(provider)?;
        let group = quota_group
            .map(str::to_string)
            .or_else(|| plugin.quota_group(model));
        Ok(manager.availability_stats(model, group.as_deref()))
    }

    /// Apply a manual cooldown to a credential
    pub fn apply_cooldown(
        &self,
        provider: &str,
        accessor: &str,
        duration: f64,
        reason: &str,
        model_or_group: Option<&str>,
    ) -> Result<()> {
        let (_, manager) = self.lookup(provider)?;
        manager.apply_cooldown(accessor, duration, reason, model_or_group);
        Ok(())
    }

    /// Clear a cooldown from a credential
    pub fn clear_cooldown(
        &self,
        provider: &str,
        accessor: &str,
        model_or_group: Option<&str>,
    ) -> Result<()> {
        let (_, manager) = self.lookup(provider)?;
        manager.clear_cooldown(accessor, model_or_group);
        Ok(())
    }

    /// Mark a credential fair-cycle exhausted
    pub fn mark_exhausted(
        &self,
        provider: &str,
        accessor: &str,
        model_or_group: &str,
        reason: &str,
    ) -> Result<()> {
        let (_, manager) = self.lookup(provider)?;
        manager.mark_exhausted(accessor, model_or_group, reason);
        Ok(())
    }

    /// The usage manager for a provider, for read APIs and refresh hooks
    #[must_use]
    pub fn usage(&self, provider: &str) -> Option<Arc<UsageManager>> {
        self.managers.get(provider).cloned()
    }

    /// Stop background refreshers and flush all pending usage snapshots
    pub async fn shutdown(&self) {
        let refreshers: Vec<RefresherHandle> = std::mem::take(&mut *self.refreshers.lock());
        for refresher in refreshers {
            refresher.stop().await;
        }
        for manager in self.managers.values() {
            manager.flush().await;
        }
    }

    fn lookup(&self, provider: &str) -> Result<(Arc<dyn Provider>, Arc<UsageManager>)> {
        let plugin = self
            .providers
            .get(provider)
            .ok_or_else(|| Error::UnknownProvider(provider.to_string()))?;
        let manager = self
            .managers
            .get(provider)
            .ok_or_else(|| Error::UnknownProvider(provider.to_string()))?;
        Ok((Arc::clone(plugin), Arc::clone(manager)))
    }
}
