//! Client construction seam.
//!
//! The wire-level translation to each provider lives outside this
//! workspace; the orchestrator only asks a factory for a [`ChatClient`]
//! when a provider is first used.

use std::sync::Arc;

use krait_config::ProviderConfig;
use krait_core::client::ChatClient;
use krait_core::error::Error;

pub trait ClientFactory: Send + Sync {
    /// Build a client for `provider_name` from its validated config.
    fn build(
        &self,
        provider_name: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn ChatClient>, Error>;
}
