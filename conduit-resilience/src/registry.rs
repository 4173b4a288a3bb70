//! Per-provider orchestrators built from configuration

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use conduit_config::ResilienceConfig;

use crate::hooks::HookRegistry;
use crate::orchestrator::ResilienceOrchestrator;

/// Owns one [`ResilienceOrchestrator`] per provider for the process lifetime
///
/// Orchestrators are built lazily from the provider's profile (or the
/// defaults) on first use, and every later lookup returns the same instance
/// so breaker and limiter state is shared by all callers of that provider.
pub struct ResilienceRegistry {
    config: ResilienceConfig,
    hooks: HookRegistry,
    orchestrators: Mutex<HashMap<String, Arc<ResilienceOrchestrator>>>,
}

impl ResilienceRegistry {
    pub fn new(config: ResilienceConfig) -> Self {
        Self::with_hooks(config, HookRegistry::new())
    }

    pub fn with_hooks(config: ResilienceConfig, hooks: HookRegistry) -> Self {
        Self {
            config,
            hooks,
            orchestrators: Mutex::new(HashMap::new()),
        }
    }

    /// Orchestrator for `provider`, created on first use
    pub fn get(&self, provider: &str) -> Arc<ResilienceOrchestrator> {
        let mut orchestrators = self.orchestrators.lock();

        if let Some(existing) = orchestrators.get(provider) {
            return existing.clone();
        }

        log::debug!("Creating resilience orchestrator for provider '{}'", provider);
        let orchestrator = Arc::new(ResilienceOrchestrator::from_profile(
            provider,
            self.config.profile_for(provider),
            self.hooks.clone(),
        ));
        orchestrators.insert(provider.to_string(), orchestrator.clone());
        orchestrator
    }

    /// Hooks shared by every orchestrator of this registry
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Names of providers with an orchestrator created so far
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.orchestrators.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ResilienceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}
