use futures::FutureExt;
use legion_core::config::GenerationDefaults;
use legion_core::types::{GenerationRequest, GenerationResult, ProviderKind};
use legion_core::Config;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::factory::create_provider;
use crate::Provider;

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: ProviderKind,
    pub available: bool,
    pub priority: usize,
}

/// Ordered list of model backends with sequential fallback.
pub struct ModelManager {
    providers: RwLock<Vec<Arc<dyn Provider>>>,
    defaults: GenerationDefaults,
}

impl ModelManager {
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers: RwLock::new(providers),
            defaults: GenerationDefaults::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: GenerationDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Providers in `modelPriorities` order, skipping disabled and unknown entries.
    pub fn from_config(config: &Config) -> Self {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
        for name in &config.model_priorities {
            let cfg = config.providers.get(name).cloned().unwrap_or_default();
            if !cfg.enabled {
                debug!(provider = %name, "Provider disabled in config");
                continue;
            }
            match create_provider(name, &cfg) {
                Ok(p) => providers.push(p),
                Err(e) => warn!(provider = %name, error = %e, "Skipping provider"),
            }
        }
        info!(count = providers.len(), "Model providers configured");
        Self::new(providers).with_defaults(config.generation.clone())
    }

    pub fn defaults(&self) -> &GenerationDefaults {
        &self.defaults
    }

    fn snapshot(&self) -> Vec<Arc<dyn Provider>> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.snapshot().iter().map(|p| p.name().to_string()).collect()
    }

    pub async fn generate(
        &self,
        prompt: &str,
        context: Option<&str>,
        max_tokens: u32,
        temperature: f32,
    ) -> GenerationResult {
        let request = GenerationRequest {
            prompt: prompt.to_string(),
            context: context.map(str::to_string),
            max_tokens,
            temperature,
        };
        self.generate_request(&request).await
    }

    /// Try each provider in priority order and return the first success.
    ///
    /// Unavailable providers are skipped silently. Failures (errors or panics) are logged
    /// and the next provider is tried. Never fails: exhaustion yields a result with `error` set.
    pub async fn generate_request(&self, request: &GenerationRequest) -> GenerationResult {
        let providers = self.snapshot();
        let primary = providers.first().map(|p| p.name().to_string());

        for provider in &providers {
            let name = provider.name();
            if !provider.is_available().await {
                debug!(provider = %name, "Provider unavailable, skipping");
                continue;
            }

            let started = Instant::now();
            let attempt = AssertUnwindSafe(provider.generate(request)).catch_unwind().await;
            let elapsed = started.elapsed().as_secs_f64();

            match attempt {
                Ok(Ok(completion)) => {
                    let fallback_used = primary.as_deref() != Some(name);
                    info!(
                        provider = %name,
                        response_time = elapsed,
                        fallback_used,
                        "Generation succeeded"
                    );
                    return GenerationResult::from_completion(completion, name, elapsed, fallback_used);
                }
                Ok(Err(e)) => {
                    warn!(provider = %name, error = %e, "Provider failed, trying next");
                }
                Err(_) => {
                    warn!(provider = %name, "Provider panicked, trying next");
                }
            }
        }

        warn!("All model providers failed");
        GenerationResult::failed("All model providers failed")
    }

    pub async fn available_providers(&self) -> Vec<String> {
        let mut out = Vec::new();
        for p in self.snapshot() {
            if p.is_available().await {
                out.push(p.name().to_string());
            }
        }
        out
    }

    pub async fn provider_status(&self) -> Vec<ProviderStatus> {
        let mut out = Vec::new();
        for (priority, p) in self.snapshot().into_iter().enumerate() {
            out.push(ProviderStatus {
                name: p.name().to_string(),
                kind: p.kind(),
                available: p.is_available().await,
                priority,
            });
        }
        out
    }

    /// Move `name` to position `index` (clamped to the end). Returns false if unknown.
    pub fn set_provider_priority(&self, name: &str, index: usize) -> bool {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        let Some(pos) = providers.iter().position(|p| p.name() == name) else {
            return false;
        };
        let p = providers.remove(pos);
        let index = index.min(providers.len());
        providers.insert(index, p);
        info!(provider = %name, index, "Provider priority changed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use legion_core::types::Completion;
    use legion_core::{Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Unavailable,
        Fails,
        Panics,
        Ok(&'static str),
    }

    struct MockProvider {
        name: &'static str,
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockProvider {
        fn arc(name: &'static str, behavior: Behavior) -> Arc<MockProvider> {
            Arc::new(Self {
                name,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }

        async fn is_available(&self) -> bool {
            !matches!(self.behavior, Behavior::Unavailable)
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Fails => Err(Error::Provider(format!("{} exploded", self.name))),
                Behavior::Panics => panic!("provider bug"),
                Behavior::Ok(text) => Ok(Completion {
                    text: text.to_string(),
                    ..Default::default()
                }),
                Behavior::Unavailable => unreachable!("unavailable providers are never called"),
            }
        }
    }

    #[tokio::test]
    async fn test_fallback_in_priority_order() {
        let a = MockProvider::arc("A", Behavior::Unavailable);
        let b = MockProvider::arc("B", Behavior::Fails);
        let c = MockProvider::arc("C", Behavior::Ok("from C"));
        let d = MockProvider::arc("D", Behavior::Ok("from D"));
        let mgr = ModelManager::new(vec![a.clone(), b.clone(), c.clone(), d.clone()]);

        let r = mgr.generate("prompt", None, 100, 0.2).await;
        assert!(r.is_ok());
        assert_eq!(r.provider, "C");
        assert_eq!(r.text, "from C");
        assert!(r.fallback_used);
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.calls.load(Ordering::SeqCst), 1);
        assert_eq!(d.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_primary_success_is_not_fallback() {
        let mgr = ModelManager::new(vec![
            MockProvider::arc("A", Behavior::Ok("a")),
            MockProvider::arc("B", Behavior::Ok("b")),
        ]);
        let r = mgr.generate("p", Some("ctx"), 10, 0.0).await;
        assert_eq!(r.provider, "A");
        assert!(!r.fallback_used);
        assert!(r.response_time >= 0.0);
    }

    #[tokio::test]
    async fn test_panicking_provider_falls_through() {
        let mgr = ModelManager::new(vec![
            MockProvider::arc("A", Behavior::Panics),
            MockProvider::arc("B", Behavior::Ok("b")),
        ]);
        let r = mgr.generate("p", None, 10, 0.0).await;
        assert_eq!(r.provider, "B");
    }

    #[tokio::test]
    async fn test_all_failed_is_structured_error() {
        let mgr = ModelManager::new(vec![
            MockProvider::arc("A", Behavior::Unavailable),
            MockProvider::arc("B", Behavior::Fails),
        ]);
        let r = mgr.generate("p", None, 10, 0.0).await;
        assert_eq!(r.error.as_deref(), Some("All model providers failed"));
        assert_eq!(r.provider, "none");
        assert!(r.text.is_empty());
        assert!(!r.fallback_used);

        let empty = ModelManager::new(vec![]);
        assert!(!empty.generate("p", None, 10, 0.0).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_and_priority() {
        let mgr = ModelManager::new(vec![
            MockProvider::arc("A", Behavior::Unavailable),
            MockProvider::arc("B", Behavior::Ok("b")),
            MockProvider::arc("C", Behavior::Ok("c")),
        ]);
        assert_eq!(mgr.available_providers().await, vec!["B", "C"]);

        assert!(mgr.set_provider_priority("C", 0));
        assert!(!mgr.set_provider_priority("Z", 0));
        assert_eq!(mgr.provider_names(), vec!["C", "A", "B"]);

        let status = mgr.provider_status().await;
        assert_eq!(status[0].name, "C");
        assert_eq!(status[0].priority, 0);
        assert!(!status[1].available);

        assert!(mgr.set_provider_priority("C", 99));
        assert_eq!(mgr.provider_names(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_from_config_honors_priorities_and_enabled() {
        let mut cfg = Config::default();
        cfg.model_priorities = vec!["openai".into(), "ollama".into(), "bogus".into()];
        if let Some(p) = cfg.providers.get_mut("ollama") {
            p.enabled = false;
        }
        let mgr = ModelManager::from_config(&cfg);
        assert_eq!(mgr.provider_names(), vec!["openai"]);
        assert_eq!(mgr.defaults().max_tokens, 1000);
    }
}
