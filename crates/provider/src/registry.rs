use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::DynProvider;

/// Maps system names to the providers that reach them.
///
/// Built once at startup and then shared immutably.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn DynProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its [`DynProvider::name`], replacing any
    /// previous provider of that name.
    pub fn register(&mut self, provider: Arc<dyn DynProvider>) {
        let name = provider.name().to_owned();
        self.providers.insert(name, provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered system names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::echo::EchoProvider;

    #[test]
    fn register_and_lookup() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(EchoProvider::new("marketplace")));
        registry.register(Arc::new(EchoProvider::new("cns")));

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("cns"));
        assert!(registry.get("bytestar").is_none());
        assert_eq!(registry.list(), vec!["cns", "marketplace"]);
    }

    #[test]
    fn re_register_replaces() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(EchoProvider::new("cns")));
        registry.register(Arc::new(EchoProvider::new("cns")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_registry() {
        let registry = ProviderRegistry::default();
        assert!(registry.is_empty());
    }
}
