//! Language → provider dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use super::provider::SandboxProvider;
use crate::runtime::Language;

/// Maps each language to the provider that runs it.
///
/// Languages without an entry are rejected by the engine as unsupported
/// before anything is started.
#[derive(Clone, Default)]
pub struct SandboxRegistry {
    providers: HashMap<Language, Arc<dyn SandboxProvider>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One provider for every language.
    pub fn uniform(provider: Arc<dyn SandboxProvider>) -> Self {
        [Language::JavaScript, Language::Python, Language::Go, Language::Shell]
            .into_iter()
            .fold(Self::new(), |registry, lang| registry.with(lang, Arc::clone(&provider)))
    }

    /// Register (or replace) the provider for `language`.
    pub fn with(mut self, language: Language, provider: Arc<dyn SandboxProvider>) -> Self {
        self.providers.insert(language, provider);
        self
    }

    pub fn resolve(&self, language: Language) -> Option<Arc<dyn SandboxProvider>> {
        self.providers.get(&language).cloned()
    }

    /// Registered languages with their provider names, for startup logs.
    pub fn describe(&self) -> Vec<(Language, &'static str)> {
        let mut entries: Vec<_> = self
            .providers
            .iter()
            .map(|(lang, p)| (*lang, p.name()))
            .collect();
        entries.sort_by_key(|(lang, _)| lang.as_str());
        entries
    }
}

impl std::fmt::Debug for SandboxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.describe()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::MockSandbox;

    #[test]
    fn uniform_covers_every_language() {
        let registry = SandboxRegistry::uniform(Arc::new(MockSandbox::echo()));
        for lang in [Language::JavaScript, Language::Python, Language::Go, Language::Shell] {
            assert_eq!(registry.resolve(lang).map(|p| p.name()), Some("mock"));
        }
    }

    #[test]
    fn missing_language_resolves_to_none() {
        let registry = SandboxRegistry::new().with(Language::Python, Arc::new(MockSandbox::echo()));
        assert!(registry.resolve(Language::Python).is_some());
        assert!(registry.resolve(Language::Go).is_none());
        assert_eq!(registry.describe(), vec![(Language::Python, "mock")]);
    }
}
