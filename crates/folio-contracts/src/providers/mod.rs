/// Registry of named backends, kept in registration order.
#[derive(Debug, Clone)]
pub struct ProviderRegistry<T: NamedProvider> {
    providers: Vec<T>,
}

pub trait NamedProvider {
    fn name(&self) -> &str;
}

impl<T: NamedProvider> ProviderRegistry<T> {
    pub fn new(providers: Vec<T>) -> Self {
        Self { providers }
    }

    /// Case-insensitive lookup on the trimmed name.
    pub fn get(&self, name: &str) -> Option<&T> {
        let wanted = name.trim();
        self.providers
            .iter()
            .find(|provider| provider.name().eq_ignore_ascii_case(wanted))
    }

    pub fn list(&self) -> Vec<String> {
        let mut names = self
            .providers
            .iter()
            .map(|provider| provider.name().to_string())
            .collect::<Vec<String>>();
        names.sort();
        names
    }

    pub fn providers(&self) -> &[T] {
        self.providers.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::{NamedProvider, ProviderRegistry};

    #[derive(Clone, Debug)]
    struct Backend {
        name: &'static str,
    }

    impl NamedProvider for Backend {
        fn name(&self) -> &str {
            self.name
        }
    }

    fn registry() -> ProviderRegistry<Backend> {
        ProviderRegistry::new(vec![
            Backend { name: "gemini" },
            Backend { name: "chat" },
            Backend { name: "dryrun" },
        ])
    }

    #[test]
    fn lookup_ignores_case_and_padding() {
        let registry = registry();
        assert_eq!(registry.get(" Gemini ").map(|b| b.name), Some("gemini"));
        assert!(registry.get("imagen").is_none());
    }

    #[test]
    fn list_is_sorted_but_storage_keeps_registration_order() {
        let registry = registry();
        assert_eq!(registry.list(), vec!["chat", "dryrun", "gemini"]);
        assert_eq!(
            registry
                .providers()
                .iter()
                .map(|backend| backend.name)
                .collect::<Vec<_>>(),
            vec!["gemini", "chat", "dryrun"]
        );
    }
}
