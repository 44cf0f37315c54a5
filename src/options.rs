//! Engine configuration.

use std::sync::Arc;

/// Options of one manager instance.
///
/// The pseudo-key names are interpreted by every wrapper owned by the
/// manager; any other key is delegated to the underlying source.
#[derive(Clone, Debug)]
pub struct Options {
    /// When false, `run`/`run_deferred` are no-ops.
    pub enabled: bool,
    /// When true, writes outside a batch call `run()` synchronously instead
    /// of scheduling a deferred pass.
    pub immediate_reaction: bool,
    /// Enables prototype-chain-aware read registration.
    pub prototypes: bool,
    /// Pseudo-key subscribing to any own-key change on a record.
    pub watch_key: Arc<str>,
    /// Pseudo-key subscribing transitively through nested records.
    pub watch_deep_key: Arc<str>,
    /// Pseudo-key returning the underlying source.
    pub data_source_key: Arc<str>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            enabled: true,
            immediate_reaction: false,
            prototypes: false,
            watch_key: Arc::from("$$watch"),
            watch_deep_key: Arc::from("$$watchDeep"),
            data_source_key: Arc::from("$$dataSource"),
        }
    }
}

impl Options {
    /// Merge a partial update over the current record. The empty patch is
    /// the identity.
    pub fn apply(&mut self, patch: OptionsPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(immediate) = patch.immediate_reaction {
            self.immediate_reaction = immediate;
        }
        if let Some(prototypes) = patch.prototypes {
            self.prototypes = prototypes;
        }
        if let Some(key) = patch.watch_key {
            self.watch_key = key;
        }
        if let Some(key) = patch.watch_deep_key {
            self.watch_deep_key = key;
        }
        if let Some(key) = patch.data_source_key {
            self.data_source_key = key;
        }
    }
}

/// Partial options, merged over the current record by
/// [`Manager::set_options`](crate::Manager::set_options).
#[derive(Clone, Debug, Default)]
pub struct OptionsPatch {
    pub enabled: Option<bool>,
    pub immediate_reaction: Option<bool>,
    pub prototypes: Option<bool>,
    pub watch_key: Option<Arc<str>>,
    pub watch_deep_key: Option<Arc<str>>,
    pub data_source_key: Option<Arc<str>>,
}

impl OptionsPatch {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn immediate_reaction(mut self, immediate: bool) -> Self {
        self.immediate_reaction = Some(immediate);
        self
    }

    pub fn prototypes(mut self, prototypes: bool) -> Self {
        self.prototypes = Some(prototypes);
        self
    }

    pub fn watch_key(mut self, key: &str) -> Self {
        self.watch_key = Some(Arc::from(key));
        self
    }

    pub fn watch_deep_key(mut self, key: &str) -> Self {
        self.watch_deep_key = Some(Arc::from(key));
        self
    }

    pub fn data_source_key(mut self, key: &str) -> Self {
        self.data_source_key = Some(Arc::from(key));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_pseudo_keys() {
        let options = Options::default();
        assert!(options.enabled);
        assert!(!options.immediate_reaction);
        assert!(!options.prototypes);
        assert_eq!(&*options.watch_key, "$$watch");
        assert_eq!(&*options.watch_deep_key, "$$watchDeep");
        assert_eq!(&*options.data_source_key, "$$dataSource");
    }

    #[test]
    fn empty_patch_is_identity() {
        let mut options = Options::default();
        options.apply(OptionsPatch::default());
        assert!(options.enabled);
        assert_eq!(&*options.watch_key, "$$watch");
    }

    #[test]
    fn patch_merges_only_set_fields() {
        let mut options = Options::default();
        options.apply(OptionsPatch::default().prototypes(true).watch_key("@watch"));
        assert!(options.prototypes);
        assert_eq!(&*options.watch_key, "@watch");
        assert_eq!(&*options.watch_deep_key, "$$watchDeep");
    }
}
