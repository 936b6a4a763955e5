use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::protocol::ConfigError;
use crate::stage::{Stage, StageDef, StageFlags};
use crate::stages;

static GLOBAL: OnceCell<Arc<StageRegistry>> = OnceCell::new();

/// Installs the process wide registry. Only the first call succeeds.
pub fn install(registry: StageRegistry) -> Result<Arc<StageRegistry>, ConfigError> {
    let registry = Arc::new(registry);
    GLOBAL.set(Arc::clone(&registry)).map_err(|_rejected| ConfigError::invalid("stage registry is already installed"))?;
    Ok(registry)
}

/// The process wide registry, if one was installed.
pub fn global() -> Option<Arc<StageRegistry>> {
    GLOBAL.get().cloned()
}

/// The frozen table of stage templates, looked up by name.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<StageDef>>,
}

impl StageRegistry {
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::new()
    }

    /// A registry holding only the built in stages.
    pub fn with_builtins() -> Self {
        Self { stages: builtins().into_iter().map(|def| (def.name().to_string(), Arc::new(def))).collect() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<StageDef>> {
        self.stages.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Looks up a stage and checks it has the given role.
    pub(crate) fn get_role(&self, name: &str, role: StageFlags, role_name: &'static str) -> Result<Arc<StageDef>, ConfigError> {
        let stage = self.get(name).ok_or_else(|| ConfigError::missing_stage(name))?;
        if !stage.flags().contains(role) {
            return Err(ConfigError::WrongRole { name: name.to_string(), role: role_name });
        }
        Ok(stage)
    }
}

/// Collects stage templates before the registry is frozen.
///
/// Registration errors are remembered and reported by [`build`](Self::build).
#[derive(Default)]
pub struct StageRegistryBuilder {
    stages: HashMap<String, StageDef>,
    error: Option<ConfigError>,
}

impl StageRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the built in handlers, filters and connectors.
    pub fn builtins(mut self) -> Self {
        for def in builtins() {
            self = self.register(def);
        }
        self
    }

    pub fn handler(self, name: &str, flags: StageFlags, ops: Arc<dyn Stage>) -> Self {
        self.register(StageDef::new(name, flags | StageFlags::HANDLER, ops))
    }

    pub fn filter(self, name: &str, flags: StageFlags, ops: Arc<dyn Stage>) -> Self {
        self.register(StageDef::new(name, flags | StageFlags::FILTER, ops))
    }

    pub fn connector(self, name: &str, flags: StageFlags, ops: Arc<dyn Stage>) -> Self {
        self.register(StageDef::new(name, flags | StageFlags::CONNECTOR, ops))
    }

    /// Registers a copy of `from` bound to `extensions` under a new name.
    pub fn clone_stage<I, S>(mut self, from: &str, name: &str, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(original) = self.stages.get(from) else {
            self.error.get_or_insert_with(|| ConfigError::missing_stage(from));
            return self;
        };
        let clone = original.clone_as(name).with_extensions(extensions);
        self.register(clone)
    }

    pub fn register(mut self, def: StageDef) -> Self {
        if self.stages.contains_key(def.name()) {
            self.error.get_or_insert_with(|| ConfigError::DuplicateStage { name: def.name().to_string() });
            return self;
        }
        debug!(stage = def.name(), flags = ?def.flags(), "register stage");
        self.stages.insert(def.name().to_string(), def);
        self
    }

    pub fn build(self) -> Result<StageRegistry, ConfigError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(StageRegistry { stages: self.stages.into_iter().map(|(name, def)| (name, Arc::new(def))).collect() })
    }
}

fn builtins() -> Vec<StageDef> {
    vec![
        stages::pass::definition(),
        stages::file::definition(),
        stages::dir::definition(),
        stages::chunk::definition(),
        stages::range::definition(),
        stages::net::definition(),
        stages::send::definition(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{CHUNK_FILTER, NET_CONNECTOR, PASS_HANDLER};

    struct Echo;

    impl Stage for Echo {}

    #[test]
    fn builtins_are_registered() {
        let registry = StageRegistry::with_builtins();
        assert_eq!(registry.len(), 7);
        assert!(registry.get(PASS_HANDLER).unwrap().is_handler());
        assert!(registry.get(CHUNK_FILTER).unwrap().is_filter());
        assert!(registry.get(NET_CONNECTOR).unwrap().is_connector());
        assert!(registry.get_role(PASS_HANDLER, StageFlags::CONNECTOR, "connector").is_err());
    }

    #[test]
    fn custom_and_cloned_stages() {
        let registry = StageRegistry::builder()
            .builtins()
            .handler("echoHandler", StageFlags::GET | StageFlags::POST | StageFlags::VIRTUAL, Arc::new(Echo))
            .clone_stage(CHUNK_FILTER, "textChunkFilter", ["txt"])
            .build()
            .unwrap();

        let echo = registry.get("echoHandler").unwrap();
        assert!(echo.is_handler());
        assert!(echo.flags().contains(StageFlags::VIRTUAL));

        let cloned = registry.get("textChunkFilter").unwrap();
        assert!(cloned.is_filter());
        assert!(cloned.accepts_extension(Some("txt")));
        assert!(Arc::ptr_eq(cloned.ops(), registry.get(CHUNK_FILTER).unwrap().ops()));
    }

    #[test]
    fn registration_errors_surface_at_build() {
        let duplicate = StageRegistry::builder().builtins().handler(PASS_HANDLER, StageFlags::ALL, Arc::new(Echo)).build();
        assert!(matches!(duplicate, Err(ConfigError::DuplicateStage { .. })));

        let missing = StageRegistry::builder().clone_stage("nope", "copy", ["x"]).build();
        assert!(matches!(missing, Err(ConfigError::MissingStage { .. })));
    }
}
