//! Named stage factories
//!
//! The graph never constructs stages directly: a `StageConfig` names a
//! factory and carries free-form properties, and the registry turns it into
//! a boxed stage. Alternate topologies are therefore data, not code.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConstructionError;

use super::stage::{PipelineStage, StageKind};

/// Declarative description of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub kind: StageKind,
    pub factory: String,
    #[serde(default)]
    pub properties: toml::Table,
}

impl StageConfig {
    pub fn new(name: &str, kind: StageKind, factory: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            factory: factory.to_string(),
            properties: toml::Table::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    fn invalid(&self, key: &str, reason: impl ToString) -> ConstructionError {
        ConstructionError::invalid(&self.name, key, reason)
    }

    pub fn str_or(&self, key: &str, default: &str) -> Result<String, ConstructionError> {
        match self.properties.get(key) {
            None => Ok(default.to_string()),
            Some(toml::Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {}", other))),
        }
    }

    pub fn required_str(&self, key: &str) -> Result<String, ConstructionError> {
        match self.properties.get(key) {
            Some(toml::Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {}", other))),
            None => Err(self.invalid(key, "missing")),
        }
    }

    pub fn u32_or(&self, key: &str, default: u32) -> Result<u32, ConstructionError> {
        match self.properties.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(i)) => {
                u32::try_from(*i).map_err(|_| self.invalid(key, format!("{} is out of range", i)))
            }
            Some(other) => Err(self.invalid(key, format!("expected an integer, got {}", other))),
        }
    }

    pub fn u64_or(&self, key: &str, default: u64) -> Result<u64, ConstructionError> {
        match self.properties.get(key) {
            None => Ok(default),
            Some(toml::Value::Integer(i)) => {
                u64::try_from(*i).map_err(|_| self.invalid(key, format!("{} is out of range", i)))
            }
            Some(other) => Err(self.invalid(key, format!("expected an integer, got {}", other))),
        }
    }

    /// A string list; a single string is accepted as a list of one
    pub fn str_list(&self, key: &str) -> Result<Vec<String>, ConstructionError> {
        match self.properties.get(key) {
            None => Ok(Vec::new()),
            Some(toml::Value::String(s)) => Ok(vec![s.clone()]),
            Some(toml::Value::Array(items)) => items
                .iter()
                .map(|v| match v {
                    toml::Value::String(s) => Ok(s.clone()),
                    other => Err(self.invalid(key, format!("expected strings, got {}", other))),
                })
                .collect(),
            Some(other) => Err(self.invalid(key, format!("expected a list, got {}", other))),
        }
    }

    /// Parse a string property with `FromStr`
    pub fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConstructionError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.properties.get(key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => s.parse().map(Some).map_err(|e| self.invalid(key, e)),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {}", other))),
        }
    }
}

pub type StageFactory =
    Box<dyn Fn(&StageConfig) -> Result<Box<dyn PipelineStage>, ConstructionError> + Send + Sync>;

/// Maps factory names to stage constructors
#[derive(Default)]
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory, replacing any previous one with the same name
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&StageConfig) -> Result<Box<dyn PipelineStage>, ConstructionError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Build the stage described by `config`
    pub fn create(&self, config: &StageConfig) -> Result<Box<dyn PipelineStage>, ConstructionError> {
        let factory = self
            .factories
            .get(&config.factory)
            .ok_or_else(|| ConstructionError::UnknownFactory(config.factory.clone()))?;
        let stage = factory(config)?;
        if stage.kind() != config.kind {
            return Err(ConstructionError::KindMismatch {
                factory: config.factory.clone(),
                expected: config.kind,
                actual: stage.kind(),
            });
        }
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::caps::PixelLayout;

    #[test]
    fn test_property_accessors() {
        let config = StageConfig::new("enc", StageKind::Encoder, "encode")
            .with("bitrate", 4_000_000i64)
            .with("backend", "ffmpeg")
            .with("format", "I420");

        assert_eq!(config.u32_or("bitrate", 0).unwrap(), 4_000_000);
        assert_eq!(config.u32_or("missing", 7).unwrap(), 7);
        assert_eq!(config.str_or("backend", "none").unwrap(), "ffmpeg");
        assert_eq!(
            config.parsed::<PixelLayout>("format").unwrap(),
            Some(PixelLayout::I420)
        );
        assert_eq!(config.str_list("backend").unwrap(), vec!["ffmpeg".to_string()]);

        assert!(matches!(
            config.u32_or("backend", 0),
            Err(ConstructionError::InvalidProperty { .. })
        ));
        assert!(matches!(
            config.required_str("host"),
            Err(ConstructionError::InvalidProperty { .. })
        ));
        let negative = StageConfig::new("x", StageKind::Sink, "udp").with("port", -1i64);
        assert!(negative.u32_or("port", 0).is_err());
    }

    #[test]
    fn test_unknown_factory() {
        let registry = StageRegistry::new();
        let err = registry
            .create(&StageConfig::new("a", StageKind::Source, "nope"))
            .err()
            .unwrap();
        assert!(matches!(err, ConstructionError::UnknownFactory(name) if name == "nope"));
    }
}
