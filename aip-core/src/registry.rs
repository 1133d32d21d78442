//! Class tags to component constructors.
//!
//! The envelope stores a class tag next to every component's configuration.
//! Restoring a process looks the tag up here; an unknown tag is a restore
//! failure rather than a fallback.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::finder::{DropFolderFinder, Finder, StaticFileFinder};
use crate::processor::{ExportProcessor, NoopProcessor, Processor};
use crate::reader::{CsvReader, CsvSource, JsonReader, JsonSource, Reader, RecordSource};
use crate::{AipError, Result, Settings};

type Constructor<T> = Box<dyn Fn(Settings, Value) -> Result<Box<T>> + Send + Sync>;

pub struct ComponentRegistry {
    finders: BTreeMap<String, Constructor<dyn Finder>>,
    readers: BTreeMap<String, Constructor<dyn Reader>>,
    processors: BTreeMap<String, Constructor<dyn Processor>>,
}

impl ComponentRegistry {
    /// A registry without any classes
    pub fn empty() -> Self {
        Self {
            finders: BTreeMap::new(),
            readers: BTreeMap::new(),
            processors: BTreeMap::new(),
        }
    }

    pub fn register_finder<F>(&mut self, class: &str, constructor: F) -> &mut Self
    where
        F: Fn(Settings, Value) -> Result<Box<dyn Finder>> + Send + Sync + 'static,
    {
        self.finders.insert(class.to_string(), Box::new(constructor));
        self
    }

    pub fn register_reader<F>(&mut self, class: &str, constructor: F) -> &mut Self
    where
        F: Fn(Settings, Value) -> Result<Box<dyn Reader>> + Send + Sync + 'static,
    {
        self.readers.insert(class.to_string(), Box::new(constructor));
        self
    }

    pub fn register_processor<F>(&mut self, class: &str, constructor: F) -> &mut Self
    where
        F: Fn(Settings, Value) -> Result<Box<dyn Processor>> + Send + Sync + 'static,
    {
        self.processors.insert(class.to_string(), Box::new(constructor));
        self
    }

    pub fn build_finder(&self, class: &str, configuration: Settings, state: Value) -> Result<Box<dyn Finder>> {
        let constructor = self.finders.get(class).ok_or_else(|| unknown("finder", class))?;
        constructor(configuration, state)
    }

    pub fn build_reader(&self, class: &str, configuration: Settings, state: Value) -> Result<Box<dyn Reader>> {
        let constructor = self.readers.get(class).ok_or_else(|| unknown("reader", class))?;
        constructor(configuration, state)
    }

    pub fn build_processor(
        &self,
        class: &str,
        configuration: Settings,
        state: Value,
    ) -> Result<Box<dyn Processor>> {
        let constructor = self
            .processors
            .get(class)
            .ok_or_else(|| unknown("processor", class))?;
        constructor(configuration, state)
    }

    /// Registered class tags per role, for listings
    pub fn classes(&self) -> Vec<(&'static str, Vec<&str>)> {
        vec![
            ("finder", self.finders.keys().map(String::as_str).collect()),
            ("reader", self.readers.keys().map(String::as_str).collect()),
            ("processor", self.processors.keys().map(String::as_str).collect()),
        ]
    }
}

fn unknown(role: &'static str, class: &str) -> AipError {
    AipError::UnknownComponent {
        role,
        class: class.to_string(),
    }
}

impl Default for ComponentRegistry {
    /// A registry with the built-in classes
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register_finder(DropFolderFinder::CLASS, |config, state| {
                Ok(Box::new(DropFolderFinder::new(config, state)?))
            })
            .register_finder(StaticFileFinder::CLASS, |config, state| {
                Ok(Box::new(StaticFileFinder::new(config, state)?))
            })
            .register_reader(CsvSource::CLASS, |config, state| {
                Ok(Box::new(CsvReader::new(config, state)?))
            })
            .register_reader(JsonSource::CLASS, |config, state| {
                Ok(Box::new(JsonReader::new(config, state)?))
            })
            .register_processor(NoopProcessor::CLASS, |config, state| {
                Ok(Box::new(NoopProcessor::new(config, state)?))
            })
            .register_processor(ExportProcessor::CLASS, |config, state| {
                Ok(Box::new(ExportProcessor::new(config, state)?))
            });
        registry
    }
}
