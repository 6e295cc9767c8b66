use std::collections::HashMap;
use std::path::Path;

use anyhow::{Result, bail};

use crate::config::{ThresholdDefinition, load_thresholds};

/// Declarative table of named quality rules, built once at startup and never
/// mutated afterwards; safe for concurrent reads across workers.
#[derive(Debug)]
pub struct ThresholdRegistry {
    definitions: Vec<ThresholdDefinition>,
    by_name: HashMap<String, usize>,
}

impl ThresholdRegistry {
    pub fn from_definitions(definitions: Vec<ThresholdDefinition>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(definitions.len());
        for (index, definition) in definitions.iter().enumerate() {
            if by_name.insert(definition.name.clone(), index).is_some() {
                bail!("duplicate threshold rule name: {}", definition.name);
            }
        }
        Ok(Self {
            definitions,
            by_name,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_definitions(load_thresholds(path)?)
    }

    pub fn get(&self, name: &str) -> Option<&ThresholdDefinition> {
        self.by_name.get(name).map(|&index| &self.definitions[index])
    }

    pub fn by_category(&self, category: &str) -> Vec<&ThresholdDefinition> {
        self.definitions
            .iter()
            .filter(|definition| definition.category == category)
            .collect()
    }

    pub fn blocking(&self) -> Vec<&ThresholdDefinition> {
        self.definitions
            .iter()
            .filter(|definition| definition.blocking)
            .collect()
    }

    pub fn tagged(&self, tag: &str) -> Vec<&ThresholdDefinition> {
        self.definitions
            .iter()
            .filter(|definition| definition.tags.iter().any(|candidate| candidate == tag))
            .collect()
    }

    pub fn all(&self) -> &[ThresholdDefinition] {
        &self.definitions
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}
