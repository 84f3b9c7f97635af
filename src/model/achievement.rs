//! Achievement arena: the live indicator list owned by one editing session

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::types::{AchievementId, AchievementIndicator, IndicatorKey};
use super::variables::{assign_variable_names, find_duplicate_name, next_variable_name};
use crate::error::{EngineError, Result};
use crate::formula::referenced_variables;

/// Serializable form of an achievement, as loaded from disk or an editor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AchievementDefinition {
    pub id: AchievementId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub indicators: Vec<AchievementIndicator>,
}

impl AchievementDefinition {
    /// Read a definition from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EngineError::InvalidDefinition(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::InvalidDefinition(format!("{}: {}", path.display(), e)))
    }
}

/// Indicators of one achievement, keyed by stable identity
///
/// Every "all indicators other than X" view is computed from this arena at
/// the time it is needed, never cached.
#[derive(Debug, Clone)]
pub struct Achievement {
    id: AchievementId,
    name: String,
    indicators: BTreeMap<IndicatorKey, AchievementIndicator>,
    next_key: u64,
}

impl Achievement {
    pub fn new(id: AchievementId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            indicators: BTreeMap::new(),
            next_key: 1,
        }
    }

    /// Build the arena from a definition, naming unnamed indicators
    pub fn from_definition(definition: AchievementDefinition) -> Result<Self> {
        let AchievementDefinition {
            id,
            name,
            mut indicators,
        } = definition;

        if let Some(duplicate) = find_duplicate_name(&indicators) {
            return Err(EngineError::InvalidDefinition(format!(
                "variable name {} is used more than once",
                duplicate
            )));
        }
        assign_variable_names(&mut indicators);

        let mut achievement = Self::new(id, name);
        for indicator in indicators {
            let key = achievement.allocate_key();
            achievement.indicators.insert(key, indicator);
        }
        Ok(achievement)
    }

    pub fn to_definition(&self) -> AchievementDefinition {
        AchievementDefinition {
            id: self.id.clone(),
            name: self.name.clone(),
            indicators: self.indicators.values().cloned().collect(),
        }
    }

    pub fn id(&self) -> &AchievementId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn allocate_key(&mut self) -> IndicatorKey {
        let key = IndicatorKey(self.next_key);
        self.next_key += 1;
        key
    }

    /// Add an indicator, assigning its variable name if it has none
    ///
    /// A caller-provided name that is already taken is rejected.
    pub fn add(&mut self, mut indicator: AchievementIndicator) -> Result<IndicatorKey> {
        let requested = indicator
            .variable_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .map(str::to_string);

        match requested {
            Some(name) => {
                if self.key_of_variable(&name).is_some() {
                    return Err(EngineError::InvalidDefinition(format!(
                        "variable name {} is already in use",
                        name
                    )));
                }
            }
            None => {
                let name = next_variable_name(
                    self.indicators.values().map(|i| i.variable()),
                    self.indicators.len(),
                );
                indicator.variable_name = Some(name);
            }
        }

        let key = self.allocate_key();
        self.indicators.insert(key, indicator);
        Ok(key)
    }

    pub fn remove(&mut self, key: IndicatorKey) -> Option<AchievementIndicator> {
        self.indicators.remove(&key)
    }

    pub fn get(&self, key: IndicatorKey) -> Option<&AchievementIndicator> {
        self.indicators.get(&key)
    }

    pub fn get_mut(&mut self, key: IndicatorKey) -> Option<&mut AchievementIndicator> {
        self.indicators.get_mut(&key)
    }

    pub fn contains(&self, key: IndicatorKey) -> bool {
        self.indicators.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.indicators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indicators.is_empty()
    }

    /// Indicators in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (IndicatorKey, &AchievementIndicator)> {
        self.indicators.iter().map(|(k, v)| (*k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = IndicatorKey> + '_ {
        self.indicators.keys().copied()
    }

    /// Every live indicator except `owner` (all of them for the root)
    pub fn others(&self, owner: Option<IndicatorKey>) -> impl Iterator<Item = IndicatorKey> + '_ {
        self.keys().filter(move |k| Some(*k) != owner)
    }

    pub fn key_of_variable(&self, name: &str) -> Option<IndicatorKey> {
        self.iter()
            .find(|(_, indicator)| indicator.variable() == name)
            .map(|(key, _)| key)
    }

    /// Indicators whose formula mentions `variable`
    pub fn formulas_referencing(&self, variable: &str) -> Vec<IndicatorKey> {
        self.iter()
            .filter(|(_, indicator)| {
                indicator
                    .formula
                    .as_deref()
                    .map(|f| referenced_variables(f).iter().any(|v| v == variable))
                    .unwrap_or(false)
            })
            .map(|(key, _)| key)
            .collect()
    }
}
