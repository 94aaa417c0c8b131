use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use welltrack_protocol::ItemId;

use crate::cache::write_atomically;
use crate::error::{CoreError, CoreResult};

/// Flat parameter name to value map.
pub type ParamMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub global: ParamMap,
    pub overrides: BTreeMap<ItemId, ParamMap>,
}

impl ParameterSet {
    /// `global` with the item's override entries shadowing same-named keys.
    pub fn effective(&self, id: &ItemId) -> ParamMap {
        let mut effective = self.global.clone();
        if let Some(overrides) = self.overrides.get(id) {
            effective.extend(
                overrides
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
        }
        effective
    }

    pub fn has_override(&self, id: &ItemId) -> bool {
        self.overrides.contains_key(id)
    }

    pub fn overridden_ids(&self) -> BTreeSet<ItemId> {
        self.overrides.keys().cloned().collect()
    }
}

/// Work a parameter change requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenerationPlan {
    /// Every item may be affected: drop the session, invalidate the cache,
    /// relaunch the whole batch.
    FullRestart,
    /// Only this item is affected.
    Item(ItemId),
}

/// Owns the parameter set and is its only writer.
#[derive(Debug, Clone, Default)]
pub struct ParameterOverrideManager {
    parameters: ParameterSet,
}

impl ParameterOverrideManager {
    pub fn new(global: ParamMap) -> Self {
        Self {
            parameters: ParameterSet {
                global,
                overrides: BTreeMap::new(),
            },
        }
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn set_global(&mut self, global: ParamMap) -> RegenerationPlan {
        self.parameters.global = global;
        RegenerationPlan::FullRestart
    }

    /// An empty override map removes the entry, same as
    /// [`clear_override`](Self::clear_override).
    pub fn set_override(&mut self, id: ItemId, params: ParamMap) -> RegenerationPlan {
        if params.is_empty() {
            return self.clear_override(&id);
        }
        self.parameters.overrides.insert(id.clone(), params);
        RegenerationPlan::Item(id)
    }

    pub fn clear_override(&mut self, id: &ItemId) -> RegenerationPlan {
        self.parameters.overrides.remove(id);
        RegenerationPlan::Item(id.clone())
    }

    pub fn effective_params(&self, id: &ItemId) -> ParamMap {
        self.parameters.effective(id)
    }

    pub fn overridden_ids(&self) -> BTreeSet<ItemId> {
        self.parameters.overridden_ids()
    }

    /// The `{ "<id>": { ...params } }` document handed to a full batch.
    pub fn overrides_document(&self) -> Value {
        Value::Object(
            self.parameters
                .overrides
                .iter()
                .map(|(id, params)| (id.to_string(), params_to_value(params)))
                .collect(),
        )
    }
}

pub fn params_to_value(params: &ParamMap) -> Value {
    Value::Object(
        params
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect::<Map<_, _>>(),
    )
}

/// Flat JSON parameter file. Saving merges into what is on disk rather
/// than replacing it.
#[derive(Debug, Clone)]
pub struct ParameterFile {
    path: PathBuf,
}

impl ParameterFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file reads as an empty map.
    pub fn load(&self) -> CoreResult<ParamMap> {
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(ParamMap::new()),
            Err(error) => return Err(error.into()),
        };
        match serde_json::from_slice::<Value>(&body)? {
            Value::Object(entries) => Ok(entries.into_iter().collect()),
            _ => Err(CoreError::Serialization(format!(
                "parameter file {} must hold a JSON object",
                self.path.display()
            ))),
        }
    }

    /// Writes `params` over the stored keys and returns the merged map.
    /// Keys on disk that `params` does not mention are preserved.
    pub fn save_merged(&self, params: &ParamMap) -> CoreResult<ParamMap> {
        let mut merged = match self.load() {
            Ok(existing) => existing,
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %error,
                    "replacing unreadable parameter file"
                );
                ParamMap::new()
            }
        };
        merged.extend(
            params
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        let body = serde_json::to_vec_pretty(&params_to_value(&merged))?;
        write_atomically(&self.path, &body)?;
        Ok(merged)
    }
}
