//! Stage definitions and the ordered stage registry.

use super::{PolicyOverride, ResiliencePolicy};
use crate::errors::RegistryValidationError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Immutable definition of a single stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// The unique name of the stage.
    pub name: String,
    /// Position in the sequence, 0-based.
    pub order: usize,
    /// Progress percentage reported while this stage runs.
    pub progress_weight: u8,
    /// Retry, timeout and fallback policy.
    pub policy: ResiliencePolicy,
}

impl StageDefinition {
    /// Creates a new stage definition.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        order: usize,
        progress_weight: u8,
        policy: ResiliencePolicy,
    ) -> Self {
        Self {
            name: name.into(),
            order,
            progress_weight,
            policy,
        }
    }

    /// Validates the stage on its own.
    ///
    /// # Errors
    ///
    /// Returns an error for a blank name, a progress above 100 or an
    /// invalid policy.
    pub fn validate(&self) -> Result<(), RegistryValidationError> {
        if self.name.trim().is_empty() {
            return Err(RegistryValidationError::new(format!(
                "Stage at position {} has an empty name",
                self.order
            )));
        }
        if self.progress_weight > 100 {
            return Err(RegistryValidationError::new(format!(
                "Stage '{}' has progress {} above 100",
                self.name, self.progress_weight
            ))
            .with_stage(&self.name));
        }
        self.policy.validate(&self.name)
    }
}

/// Ordered, validated catalog of stage definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRegistry {
    stages: Vec<StageDefinition>,
}

impl StageRegistry {
    /// Creates a registry from definitions, ordering them by `order`.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is empty, orders are not a
    /// contiguous 0-based sequence, names repeat, progress decreases or
    /// any policy is invalid.
    pub fn new(mut stages: Vec<StageDefinition>) -> Result<Self, RegistryValidationError> {
        if stages.is_empty() {
            return Err(RegistryValidationError::new("Stage registry has no stages"));
        }
        stages.sort_by_key(|s| s.order);

        let mut seen = HashSet::new();
        let mut previous_progress = 0u8;
        for (index, stage) in stages.iter().enumerate() {
            stage.validate()?;

            if stage.order != index {
                return Err(RegistryValidationError::new(format!(
                    "Stage '{}' has order {} but position {}",
                    stage.name, stage.order, index
                ))
                .with_stage(&stage.name));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(RegistryValidationError::new(format!(
                    "Duplicate stage name '{}'",
                    stage.name
                ))
                .with_stage(&stage.name));
            }
            if stage.progress_weight < previous_progress {
                return Err(RegistryValidationError::new(format!(
                    "Stage '{}' progress {} is below the previous stage's {}",
                    stage.name, stage.progress_weight, previous_progress
                ))
                .with_stage(&stage.name));
            }
            previous_progress = stage.progress_weight;
        }

        Ok(Self { stages })
    }

    /// Starts a registry builder.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::default()
    }

    /// Returns the stages in order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Returns an iterator over the stages in order.
    pub fn iter(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.iter()
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Returns the stage names in order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the registry has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns a new registry with policy overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if an override names an unknown stage or produces
    /// an invalid policy.
    pub fn with_overrides(
        &self,
        overrides: &HashMap<String, PolicyOverride>,
    ) -> Result<Self, RegistryValidationError> {
        if let Some(unknown) = overrides.keys().find(|name| self.get(name).is_none()) {
            return Err(RegistryValidationError::new(format!(
                "Policy override for unknown stage '{unknown}'"
            ))
            .with_stage(unknown.clone()));
        }

        let stages = self
            .stages
            .iter()
            .map(|stage| {
                let mut stage = stage.clone();
                if let Some(over) = overrides.get(&stage.name) {
                    stage.policy = over.apply(stage.policy);
                }
                stage
            })
            .collect();

        Self::new(stages)
    }

    /// Upper bound on a run's duration, given a jitter ceiling.
    #[must_use]
    pub fn worst_case_duration(&self, max_jitter: Duration) -> Duration {
        self.stages
            .iter()
            .map(|s| s.policy.worst_case(max_jitter))
            .sum()
    }
}

/// Builder that assigns stage order by insertion.
#[derive(Debug, Clone, Default)]
pub struct StageRegistryBuilder {
    stages: Vec<StageDefinition>,
}

impl StageRegistryBuilder {
    /// Appends a stage.
    #[must_use]
    pub fn stage(
        mut self,
        name: impl Into<String>,
        progress_weight: u8,
        policy: ResiliencePolicy,
    ) -> Self {
        let order = self.stages.len();
        self.stages
            .push(StageDefinition::new(name, order, progress_weight, policy));
        self
    }

    /// Builds and validates the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<StageRegistry, RegistryValidationError> {
        StageRegistry::new(self.stages)
    }
}
