//! Plan catalog loading, validation and hot replacement.

use crate::error::SubscriptionError;
use crate::models::{Plan, PlanId, MAX_TRIAL_DAYS};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Plan {0} is defined more than once")]
    DuplicatePlan(PlanId),

    #[error("Catalog is invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("No catalog source configured")]
    NoSource,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    plans: Vec<Plan>,
}

/// Immutable set of published plans.
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: BTreeMap<PlanId, Plan>,
}

impl PlanCatalog {
    /// Build without checking adjacency; see [`PlanCatalog::validate`].
    pub fn from_plans(plans: Vec<Plan>) -> Result<Self, CatalogError> {
        let mut map = BTreeMap::new();
        for plan in plans {
            if map.contains_key(&plan.id) {
                return Err(CatalogError::DuplicatePlan(plan.id));
            }
            map.insert(plan.id.clone(), plan);
        }
        Ok(Self { plans: map })
    }

    /// Parse and validate a JSON document of the form `{"plans": [...]}`.
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        let catalog = Self::from_plans(file.plans)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Check prices and that every adjacency edge points at a known, distinct plan.
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut problems = Vec::new();

        for plan in self.plans.values() {
            if plan.price < 0 {
                problems.push(format!("plan {} has negative price {}", plan.id, plan.price));
            }
            if plan.trial_days > MAX_TRIAL_DAYS {
                problems.push(format!(
                    "plan {} offers a {} day trial, more than {}",
                    plan.id, plan.trial_days, MAX_TRIAL_DAYS
                ));
            }
            for (relation, targets) in [
                ("upgrade", &plan.upgrades_to),
                ("downgrade", &plan.downgrades_to),
            ] {
                for target in targets {
                    if target == &plan.id {
                        problems.push(format!("plan {} lists itself as {}", plan.id, relation));
                    } else if !self.plans.contains_key(target) {
                        problems.push(format!(
                            "plan {} lists unknown {} target {}",
                            plan.id, relation, target
                        ));
                    }
                }
            }
            if let Some(both) = plan
                .upgrades_to
                .iter()
                .find(|target| plan.downgrades_to.contains(target))
            {
                problems.push(format!(
                    "plan {} lists {} as both upgrade and downgrade",
                    plan.id, both
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CatalogError::Invalid(problems))
        }
    }

    pub fn get(&self, id: &PlanId) -> Option<&Plan> {
        self.plans.get(id)
    }

    /// Resolve a plan a subscription already references. A miss means the
    /// catalog no longer contains data it once published.
    pub fn resolve_existing(&self, id: &PlanId) -> Result<&Plan, SubscriptionError> {
        self.plans.get(id).ok_or_else(|| {
            SubscriptionError::CatalogCorruption(format!("plan {id} is referenced but missing"))
        })
    }

    /// Plans open for new subscriptions, in identifier order.
    pub fn subscribable(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values().filter(|plan| plan.is_subscribable())
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

/// Shared, replaceable catalog.
///
/// Readers take a snapshot so one command never sees two catalog versions.
#[derive(Debug)]
pub struct CatalogHandle {
    current: RwLock<Arc<PlanCatalog>>,
    source: Option<PathBuf>,
}

impl CatalogHandle {
    pub fn new(catalog: PlanCatalog) -> Self {
        Self {
            current: RwLock::new(Arc::new(catalog)),
            source: None,
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let catalog = PlanCatalog::load(&path)?;
        Ok(Self {
            current: RwLock::new(Arc::new(catalog)),
            source: Some(path),
        })
    }

    pub fn snapshot(&self) -> Arc<PlanCatalog> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, catalog: PlanCatalog) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
    }

    /// Re-read the source file. On failure the previous catalog stays in place.
    pub fn reload(&self) -> Result<usize, CatalogError> {
        let path = self.source.as_ref().ok_or(CatalogError::NoSource)?;
        let catalog = PlanCatalog::load(path)?;
        let count = catalog.len();
        self.replace(catalog);
        tracing::info!(path = %path.display(), plans = count, "Plan catalog reloaded");
        Ok(count)
    }
}
