//! Model Registry
//!
//! Catalog of loadable model units, populated once at startup and read-only
//! afterwards. Every registration is checked against the dependency graph so
//! a cycle or a dangling dependency is rejected before anything is loaded.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;
use verity_kernel::error::RegistryError;
use verity_kernel::model::ModelUnitDescriptor;
use verity_kernel::stage::StageId;

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    units: BTreeMap<String, ModelUnitDescriptor>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a batch of descriptors in any declaration order.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = ModelUnitDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut units = BTreeMap::new();
        for descriptor in descriptors {
            validate_descriptor(&descriptor)?;
            if units.contains_key(&descriptor.id) {
                return Err(RegistryError::Duplicate(descriptor.id));
            }
            units.insert(descriptor.id.clone(), descriptor);
        }

        for unit in units.values() {
            for dep in &unit.dependencies {
                if !units.contains_key(dep) {
                    return Err(RegistryError::UnknownDependency {
                        unit: unit.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let registry = Self { units };
        registry.check_acyclic()?;
        Ok(registry)
    }

    /// Registers one descriptor. Its dependencies must already be registered,
    /// which also rules out cycles.
    pub fn register(&mut self, descriptor: ModelUnitDescriptor) -> Result<(), RegistryError> {
        validate_descriptor(&descriptor)?;
        if self.units.contains_key(&descriptor.id) {
            return Err(RegistryError::Duplicate(descriptor.id));
        }
        for dep in &descriptor.dependencies {
            if dep == &descriptor.id {
                return Err(RegistryError::Cycle(vec![dep.clone(), dep.clone()]));
            }
            if !self.units.contains_key(dep) {
                return Err(RegistryError::UnknownDependency {
                    unit: descriptor.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        debug!(unit = %descriptor.id, stage = %descriptor.specialization, "registered model unit");
        self.units.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Result<&ModelUnitDescriptor, RegistryError> {
        self.units
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Units serving `stage`, highest priority first, then by id.
    pub fn list_by_specialization(&self, stage: StageId) -> Vec<&ModelUnitDescriptor> {
        let mut units: Vec<_> = self
            .units
            .values()
            .filter(|u| u.specialization == stage)
            .collect();
        units.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        units
    }

    /// The unit that serves `stage`, if any.
    pub fn primary_for(&self, stage: StageId) -> Option<&ModelUnitDescriptor> {
        self.list_by_specialization(stage).into_iter().next()
    }

    /// Transitive dependencies of `id` in load order, excluding `id` itself.
    pub fn load_order(&self, id: &str) -> Result<Vec<String>, RegistryError> {
        let root = self.lookup(id)?;
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        for dep in &root.dependencies {
            self.visit(dep, &mut seen, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        id: &str,
        seen: &mut BTreeSet<String>,
        order: &mut Vec<String>,
    ) -> Result<(), RegistryError> {
        if !seen.insert(id.to_string()) {
            return Ok(());
        }
        let unit = self.lookup(id)?;
        for dep in &unit.dependencies {
            self.visit(dep, seen, order)?;
        }
        order.push(id.to_string());
        Ok(())
    }

    /// Sum of the footprints of the given units. Unknown ids count as zero.
    pub fn total_footprint_mb<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> u64 {
        ids.into_iter()
            .filter_map(|id| self.units.get(id))
            .map(|u| u.footprint_mb)
            .sum()
    }

    /// Ids of the units that directly depend on `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        self.units
            .values()
            .filter(|u| u.dependencies.iter().any(|d| d == id))
            .map(|u| u.id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelUnitDescriptor> {
        self.units.values()
    }

    /// Depth-first search with an explicit path; the first back edge found is
    /// reported as the cycle.
    fn check_acyclic(&self) -> Result<(), RegistryError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn dfs(
            registry: &ModelRegistry,
            id: &str,
            marks: &mut BTreeMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Result<(), RegistryError> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| p == id).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(id.to_string());
                    return Err(RegistryError::Cycle(cycle));
                }
                None => {}
            }
            marks.insert(id.to_string(), Mark::Visiting);
            path.push(id.to_string());
            if let Some(unit) = registry.units.get(id) {
                for dep in &unit.dependencies {
                    dfs(registry, dep, marks, path)?;
                }
            }
            path.pop();
            marks.insert(id.to_string(), Mark::Done);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        for id in self.units.keys() {
            dfs(self, id, &mut marks, &mut Vec::new())?;
        }
        Ok(())
    }
}

fn validate_descriptor(descriptor: &ModelUnitDescriptor) -> Result<(), RegistryError> {
    if descriptor.id.trim().is_empty() {
        return Err(RegistryError::Invalid {
            unit: descriptor.id.clone(),
            reason: "empty id".into(),
        });
    }
    if descriptor.footprint_mb == 0 {
        return Err(RegistryError::Invalid {
            unit: descriptor.id.clone(),
            reason: "footprint must be positive".into(),
        });
    }
    Ok(())
}
