use super::Unresolved;
use crate::host::modules::{CORE_MODULE_ID, ModuleDescriptor, ModuleRegistry};
use ahash::AHashSet;
use std::collections::VecDeque;
use std::sync::Arc;

/// One result per directive line: the module, or why it cannot be used.
pub fn resolve_module_dependencies(
    lines: &[String],
    registry: &ModuleRegistry,
) -> Vec<Result<Arc<ModuleDescriptor>, Unresolved>> {
    lines
        .iter()
        .map(|id| match registry.get(id) {
            None => Err(Unresolved::ModuleNotFound(id.clone())),
            Some(descriptor) if !descriptor.enabled => Err(Unresolved::ModuleDisabled(id.clone())),
            Some(descriptor) => Ok(descriptor),
        })
        .collect()
}

/// The given modules plus everything they require, breadth first. Optional
/// dependencies and the core module are left out; cycles are harmless.
pub fn transitive_closure(
    descriptors: Vec<Arc<ModuleDescriptor>>,
    registry: &ModuleRegistry,
) -> Vec<Arc<ModuleDescriptor>> {
    let mut seen: AHashSet<String> = AHashSet::new();
    let mut result = vec![];
    let mut to_visit: VecDeque<Arc<ModuleDescriptor>> = descriptors.into();

    while let Some(descriptor) = to_visit.pop_front() {
        if descriptor.id == CORE_MODULE_ID || !seen.insert(descriptor.id.clone()) {
            continue;
        }
        for dependency in descriptor.dependencies.iter().filter(|d| !d.optional) {
            if dependency.id == CORE_MODULE_ID || seen.contains(&dependency.id) {
                continue;
            }
            match registry.get(&dependency.id) {
                Some(next) if next.enabled => to_visit.push_back(next),
                Some(_) => log::warn!(
                    "Host module '{}' required by '{}' is disabled",
                    dependency.id,
                    descriptor.id
                ),
                None => log::warn!(
                    "Host module '{}' required by '{}' was not found",
                    dependency.id,
                    descriptor.id
                ),
            }
        }
        result.push(descriptor);
    }
    result
}
