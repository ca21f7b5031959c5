use std::collections::HashMap;
use std::sync::Arc;

use convoy_core::{CoreError, CoreResult, ManagerId};
use convoy_executor::ExecHarness;

use crate::cargo::CargoAdapter;
use crate::contract::{CleanupPolicySource, ManagerAdapter};
use crate::homebrew::HomebrewAdapter;
use crate::mise::MiseAdapter;
use crate::npm::NpmAdapter;
use crate::pip::PipAdapter;
use crate::rustup::RustupAdapter;
use crate::softwareupdate::SoftwareUpdateAdapter;

/// Immutable id-to-adapter map built once at startup.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: Arc<HashMap<ManagerId, Arc<dyn ManagerAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(adapters: HashMap<ManagerId, Arc<dyn ManagerAdapter>>) -> Self {
        Self {
            adapters: Arc::new(adapters),
        }
    }

    pub fn get(&self, id: ManagerId) -> CoreResult<Arc<dyn ManagerAdapter>> {
        self.adapters
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::Internal(format!("no adapter registered for '{id}'")))
    }

    pub fn ids(&self) -> Vec<ManagerId> {
        let mut ids: Vec<_> = self.adapters.keys().copied().collect();
        ids.sort();
        ids
    }
}

/// Builds the full seeded registry over one shared execution harness.
pub fn standard_adapters(
    harness: ExecHarness,
    policies: Arc<dyn CleanupPolicySource>,
) -> AdapterRegistry {
    let mut adapters: HashMap<ManagerId, Arc<dyn ManagerAdapter>> = HashMap::new();
    adapters.insert(
        ManagerId::Mise,
        Arc::new(MiseAdapter::new(harness.clone())),
    );
    adapters.insert(
        ManagerId::Rustup,
        Arc::new(RustupAdapter::new(harness.clone())),
    );
    adapters.insert(ManagerId::Npm, Arc::new(NpmAdapter::new(harness.clone())));
    adapters.insert(ManagerId::Pip, Arc::new(PipAdapter::new(harness.clone())));
    adapters.insert(
        ManagerId::Cargo,
        Arc::new(CargoAdapter::new(harness.clone())),
    );
    adapters.insert(
        ManagerId::Homebrew,
        Arc::new(HomebrewAdapter::new(harness.clone(), policies)),
    );
    adapters.insert(
        ManagerId::SoftwareUpdate,
        Arc::new(SoftwareUpdateAdapter::new(harness)),
    );
    AdapterRegistry::new(adapters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::DefaultCleanupPolicies;
    use convoy_executor::SystemProcessExecutor;

    #[test]
    fn registry_covers_every_manager() {
        let harness = ExecHarness::new(Arc::new(SystemProcessExecutor));
        let registry = standard_adapters(harness, Arc::new(DefaultCleanupPolicies));
        for id in ManagerId::ALL {
            let adapter = registry.get(id).expect("adapter should be registered");
            assert_eq!(adapter.descriptor().id, id);
        }
        assert_eq!(registry.ids().len(), ManagerId::ALL.len());
    }
}
