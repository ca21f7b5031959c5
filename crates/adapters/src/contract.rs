use async_trait::async_trait;

use convoy_core::{
    Capability, CleanupPolicy, CoreError, CoreResult, DetectionInfo, ManagerDescriptor,
    PackageRecord, SearchHit,
};

/// One manager behind a uniform async surface. Implementations translate each
/// operation into argument-list command invocations and parse the captured
/// output with pure functions; no adapter touches the scheduler or the store.
///
/// Default bodies return `Unsupported`, so a manager only ever answers for the
/// capabilities its descriptor advertises.
#[async_trait]
pub trait ManagerAdapter: Send + Sync {
    fn descriptor(&self) -> &'static ManagerDescriptor;

    /// Probes whether the underlying tool is present and which version it
    /// reports. A missing executable is a negative detection, not an error.
    async fn detect(&self) -> CoreResult<DetectionInfo>;

    async fn list_installed(&self) -> CoreResult<Vec<PackageRecord>> {
        Err(self.unsupported("list_installed"))
    }

    async fn list_outdated(&self) -> CoreResult<Vec<PackageRecord>> {
        Err(self.unsupported("list_outdated"))
    }

    async fn search(&self, _query: &str) -> CoreResult<Vec<SearchHit>> {
        Err(self.unsupported("search"))
    }

    async fn install(&self, _name: &str, _version: Option<&str>) -> CoreResult<()> {
        Err(self.unsupported("install"))
    }

    async fn uninstall(&self, _name: &str) -> CoreResult<()> {
        Err(self.unsupported("uninstall"))
    }

    /// Upgrades one package, or everything this manager owns when `name` is
    /// `None`.
    async fn upgrade(&self, _name: Option<&str>) -> CoreResult<()> {
        Err(self.unsupported("upgrade"))
    }

    /// Returns `true` when the manager applied a native hold. `false` means
    /// the manager has no pin mechanism and the caller should fall back to a
    /// virtual pin record.
    async fn pin(&self, _name: &str) -> CoreResult<bool> {
        Ok(false)
    }

    async fn unpin(&self, _name: &str) -> CoreResult<bool> {
        Ok(false)
    }

    /// Bootstrapping an absent manager needs its installer pipeline, which no
    /// current adapter can express as a single argument list; the operation
    /// exists so callers get a classified `Unsupported` failure instead of a
    /// missing method.
    async fn self_install(&self) -> CoreResult<()> {
        Err(self.unsupported("self_install"))
    }

    async fn self_update(&self) -> CoreResult<()> {
        Err(self.unsupported("self_update"))
    }

    async fn self_uninstall(&self) -> CoreResult<()> {
        Err(self.unsupported("self_uninstall"))
    }

    fn unsupported(&self, operation: &str) -> CoreError {
        CoreError::unsupported(self.descriptor().id, operation)
    }
}

/// Re-check used by concrete overrides before doing any work. The descriptor
/// is the single source of truth; an override on a manager whose descriptor
/// does not advertise the capability still refuses.
pub fn ensure_capability(
    descriptor: &ManagerDescriptor,
    capability: Capability,
    operation: &str,
) -> CoreResult<()> {
    if descriptor.supports(capability) {
        Ok(())
    } else {
        Err(CoreError::unsupported(descriptor.id, operation))
    }
}

/// Per-package cleanup preference, consulted by the homebrew adapter while it
/// builds mutation argv. Backed by the policy store at runtime.
pub trait CleanupPolicySource: Send + Sync {
    fn cleanup_policy(&self, name: &str) -> CleanupPolicy;
}

pub struct DefaultCleanupPolicies;

impl CleanupPolicySource for DefaultCleanupPolicies {
    fn cleanup_policy(&self, _name: &str) -> CleanupPolicy {
        CleanupPolicy::Default
    }
}
