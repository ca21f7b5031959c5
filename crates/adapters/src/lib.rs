pub mod cargo;
pub mod contract;
pub mod homebrew;
pub mod mise;
pub mod npm;
pub mod pip;
pub mod registry;
pub mod rustup;
pub mod softwareupdate;

pub use contract::{CleanupPolicySource, DefaultCleanupPolicies, ManagerAdapter};
pub use registry::{AdapterRegistry, standard_adapters};
