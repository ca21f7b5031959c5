use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use convoy_core::{
    AuthorityTier, ManagerId, PackageRecord, PackageRef, PlanPolicy, descriptor,
};

/// One upgrade the plan intends to perform. Tier is denormalized from the
/// manager at build time; together with the discovery order index it defines
/// the total execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: u64,
    pub order_index: usize,
    pub manager: ManagerId,
    pub tier: AuthorityTier,
    pub package: String,
    pub previous_version: Option<String>,
    pub reason: String,
}

/// An immutable snapshot of upgrade intent. Policy or enablement changes after
/// the snapshot require building a new plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradePlan {
    pub steps: Vec<PlanStep>,
    pub policy: PlanPolicy,
    pub created_at: DateTime<Utc>,
}

impl UpgradePlan {
    pub fn step(&self, id: u64) -> Option<&PlanStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    /// Step ids matching a scope, in execution order.
    pub fn scoped_ids(&self, scope: &PlanScope) -> Vec<u64> {
        scope_steps(&self.steps, scope)
            .iter()
            .map(|step| step.id)
            .collect()
    }
}

/// Builds the candidate steps and sorts them into execution order.
///
/// Exclusions, in this order: disabled managers; pinned packages unless the
/// policy includes them; OS-update-class steps whenever the policy does not
/// permit OS updates (safe mode vetoes them even when `allow_os_updates` is
/// set). Order index is the package's position in the discovery input.
pub fn build_plan(
    outdated: &[PackageRecord],
    enabled: &HashSet<ManagerId>,
    pins: &HashSet<PackageRef>,
    policy: PlanPolicy,
) -> UpgradePlan {
    let mut steps: Vec<PlanStep> = outdated
        .iter()
        .enumerate()
        .filter_map(|(order_index, record)| {
            let manager = record.reference.manager;
            if !enabled.contains(&manager) {
                return None;
            }
            let pinned = record.pinned || pins.contains(&record.reference);
            if pinned && !policy.include_pinned {
                return None;
            }
            let meta = descriptor(manager);
            if meta.os_update_class && !policy.permits_os_updates() {
                return None;
            }
            Some(PlanStep {
                id: 0,
                order_index,
                manager,
                tier: meta.tier,
                package: record.reference.name.clone(),
                previous_version: record.installed_version.clone(),
                reason: upgrade_reason(record),
            })
        })
        .collect();

    sort_execution_order(&mut steps);
    for (position, step) in steps.iter_mut().enumerate() {
        step.id = position as u64 + 1;
    }

    UpgradePlan {
        steps,
        policy,
        created_at: Utc::now(),
    }
}

fn upgrade_reason(record: &PackageRecord) -> String {
    match (&record.installed_version, &record.latest_version) {
        (Some(installed), Some(latest)) => {
            format!("{} {installed} -> {latest}", record.reference)
        }
        (None, Some(latest)) => format!("{} -> {latest}", record.reference),
        _ => format!("{} upgrade available", record.reference),
    }
}

/// Authority tier ascending, ties broken by discovery order ascending.
pub fn sort_execution_order(steps: &mut [PlanStep]) {
    steps.sort_by(|a, b| {
        a.tier
            .rank()
            .cmp(&b.tier.rank())
            .then_with(|| a.order_index.cmp(&b.order_index))
    });
}

/// Partial-rerun filter: a manager id and/or a case-insensitive package-name
/// substring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanScope {
    pub manager: Option<ManagerId>,
    pub package_substring: Option<String>,
}

impl PlanScope {
    pub fn matches(&self, step: &PlanStep) -> bool {
        if let Some(manager) = self.manager {
            if step.manager != manager {
                return false;
            }
        }
        if let Some(needle) = &self.package_substring {
            if !step
                .package
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// Keeps only the steps matching the scope, preserving their relative order.
pub fn scope_steps<'a>(steps: &'a [PlanStep], scope: &PlanScope) -> Vec<&'a PlanStep> {
    steps.iter().filter(|step| scope.matches(step)).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakdownEntry {
    pub manager: ManagerId,
    pub display_name: String,
    pub count: usize,
}

/// Per-manager candidate counts, sorted by count descending with ties broken
/// by display name ascending. Deterministic over any input ordering.
pub fn breakdown(steps: &[PlanStep]) -> Vec<BreakdownEntry> {
    let mut entries: Vec<BreakdownEntry> = Vec::new();
    for step in steps {
        match entries.iter_mut().find(|entry| entry.manager == step.manager) {
            Some(entry) => entry.count += 1,
            None => entries.push(BreakdownEntry {
                manager: step.manager,
                display_name: descriptor(step.manager).display_name.to_string(),
                count: 1,
            }),
        }
    }
    entries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.display_name.cmp(&b.display_name))
    });
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outdated(manager: ManagerId, name: &str) -> PackageRecord {
        PackageRecord::upgradable(
            PackageRef::new(manager, name),
            Some("1.0.0".to_string()),
            "2.0.0",
        )
    }

    fn all_enabled() -> HashSet<ManagerId> {
        ManagerId::ALL.into_iter().collect()
    }

    fn step(manager: ManagerId, tier: AuthorityTier, order_index: usize, name: &str) -> PlanStep {
        PlanStep {
            id: 0,
            order_index,
            manager,
            tier,
            package: name.to_string(),
            previous_version: None,
            reason: String::new(),
        }
    }

    #[test]
    fn pinned_packages_are_excluded_unless_included() {
        let mut records = vec![
            outdated(ManagerId::Homebrew, "git"),
            outdated(ManagerId::Homebrew, "node"),
        ];
        records[0].pinned = true;

        let policy = PlanPolicy {
            include_pinned: false,
            allow_os_updates: false,
            safe_mode: false,
        };
        let plan = build_plan(&records, &all_enabled(), &HashSet::new(), policy.clone());
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].package, "node");

        let inclusive = PlanPolicy {
            include_pinned: true,
            ..policy
        };
        let plan = build_plan(&records, &all_enabled(), &HashSet::new(), inclusive);
        assert_eq!(plan.steps.len(), 2);
    }

    #[test]
    fn virtual_pins_filter_like_native_pins() {
        let records = vec![outdated(ManagerId::Cargo, "ripgrep")];
        let mut pins = HashSet::new();
        pins.insert(PackageRef::new(ManagerId::Cargo, "ripgrep"));

        let policy = PlanPolicy {
            include_pinned: false,
            allow_os_updates: false,
            safe_mode: false,
        };
        let plan = build_plan(&records, &all_enabled(), &pins, policy);
        assert!(plan.steps.is_empty());
    }

    #[test]
    fn safe_mode_vetoes_os_updates_even_when_allowed() {
        let records = vec![
            outdated(ManagerId::SoftwareUpdate, "macOS Sequoia 15.3.2"),
            outdated(ManagerId::Homebrew, "git"),
        ];
        let policy = PlanPolicy {
            include_pinned: false,
            allow_os_updates: true,
            safe_mode: true,
        };
        let plan = build_plan(&records, &all_enabled(), &HashSet::new(), policy);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].manager, ManagerId::Homebrew);
    }

    #[test]
    fn os_updates_require_explicit_opt_in() {
        let records = vec![outdated(ManagerId::SoftwareUpdate, "Safari18.3")];
        let closed = PlanPolicy {
            include_pinned: false,
            allow_os_updates: false,
            safe_mode: false,
        };
        assert!(build_plan(&records, &all_enabled(), &HashSet::new(), closed)
            .steps
            .is_empty());

        let open = PlanPolicy {
            include_pinned: false,
            allow_os_updates: true,
            safe_mode: false,
        };
        assert_eq!(
            build_plan(&records, &all_enabled(), &HashSet::new(), open)
                .steps
                .len(),
            1
        );
    }

    #[test]
    fn disabled_managers_contribute_no_steps() {
        let records = vec![
            outdated(ManagerId::Npm, "typescript"),
            outdated(ManagerId::Pip, "requests"),
        ];
        let mut enabled = all_enabled();
        enabled.remove(&ManagerId::Npm);

        let policy = PlanPolicy {
            include_pinned: false,
            allow_os_updates: false,
            safe_mode: false,
        };
        let plan = build_plan(&records, &enabled, &HashSet::new(), policy);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].manager, ManagerId::Pip);
    }

    #[test]
    fn execution_order_is_tier_then_discovery_index() {
        let mut steps = vec![
            step(ManagerId::Npm, AuthorityTier::Standard, 5, "one"),
            step(ManagerId::SoftwareUpdate, AuthorityTier::Guarded, 1, "two"),
            step(ManagerId::Mise, AuthorityTier::Authoritative, 99, "three"),
            step(ManagerId::Pip, AuthorityTier::Standard, 1, "four"),
        ];
        sort_execution_order(&mut steps);
        let order: Vec<&str> = steps.iter().map(|s| s.package.as_str()).collect();
        assert_eq!(order, vec!["three", "four", "one", "two"]);
    }

    #[test]
    fn scoping_by_manager_and_substring() {
        let steps = vec![
            step(ManagerId::Npm, AuthorityTier::Standard, 0, "typescript"),
            step(ManagerId::Pip, AuthorityTier::Standard, 1, "requests"),
            step(ManagerId::Npm, AuthorityTier::Standard, 2, "prettier"),
        ];

        let npm_only = scope_steps(
            &steps,
            &PlanScope {
                manager: Some(ManagerId::Npm),
                package_substring: None,
            },
        );
        let names: Vec<&str> = npm_only.iter().map(|s| s.package.as_str()).collect();
        assert_eq!(names, vec!["typescript", "prettier"]);

        let req = scope_steps(
            &steps,
            &PlanScope {
                manager: None,
                package_substring: Some("REQ".to_string()),
            },
        );
        assert_eq!(req.len(), 1);
        assert_eq!(req[0].package, "requests");
    }

    #[test]
    fn breakdown_sorts_by_count_then_display_name() {
        let steps = vec![
            step(ManagerId::Pip, AuthorityTier::Standard, 0, "a"),
            step(ManagerId::Homebrew, AuthorityTier::Guarded, 1, "b"),
            step(ManagerId::Homebrew, AuthorityTier::Guarded, 2, "c"),
            step(ManagerId::Cargo, AuthorityTier::Standard, 3, "d"),
        ];
        let entries = breakdown(&steps);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].manager, ManagerId::Homebrew);
        assert_eq!(entries[0].count, 2);
        // "cargo" < "pip" by display name for the count tie.
        assert_eq!(entries[1].manager, ManagerId::Cargo);
        assert_eq!(entries[2].manager, ManagerId::Pip);
    }

    #[test]
    fn breakdown_is_stable_for_equal_inputs_in_any_order() {
        let forward = vec![
            step(ManagerId::Pip, AuthorityTier::Standard, 0, "a"),
            step(ManagerId::Cargo, AuthorityTier::Standard, 1, "b"),
        ];
        let reversed: Vec<PlanStep> = forward.iter().rev().cloned().collect();
        assert_eq!(breakdown(&forward), breakdown(&reversed));
    }
}
