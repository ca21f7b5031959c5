use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use convoy_core::{
    ManagerId, PackageCleanupPolicy, PackageRecord, PinRecord, SearchHit, TaskLogEntry,
    TaskRecord, catalog,
};

use crate::StoreError;

/// Current document schema. The ladder below this version is applied at load;
/// a document claiming a higher version came from a newer build and is not
/// readable here.
pub const SCHEMA_VERSION: u64 = 3;

/// Per-manager runtime preferences. Identity and tier live in the static
/// catalog; only these two fields are user-mutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerPrefs {
    pub id: ManagerId,
    pub enabled: bool,
    pub priority: u32,
}

/// The whole persisted state as one JSON document, written atomically on every
/// mutation. Fields added by later schema versions carry serde defaults so a
/// migrated document deserializes without loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub schema_version: u64,
    pub packages: Vec<PackageRecord>,
    pub tasks: Vec<TaskRecord>,
    pub pins: Vec<PinRecord>,
    pub safe_mode: bool,
    #[serde(default)]
    pub logs: Vec<TaskLogEntry>,
    #[serde(default = "first_log_id")]
    pub next_log_id: u64,
    #[serde(default)]
    pub search_cache: Vec<SearchHit>,
    #[serde(default = "seeded_manager_prefs")]
    pub managers: Vec<ManagerPrefs>,
    #[serde(default)]
    pub cleanup_policies: Vec<PackageCleanupPolicy>,
}

fn first_log_id() -> u64 {
    1
}

/// Every catalog manager enabled, priority following catalog order.
pub fn seeded_manager_prefs() -> Vec<ManagerPrefs> {
    catalog()
        .iter()
        .enumerate()
        .map(|(index, descriptor)| ManagerPrefs {
            id: descriptor.id,
            enabled: true,
            priority: index as u32,
        })
        .collect()
}

impl Document {
    pub fn seeded() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            packages: Vec::new(),
            tasks: Vec::new(),
            pins: Vec::new(),
            safe_mode: false,
            logs: Vec::new(),
            next_log_id: 1,
            search_cache: Vec::new(),
            managers: seeded_manager_prefs(),
            cleanup_policies: Vec::new(),
        }
    }
}

/// Parses and migrates raw document text up to `SCHEMA_VERSION`. Any shape the
/// ladder cannot make sense of is `ResetRequired`, never a silent reseed.
pub fn load_document(text: &str) -> Result<Document, StoreError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|error| StoreError::ResetRequired(format!("document is not JSON: {error}")))?;
    let Value::Object(mut fields) = value else {
        return Err(StoreError::ResetRequired(
            "document root is not an object".to_string(),
        ));
    };

    let version = fields
        .get("schema_version")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            StoreError::ResetRequired("schema_version missing or not an integer".to_string())
        })?;
    if version == 0 || version > SCHEMA_VERSION {
        return Err(StoreError::ResetRequired(format!(
            "unreadable schema version {version} (latest known is {SCHEMA_VERSION})"
        )));
    }

    if version < 2 {
        migrate_v1_to_v2(&mut fields);
        tracing::info!(from = 1, to = 2, "store schema migrated");
    }
    if version < 3 {
        migrate_v2_to_v3(&mut fields);
        tracing::info!(from = 2, to = 3, "store schema migrated");
    }
    fields.insert("schema_version".to_string(), json!(SCHEMA_VERSION));

    serde_json::from_value(Value::Object(fields))
        .map_err(|error| StoreError::ResetRequired(format!("document does not parse: {error}")))
}

/// v2 added the per-task structured log and the remote-search cache.
fn migrate_v1_to_v2(fields: &mut Map<String, Value>) {
    fields.entry("logs").or_insert_with(|| json!([]));
    fields.entry("next_log_id").or_insert_with(|| json!(1));
    fields.entry("search_cache").or_insert_with(|| json!([]));
}

/// v3 added user-mutable manager preferences and per-package cleanup policies.
fn migrate_v2_to_v3(fields: &mut Map<String, Value>) {
    fields
        .entry("managers")
        .or_insert_with(|| json!(seeded_manager_prefs()));
    fields.entry("cleanup_policies").or_insert_with(|| json!([]));
}
