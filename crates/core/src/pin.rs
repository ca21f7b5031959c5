use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::package::PackageRef;

/// Native pins are enforced by the manager itself; virtual pins exist only in
/// convoy's store, for managers without native pin support. The planner
/// filters on both identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinKind {
    Native,
    Virtual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    pub package: PackageRef,
    pub kind: PinKind,
    pub version: Option<String>,
    pub created_at: DateTime<Utc>,
}
