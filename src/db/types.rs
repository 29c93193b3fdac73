use serde::{Deserialize, Serialize};
use sqlx::Type;

/// Lifecycle of an answer sheet. Transitions are one-way:
/// pending -> processing -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "sheetstatus", rename_all = "lowercase")]
pub(crate) enum SheetStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}
