use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CorrelationId, SagaId, Version};

/// Storage shape of a saga instance.
///
/// The saga crate owns the instance type and serializes it into `body`; the
/// store only needs the columns it filters on (`is_terminal`,
/// `next_retry_at`) and the version for optimistic locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub correlation_id: CorrelationId,
    pub state: String,
    pub is_terminal: bool,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Version of the stored record. A record that was never saved is at 0.
    pub version: Version,
    pub body: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl SagaRecord {
    /// Returns true when the poll loop should pick this record up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal && self.next_retry_at.is_none_or(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(is_terminal: bool, next_retry_at: Option<DateTime<Utc>>) -> SagaRecord {
        SagaRecord {
            saga_id: SagaId::new(),
            saga_type: "Transfer".to_string(),
            correlation_id: CorrelationId::new(),
            state: "Running".to_string(),
            is_terminal,
            next_retry_at,
            version: Version::initial(),
            body: serde_json::json!({}),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn due_when_running_without_retry_deadline() {
        assert!(record(false, None).is_due(Utc::now()));
    }

    #[test]
    fn not_due_before_retry_deadline() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(5);
        assert!(!record(false, Some(later)).is_due(now));
        assert!(record(false, Some(later)).is_due(later));
    }

    #[test]
    fn terminal_records_are_never_due() {
        assert!(!record(true, None).is_due(Utc::now()));
    }
}
