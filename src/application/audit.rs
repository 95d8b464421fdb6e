use super::bounded;
use crate::domain::audit::AuditRecord;
use crate::domain::ports::AuditTrailRef;
use crate::error::Result;
use std::time::Duration;

/// Writes audit records with a timeout and logs every failed write.
#[derive(Clone)]
pub struct Auditor {
    trail: AuditTrailRef,
    timeout: Duration,
}

impl Auditor {
    pub fn new(trail: AuditTrailRef, timeout: Duration) -> Self {
        Self { trail, timeout }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn record(&self, record: AuditRecord) -> Result<()> {
        let action = record.action;
        let subject = record.subject.clone();
        let result = bounded(self.timeout, "audit append", self.trail.append(record)).await;
        if let Err(ref e) = result {
            tracing::error!(?action, %subject, error = %e, "AUDIT WRITE FAILED");
        }
        result
    }
}
