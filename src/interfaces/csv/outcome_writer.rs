use crate::domain::webhook::WebhookCode;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

/// Result line for one reconciled statement row.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct StatementOutcome {
    pub reference: String,
    pub code: WebhookCode,
    pub payment_id: Option<Uuid>,
    pub requires_manual_review: bool,
}

/// Writes reconciliation outcomes as CSV with a header row.
pub struct OutcomeWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OutcomeWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write(&mut self, outcome: &StatementOutcome) -> Result<()> {
        self.writer.serialize(outcome)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_and_codes() {
        let mut buffer = Vec::new();
        {
            let mut writer = OutcomeWriter::new(&mut buffer);
            writer
                .write(&StatementOutcome {
                    reference: "R1".to_string(),
                    code: WebhookCode::ReferenceNotFound,
                    payment_id: None,
                    requires_manual_review: false,
                })
                .unwrap();
            writer.finish().unwrap();
        }
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with("reference,code,payment_id,requires_manual_review"));
        assert!(text.contains("R1,REFERENCE_NOT_FOUND,,false"));
    }
}
