use crate::domain::webhook::parse_payment_date;
use crate::error::{PaymentError, Result};
use crate::interfaces::api::ConciliationRequest;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One movement from a bank statement export.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct StatementRow {
    pub reference: String,
    pub amount: Decimal,
    pub payment_date: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
}

impl StatementRow {
    pub fn into_request(self) -> Result<ConciliationRequest> {
        let payment_date = parse_payment_date(self.payment_date.trim())
            .map_err(|e| PaymentError::ValidationError(e.to_string()))?;
        Ok(ConciliationRequest {
            reference: self.reference,
            amount: self.amount,
            payment_date: Some(payment_date),
            transaction_id: self.transaction_id.filter(|t| !t.trim().is_empty()),
        })
    }
}

/// Reads statement rows from a CSV source.
///
/// Expects a `reference,amount,payment_date,transaction_id` header; whitespace
/// is trimmed and the trailing transaction id column may be omitted.
pub struct StatementReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> StatementReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes rows, so large statements stream instead of being
    /// loaded whole.
    pub fn rows(self) -> impl Iterator<Item = Result<StatementRow>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(PaymentError::from))
    }
}
