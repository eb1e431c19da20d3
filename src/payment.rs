// Local payment ledger entry created alongside each reservation.
// No gateway is contacted; settlement arrives from outside through `SettlementOutcome`.

use crate::error::TransitionError;
use crate::model::{GuestId, PaymentId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    Wallet,
    BankTransfer,
    Crypto,
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::CreditCard => "CREDIT_CARD",
            PaymentMethod::DebitCard => "DEBIT_CARD",
            PaymentMethod::Wallet => "WALLET",
            PaymentMethod::BankTransfer => "BANK_TRANSFER",
            PaymentMethod::Crypto => "CRYPTO",
            PaymentMethod::Cash => "CASH",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Result of an external payment settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    // Unique across all payments
    pub transaction_id: String,
    pub guest_id: GuestId,
    // Method-specific blob, stored as given
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn pending(
        guest_id: GuestId,
        amount: Decimal,
        currency: impl Into<String>,
        method: PaymentMethod,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            amount,
            currency: currency.into(),
            method,
            status: PaymentStatus::Pending,
            transaction_id: Uuid::new_v4().to_string(),
            guest_id,
            details,
            created_at: now,
            updated_at: now,
        }
    }

    // Only a pending payment can be settled
    pub fn settle(
        &mut self,
        outcome: SettlementOutcome,
        now: DateTime<Utc>,
    ) -> Result<PaymentStatus, TransitionError> {
        if self.status != PaymentStatus::Pending {
            return Err(TransitionError::PaymentNotPending(self.status));
        }
        self.status = match outcome {
            SettlementOutcome::Succeeded => PaymentStatus::Success,
            SettlementOutcome::Failed => PaymentStatus::Failed,
        };
        self.updated_at = now;
        Ok(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;
    use serde_json::json;

    fn pending_payment() -> Payment {
        Payment::pending(
            GuestId::new(),
            Decimal::from_u32(480).unwrap(),
            "USD",
            PaymentMethod::CreditCard,
            json!({"last_four": "4242"}),
            Utc::now(),
        )
    }

    #[test]
    fn test_pending_payment_gets_unique_transaction_id() {
        let a = pending_payment();
        let b = pending_payment();
        assert_eq!(a.status, PaymentStatus::Pending);
        assert_ne!(a.transaction_id, b.transaction_id);
    }

    #[test]
    fn test_settle_once() {
        let mut payment = pending_payment();
        assert_eq!(
            payment.settle(SettlementOutcome::Succeeded, Utc::now()),
            Ok(PaymentStatus::Success)
        );
        assert_eq!(
            payment.settle(SettlementOutcome::Failed, Utc::now()),
            Err(TransitionError::PaymentNotPending(PaymentStatus::Success))
        );
    }

    #[test]
    fn test_method_wire_names() {
        assert_eq!(
            serde_json::to_value(PaymentMethod::BankTransfer).unwrap(),
            json!("BANK_TRANSFER")
        );
        assert_eq!(
            serde_json::from_value::<PaymentMethod>(json!("WALLET")).unwrap(),
            PaymentMethod::Wallet
        );
        assert_eq!(PaymentStatus::Refunded.to_string(), "REFUNDED");
    }
}
