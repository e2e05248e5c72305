use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::message::MovementType;

/// Request to settle a quantity of a security between two participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub security_id: String,
    pub quantity: Decimal,
    /// Participant code credited by the RECE leg
    pub seller: String,
    /// Participant code debited by the DELI leg
    pub buyer: String,
    pub trade_date: NaiveDate,
    pub settlement_date: NaiveDate,
    pub queue_name: String,
    /// Caller-supplied correlation id; generated when absent
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl SettlementRequest {
    /// Same-day settlement request, mostly for tests and the CLI
    pub fn new(
        security_id: &str,
        quantity: Decimal,
        seller: &str,
        buyer: &str,
        queue_name: &str,
        date: NaiveDate,
    ) -> Self {
        Self {
            security_id: security_id.to_string(),
            quantity,
            seller: seller.to_string(),
            buyer: buyer.to_string(),
            trade_date: date,
            settlement_date: date,
            queue_name: queue_name.to_string(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    /// Instruction carried as the body of one leg
    pub fn instruction(
        &self,
        movement_type: MovementType,
        transaction_id: &str,
        linked_transaction_id: &str,
        correlation_id: &str,
    ) -> SettlementInstruction {
        let (participant, counterparty) = match movement_type {
            MovementType::Deli => (&self.buyer, &self.seller),
            _ => (&self.seller, &self.buyer),
        };

        SettlementInstruction {
            transaction_id: transaction_id.to_string(),
            linked_transaction_id: linked_transaction_id.to_string(),
            correlation_id: correlation_id.to_string(),
            movement_type,
            security_id: self.security_id.clone(),
            quantity: self.quantity,
            participant: participant.clone(),
            counterparty: counterparty.clone(),
            trade_date: self.trade_date,
            settlement_date: self.settlement_date,
        }
    }
}

/// Serialized body of a settlement leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementInstruction {
    pub transaction_id: String,
    pub linked_transaction_id: String,
    pub correlation_id: String,
    pub movement_type: MovementType,
    pub security_id: String,
    pub quantity: Decimal,
    pub participant: String,
    pub counterparty: String,
    pub trade_date: NaiveDate,
    pub settlement_date: NaiveDate,
}
