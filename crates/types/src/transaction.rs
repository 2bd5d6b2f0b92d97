//! Ledger transactions.

use crate::Hash;
use serde::{Deserialize, Serialize};

/// Processing status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Confirmed,
    Rejected,
}

/// A transaction carried by a block.
///
/// `id` is unique across the whole cluster, so stores key transaction rows by
/// it and inserting the same transaction on another node is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    /// Amount in minor units.
    pub amount: u64,
    pub tx_type: String,
    pub channel: String,
    pub status: TransactionStatus,
    pub timestamp_ms: u64,
    /// Node that originated the transaction.
    pub origin_id: String,
    pub hash: Hash,
    pub offline_flag: bool,
    pub notes: Option<String>,
    pub user_sig: Option<Vec<u8>>,
    pub origin_sig: Option<Vec<u8>>,
    pub authority_sig: Option<Vec<u8>>,
}

impl Transaction {
    /// Create a confirmed transfer with its hash already computed.
    pub fn new(
        id: impl Into<String>,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        amount: u64,
        timestamp_ms: u64,
    ) -> Self {
        let mut tx = Self {
            id: id.into(),
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            amount,
            tx_type: "transfer".to_string(),
            channel: "online".to_string(),
            status: TransactionStatus::Confirmed,
            timestamp_ms,
            origin_id: String::new(),
            hash: Hash::ZERO,
            offline_flag: false,
            notes: None,
            user_sig: None,
            origin_sig: None,
            authority_sig: None,
        };
        tx.hash = tx.compute_hash();
        tx
    }

    pub fn with_origin(mut self, origin_id: impl Into<String>) -> Self {
        self.origin_id = origin_id.into();
        self
    }

    pub fn with_type(mut self, tx_type: impl Into<String>, channel: impl Into<String>) -> Self {
        self.tx_type = tx_type.into();
        self.channel = channel.into();
        self
    }

    pub fn with_offline_flag(mut self, offline: bool) -> Self {
        self.offline_flag = offline;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Hash over the identifying core of the transaction.
    ///
    /// Status, notes and signatures are excluded so they can be attached
    /// after the hash is fixed.
    pub fn compute_hash(&self) -> Hash {
        Hash::from_parts(&[
            b"tx:",
            self.id.as_bytes(),
            b":",
            self.sender_id.as_bytes(),
            b":",
            self.receiver_id.as_bytes(),
            b":",
            &self.amount.to_be_bytes(),
            &self.timestamp_ms.to_be_bytes(),
        ])
    }

    pub fn hash_is_valid(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_covers_core_fields() {
        let tx = Transaction::new("tx-1", "alice", "bob", 500, 1_000);
        assert!(tx.hash_is_valid());

        let mut tampered = tx.clone();
        tampered.amount = 501;
        assert!(!tampered.hash_is_valid());
    }

    #[test]
    fn test_hash_ignores_annotations() {
        let tx = Transaction::new("tx-1", "alice", "bob", 500, 1_000);
        let annotated = tx.clone().with_notes("refund").with_offline_flag(true);
        assert_eq!(tx.hash, annotated.compute_hash());
    }
}
