//! The runtime collaborator.
//!
//! Contract execution, signing, indexing and broadcasting all belong to the
//! wrapped smart-contract runtime. [`RunInstance`] is the seam tokenkit
//! talks to it through; [`RunTransaction`] is the batch of contract calls a
//! single on-chain transaction carries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::{ClassDef, Code};
use crate::order_lock::OrderLockError;
use crate::script::{ScriptError, Transaction, TxOut, Txid};
use crate::storage::StorageError;
use crate::types::{Jig, Location, Network, Owner};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Not enough funds")]
    NotEnoughFunds,
    #[error("Maximum supply exceeded")]
    MaxSupplyExceeded,
    #[error("Class is not upgradable")]
    NotUpgradable,
    #[error("Class is not transferable")]
    NotTransferable,
    #[error("Invalid amount: {0}")]
    InvalidAmount(u64),
    #[error("Cannot combine jigs of different classes")]
    ClassMismatch,
    #[error("{0} cannot {1}")]
    Unsupported(String, &'static str),
    #[error("Cannot {action} {location}: not owned by the signer")]
    Unauthorized { action: &'static str, location: Location },
    #[error("Cannot {action} {location}: jig has been destroyed")]
    Destroyed { action: &'static str, location: Location },
    #[error("Inconsistent worldview: {0} has been spent")]
    Spent(Location),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Nothing to publish")]
    EmptyTransaction,
    #[error("Script verification failed for input {vin}: {reason}")]
    Verification { vin: usize, reason: String },
    #[error("Bad transaction: {0}")]
    BadTransaction(String),
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
    #[error("Lock error: {0}")]
    Lock(#[from] OrderLockError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Arguments of a class `mint` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MintArgs {
    Fungible { amount: u64, owner: Owner },
    NonFungible { owner: Owner },
}

impl MintArgs {
    pub fn owner(&self) -> &Owner {
        match self {
            MintArgs::Fungible { owner, .. } | MintArgs::NonFungible { owner } => owner,
        }
    }
}

/// One contract call recorded into a [`RunTransaction`]. Records are
/// referenced by the location the caller last saw them at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum TxAction {
    Deploy { class: ClassDef },
    Upgrade { code: Location, class: ClassDef },
    #[serde(rename_all = "camelCase")]
    TransferClass { code: Location, to: Owner },
    Mint { code: Location, args: MintArgs },
    Combine { target: Location, others: Vec<Location> },
    Send { jig: Location, to: Owner, amount: Option<u64> },
    Destroy { jig: Location },
}

/// A batch of contract calls published atomically, optionally on top of a
/// base transaction whose outputs come first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTransaction {
    base: Option<Transaction>,
    actions: Vec<TxAction>,
}

impl RunTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base(base: Transaction) -> Self {
        Self {
            base: Some(base),
            actions: Vec::new(),
        }
    }

    pub fn base(&self) -> Option<&Transaction> {
        self.base.as_ref()
    }

    pub fn update(&mut self, action: TxAction) -> &mut Self {
        self.actions.push(action);
        self
    }

    pub fn actions(&self) -> &[TxAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// A record as it exists after a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "camelCase")]
pub enum Record {
    Code(Code),
    Jig(Jig),
}

impl Record {
    pub fn location(&self) -> Location {
        match self {
            Record::Code(code) => code.bindings.location,
            Record::Jig(jig) => jig.bindings.location,
        }
    }

    pub fn origin(&self) -> Location {
        match self {
            Record::Code(code) => code.bindings.origin,
            Record::Jig(jig) => jig.bindings.origin,
        }
    }

    pub fn owner(&self) -> Option<&Owner> {
        match self {
            Record::Code(code) => code.bindings.owner.as_ref(),
            Record::Jig(jig) => jig.bindings.owner.as_ref(),
        }
    }

    pub fn as_jig(&self) -> Option<&Jig> {
        match self {
            Record::Jig(jig) => Some(jig),
            Record::Code(_) => None,
        }
    }

    pub fn as_code(&self) -> Option<&Code> {
        match self {
            Record::Code(code) => Some(code),
            Record::Jig(_) => None,
        }
    }
}

/// Outcome of a published transaction: its id, every output record in
/// output order and the records it destroyed.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub txid: Txid,
    pub records: Vec<Record>,
    pub deleted: Vec<Record>,
}

impl Receipt {
    pub fn jigs(&self) -> impl Iterator<Item = &Jig> {
        self.records.iter().filter_map(Record::as_jig)
    }

    pub fn codes(&self) -> impl Iterator<Item = &Code> {
        self.records.iter().filter_map(Record::as_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportOptions {
    /// Sign inputs the owner controls.
    pub sign: bool,
    /// Add purse inputs to cover the outputs.
    pub pay: bool,
}

/// The active runtime instance every tokenkit operation is issued against.
#[async_trait]
pub trait RunInstance: Send + Sync {
    fn network(&self) -> Network;

    /// Address jigs are minted and returned to.
    fn owner_address(&self) -> String;

    /// Address of the purse paying for transactions.
    fn purse_address(&self) -> String;

    /// Owner for records received in the next transaction.
    async fn next_owner(&self) -> Result<Owner, RuntimeError>;

    /// Loads a class exactly as it was at `location`.
    async fn load_code(&self, location: &Location) -> Result<Code, RuntimeError>;

    /// Brings a class up to its latest state.
    async fn sync_code(&self, code: &Code) -> Result<Code, RuntimeError>;

    /// Loads a jig exactly as it was at `location`.
    async fn load_jig(&self, location: &Location) -> Result<Jig, RuntimeError>;

    /// Brings a jig up to its latest state.
    async fn sync_jig(&self, jig: &Jig) -> Result<Jig, RuntimeError>;

    async fn publish(&self, tx: RunTransaction) -> Result<Receipt, RuntimeError>;

    /// Builds the raw transaction for `tx` without publishing it.
    async fn export(&self, tx: &RunTransaction, options: ExportOptions) -> Result<String, RuntimeError>;

    /// Discards local state changes recorded by `tx`.
    async fn rollback(&self, tx: &RunTransaction) -> Result<(), RuntimeError>;

    /// Syncs and returns the jigs currently held by the owner.
    async fn inventory(&self) -> Result<Vec<Jig>, RuntimeError>;

    /// Unspent jig locations of the class with origin `class`.
    async fn unspent(&self, class: &Location) -> Result<Vec<Location>, RuntimeError>;

    async fn fetch_tx(&self, txid: &Txid) -> Result<String, RuntimeError>;

    async fn broadcast(&self, rawtx: &str) -> Result<Txid, RuntimeError>;

    /// Signs every input the purse can unlock.
    async fn sign_with_purse(&self, tx: &mut Transaction) -> Result<(), RuntimeError>;

    /// Runs input `vin` of `tx` against the output it spends.
    async fn verify_script(&self, tx: &Transaction, vin: usize, locked: &TxOut) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::BaseClass;

    #[test]
    fn actions_serialize_with_op_tag() {
        let action = TxAction::Deploy {
            class: ClassDef::builder("FooCoin", BaseClass::Token).build(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["op"], "deploy");
        let back: TxAction = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn update_appends_in_order() {
        let loc: Location = "d6170025a62248d8df6dc14e3806e68b8df3d804c800c7bfb23b0b4232862505_o1"
            .parse()
            .unwrap();
        let mut tx = RunTransaction::new();
        assert!(tx.is_empty());
        tx.update(TxAction::Destroy { jig: loc })
            .update(TxAction::Send { jig: loc, to: Owner::from("a"), amount: Some(1) });
        assert_eq!(tx.actions().len(), 2);
        assert!(matches!(tx.actions()[0], TxAction::Destroy { .. }));
        assert!(tx.base().is_none());
    }
}
