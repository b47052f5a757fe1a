//! Core type definitions for tokenkit.
//!
//! Locations, owners and the holding-unit ("jig") record shared by the
//! token, box and offer layers and by the runtime collaborator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::order_lock::{OrderLock, OrderLockError};
use crate::script::{self, NetworkKind, ScriptBuf, Txid};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("Invalid location: {0}")]
    InvalidLocation(String),
    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

/// Where a record lives: output `N` (`<txid>_oN`) or, once destroyed, the
/// delete slot `N` (`<txid>_dN`) of the transaction that last touched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Location {
    pub txid: Txid,
    pub slot: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Output(u32),
    Delete(u32),
}

impl Location {
    pub fn output(txid: Txid, vout: u32) -> Self {
        Self {
            txid,
            slot: Slot::Output(vout),
        }
    }

    pub fn deleted(txid: Txid, index: u32) -> Self {
        Self {
            txid,
            slot: Slot::Delete(index),
        }
    }

    /// Output index, if the location points at an unspent-able output.
    pub fn vout(&self) -> Option<u32> {
        match self.slot {
            Slot::Output(vout) => Some(vout),
            Slot::Delete(_) => None,
        }
    }
}

impl FromStr for Location {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeError::InvalidLocation(s.to_string());
        let (txid, rest) = s.split_once('_').ok_or_else(invalid)?;
        let txid: Txid = txid.parse().map_err(|_| invalid())?;
        let slot = if let Some(n) = rest.strip_prefix('o') {
            Slot::Output(n.parse().map_err(|_| invalid())?)
        } else if let Some(n) = rest.strip_prefix('d') {
            Slot::Delete(n.parse().map_err(|_| invalid())?)
        } else {
            return Err(invalid());
        };
        Ok(Self { txid, slot })
    }
}

impl TryFrom<String> for Location {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Location> for String {
    fn from(location: Location) -> Self {
        location.to_string()
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.slot {
            Slot::Output(n) => write!(f, "{}_o{}", self.txid, n),
            Slot::Delete(n) => write!(f, "{}_d{}", self.txid, n),
        }
    }
}

/// Network the runtime instance is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Main,
    Test,
    Mock,
}

impl Network {
    /// Address encoding used on this network. The mock uses testnet
    /// addresses.
    pub fn address_kind(self) -> NetworkKind {
        match self {
            Network::Main => NetworkKind::Main,
            Network::Test | Network::Mock => NetworkKind::Test,
        }
    }
}

impl FromStr for Network {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Network::Main),
            "test" | "testnet" => Ok(Network::Test),
            "mock" => Ok(Network::Mock),
            _ => Err(TypeError::UnknownNetwork(s.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Mock => "mock",
        })
    }
}

/// Who may spend a record: a plain address or an offer lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Owner {
    Address(String),
    OrderLock(OrderLock),
}

impl Owner {
    pub fn address(&self) -> &str {
        match self {
            Owner::Address(address) => address,
            Owner::OrderLock(lock) => lock.address(),
        }
    }

    pub fn as_order_lock(&self) -> Option<&OrderLock> {
        match self {
            Owner::OrderLock(lock) => Some(lock),
            Owner::Address(_) => None,
        }
    }

    /// Locking script of an output owned by `self`.
    pub fn script(&self) -> Result<ScriptBuf, OrderLockError> {
        match self {
            Owner::Address(address) => Ok(script::p2pkh_script(address)?),
            Owner::OrderLock(lock) => lock.script(),
        }
    }
}

impl From<&str> for Owner {
    fn from(address: &str) -> Self {
        Owner::Address(address.to_string())
    }
}

impl From<String> for Owner {
    fn from(address: String) -> Self {
        Owner::Address(address)
    }
}

impl From<OrderLock> for Owner {
    fn from(lock: OrderLock) -> Self {
        Owner::OrderLock(lock)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Address(address) => f.write_str(address),
            Owner::OrderLock(lock) => write!(f, "OrderLock({}, {})", lock.address(), lock.satoshis()),
        }
    }
}

/// Bindings the runtime attaches to every deployed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bindings {
    pub location: Location,
    pub origin: Location,
    pub nonce: u64,
    /// `None` once the record has been destroyed.
    pub owner: Option<Owner>,
    pub satoshis: u64,
}

/// A single on-chain token instance.
///
/// Fungible units carry an `amount`; non-fungible ones a sequential
/// `number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jig {
    #[serde(flatten)]
    pub bindings: Bindings,
    /// Origin of the class this unit is an instance of.
    pub class: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Owner>,
}

impl Jig {
    pub fn location(&self) -> Location {
        self.bindings.location
    }

    pub fn origin(&self) -> Location {
        self.bindings.origin
    }

    pub fn owner(&self) -> Option<&Owner> {
        self.bindings.owner.as_ref()
    }

    /// Fungible amount; non-fungible units hold zero.
    pub fn amount(&self) -> u64 {
        self.amount.unwrap_or(0)
    }

    pub fn is_destroyed(&self) -> bool {
        self.bindings.owner.is_none()
    }
}
