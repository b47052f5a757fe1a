//! Record state machine behind the mock runtime.
//!
//! A batch of [`TxAction`]s is executed against a staged copy of the ledger
//! and only committed once the enclosing transaction has an id. Every
//! existing record an action touches is spent; touched records that survive
//! become outputs in touch order, destroyed ones take delete slots.

use std::collections::{HashMap, HashSet};

use bitcoin::hashes::Hash;
use serde_json::Value;

use crate::contracts::{BaseClass, Code};
use crate::runtime::{MintArgs, Record, RuntimeError, TxAction};
use crate::script::Txid;
use crate::types::{Bindings, Jig, Location, Owner};
use crate::validation::as_integer;

/// Placeholder txid of records created by an uncommitted execution.
const PENDING_TXID: [u8; 32] = [0; 32];

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    record: Record,
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    /// Latest state by origin.
    records: HashMap<Location, Entry>,
    /// Current location to origin.
    current: HashMap<Location, Location>,
    spent: HashSet<Location>,
    next_seq: u64,
}

/// Who is executing a batch.
#[derive(Debug, Clone, Default)]
pub struct Authority {
    signer: String,
    unlocked: HashSet<Location>,
    defer_locks: bool,
}

impl Authority {
    pub fn signer(address: impl Into<String>) -> Self {
        Self {
            signer: address.into(),
            ..Self::default()
        }
    }

    /// Lock-owned records at these locations have had their unlock verified.
    pub fn unlocking(mut self, locations: impl IntoIterator<Item = Location>) -> Self {
        self.unlocked.extend(locations);
        self
    }

    /// Lock-owned records may be staged; their unlock is checked later.
    pub fn deferring_locks(mut self) -> Self {
        self.defer_locks = true;
        self
    }

    fn may_spend(&self, owner: &Owner, location: &Location) -> bool {
        match owner {
            Owner::Address(address) => *address == self.signer,
            Owner::OrderLock(_) => self.defer_locks || self.unlocked.contains(location),
        }
    }
}

/// A staged, uncommitted batch.
#[derive(Debug, Clone)]
pub struct Execution {
    state: Ledger,
    authority: Authority,
    touched: Vec<Location>,
    inputs: Vec<Location>,
    pending: u32,
}

/// Records written by a committed batch.
#[derive(Debug, Clone, Default)]
pub struct Committed {
    pub outputs: Vec<Record>,
    pub deleted: Vec<Record>,
}

impl Committed {
    pub fn jigs(&self) -> impl Iterator<Item = &Jig> {
        self.outputs.iter().filter_map(Record::as_jig)
    }
}

fn bindings_mut(record: &mut Record) -> &mut Bindings {
    match record {
        Record::Code(code) => &mut code.bindings,
        Record::Jig(jig) => &mut jig.bindings,
    }
}

fn is_destroyed(record: &Record) -> bool {
    record.owner().is_none()
}

fn is_pending(location: &Location) -> bool {
    location.txid.to_byte_array() == PENDING_TXID
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Origin of the record currently at `location`.
    pub fn resolve(&self, location: &Location) -> Result<Location, RuntimeError> {
        if let Some(origin) = self.current.get(location) {
            return Ok(*origin);
        }
        if self.spent.contains(location) {
            return Err(RuntimeError::Spent(*location));
        }
        Err(RuntimeError::NotFound(location.to_string()))
    }

    /// Latest state of the record with `origin`.
    pub fn latest(&self, origin: &Location) -> Option<&Record> {
        self.records.get(origin).map(|entry| &entry.record)
    }

    /// The record whose current location is `location`, if unspent.
    pub fn at(&self, location: &Location) -> Option<&Record> {
        self.current.get(location).and_then(|origin| self.latest(origin))
    }

    /// Jigs held by `address`, oldest first.
    pub fn owned_by(&self, address: &str) -> Vec<Jig> {
        let owner = Owner::from(address);
        self.jigs_where(|jig| jig.owner() == Some(&owner))
    }

    /// Unspent instances of the class with origin `class`, oldest first.
    pub fn unspent_of(&self, class: &Location) -> Vec<Location> {
        self.jigs_where(|jig| jig.class == *class && !jig.is_destroyed())
            .into_iter()
            .map(|jig| jig.location())
            .collect()
    }

    fn jigs_where(&self, keep: impl Fn(&Jig) -> bool) -> Vec<Jig> {
        let mut found: Vec<(u64, &Jig)> = self
            .records
            .values()
            .filter_map(|entry| entry.record.as_jig().map(|jig| (entry.seq, jig)))
            .filter(|(_, jig)| keep(jig))
            .collect();
        found.sort_by_key(|(seq, _)| *seq);
        found.into_iter().map(|(_, jig)| jig.clone()).collect()
    }

    pub fn execute(
        &self,
        actions: &[TxAction],
        authority: Authority,
    ) -> Result<Execution, RuntimeError> {
        if actions.is_empty() {
            return Err(RuntimeError::EmptyTransaction);
        }
        let mut exec = Execution {
            state: self.clone(),
            authority,
            touched: Vec::new(),
            inputs: Vec::new(),
            pending: 0,
        };
        for action in actions {
            exec.apply(action)?;
        }
        Ok(exec)
    }

    /// Assigns `txid` locations to every record `exec` touched. Outputs are
    /// numbered from `first_vout`.
    pub fn commit(&mut self, exec: Execution, txid: Txid, first_vout: u32) -> Committed {
        let Execution {
            mut state, touched, ..
        } = exec;
        let mut committed = Committed::default();
        let mut vout = first_vout;
        let mut deletes = 0;

        for key in touched {
            let Some(mut entry) = state.records.remove(&key) else {
                continue;
            };
            let destroyed = is_destroyed(&entry.record);
            let location = if destroyed {
                deletes += 1;
                Location::deleted(txid, deletes - 1)
            } else {
                vout += 1;
                Location::output(txid, vout - 1)
            };

            let bindings = bindings_mut(&mut entry.record);
            let prior = bindings.location;
            if is_pending(&key) {
                bindings.origin = location;
                bindings.nonce = 1;
            } else {
                bindings.nonce += 1;
                self.current.remove(&prior);
                self.spent.insert(prior);
            }
            bindings.location = location;
            let origin = bindings.origin;

            if !destroyed {
                self.current.insert(location, origin);
            }
            let record = entry.record.clone();
            self.records.insert(origin, entry);
            if destroyed {
                committed.deleted.push(record);
            } else {
                committed.outputs.push(record);
            }
        }
        self.next_seq = state.next_seq;
        committed
    }
}

impl Execution {
    /// Prior locations of every existing record the batch spends.
    pub fn inputs(&self) -> &[Location] {
        &self.inputs
    }

    /// Surviving records in output order.
    pub fn outputs(&self) -> Vec<&Record> {
        self.staged().filter(|record| !is_destroyed(record)).collect()
    }

    pub fn deletes(&self) -> Vec<&Record> {
        self.staged().filter(|record| is_destroyed(record)).collect()
    }

    fn staged(&self) -> impl Iterator<Item = &Record> {
        self.touched
            .iter()
            .filter_map(|key| self.state.records.get(key).map(|entry| &entry.record))
    }

    fn spend(&mut self, location: &Location, action: &'static str) -> Result<Location, RuntimeError> {
        let origin = self.state.resolve(location)?;
        let owner = self
            .state
            .latest(&origin)
            .ok_or_else(|| RuntimeError::NotFound(location.to_string()))?
            .owner()
            .cloned();
        match owner {
            None => {
                return Err(RuntimeError::Destroyed {
                    action,
                    location: *location,
                })
            }
            Some(owner) if !self.authority.may_spend(&owner, location) => {
                return Err(RuntimeError::Unauthorized {
                    action,
                    location: *location,
                })
            }
            Some(_) => {}
        }
        if !self.touched.contains(&origin) {
            self.touched.push(origin);
            self.inputs.push(*location);
        }
        Ok(origin)
    }

    fn create(&mut self, record: impl FnOnce(Bindings) -> Record, owner: Owner) -> Location {
        let key = Location::output(Txid::from_byte_array(PENDING_TXID), self.pending);
        self.pending += 1;
        let bindings = Bindings {
            location: key,
            origin: key,
            nonce: 0,
            owner: Some(owner),
            satoshis: 0,
        };
        let seq = self.state.next_seq;
        self.state.next_seq += 1;
        self.state.records.insert(
            key,
            Entry {
                seq,
                record: record(bindings),
            },
        );
        self.touched.push(key);
        key
    }

    fn code_mut(&mut self, origin: &Location) -> Result<&mut Code, RuntimeError> {
        match self.state.records.get_mut(origin).map(|entry| &mut entry.record) {
            Some(Record::Code(code)) => Ok(code),
            _ => Err(RuntimeError::NotFound(format!("class {}", origin))),
        }
    }

    fn jig_mut(&mut self, origin: &Location) -> Result<&mut Jig, RuntimeError> {
        match self.state.records.get_mut(origin).map(|entry| &mut entry.record) {
            Some(Record::Jig(jig)) => Ok(jig),
            _ => Err(RuntimeError::NotFound(format!("jig {}", origin))),
        }
    }

    fn apply(&mut self, action: &TxAction) -> Result<(), RuntimeError> {
        match action {
            TxAction::Deploy { class } => {
                let owner = Owner::from(self.authority.signer.clone());
                let class = class.clone();
                self.create(|bindings| Record::Code(Code { bindings, class }), owner);
            }
            TxAction::Upgrade { code, class } => {
                let origin = self.spend(code, "upgrade")?;
                let current = self.code_mut(&origin)?;
                if !current.class.is_upgradable() {
                    return Err(RuntimeError::NotUpgradable);
                }
                if current.class.base != class.base {
                    return Err(RuntimeError::Unsupported(
                        current.class.name.clone(),
                        "change its base class",
                    ));
                }
                current.class = class.clone();
            }
            TxAction::TransferClass { code, to } => {
                let origin = self.spend(code, "transfer")?;
                let current = self.code_mut(&origin)?;
                if !current.class.transferable {
                    return Err(RuntimeError::NotTransferable);
                }
                current.bindings.owner = Some(to.clone());
            }
            TxAction::Mint { code, args } => self.mint(code, args)?,
            TxAction::Combine { target, others } => self.combine(target, others)?,
            TxAction::Send { jig, to, amount } => self.send(jig, to, *amount)?,
            TxAction::Destroy { jig } => {
                let origin = self.spend(jig, "destroy")?;
                self.jig_mut(&origin)?.bindings.owner = None;
            }
        }
        Ok(())
    }

    fn mint(&mut self, code: &Location, args: &MintArgs) -> Result<(), RuntimeError> {
        let class = self.spend(code, "mint")?;
        let current = self.code_mut(&class)?;
        let (amount, number) = match (current.class.base, args) {
            (BaseClass::Token, MintArgs::Fungible { amount, .. }) => {
                if *amount == 0 {
                    return Err(RuntimeError::InvalidAmount(0));
                }
                let supply = current
                    .supply()
                    .checked_add(*amount)
                    .ok_or(RuntimeError::InvalidAmount(*amount))?;
                current.class.props.insert("supply".into(), Value::from(supply));
                (Some(*amount), None)
            }
            (BaseClass::Nft, MintArgs::NonFungible { .. }) => {
                let supply = current.supply();
                if matches!(current.class.max_supply(), Some(max) if supply >= max) {
                    return Err(RuntimeError::MaxSupplyExceeded);
                }
                let total = current.prop("total").and_then(as_integer).unwrap_or(0);
                current.class.props.insert("supply".into(), Value::from(supply + 1));
                current.class.props.insert("total".into(), Value::from(total + 1));
                (None, Some(supply + 1))
            }
            _ => {
                return Err(RuntimeError::Unsupported(
                    current.class.name.clone(),
                    "mint with these arguments",
                ))
            }
        };
        self.create(
            |bindings| {
                Record::Jig(Jig {
                    bindings,
                    class,
                    amount,
                    number,
                    sender: None,
                })
            },
            args.owner().clone(),
        );
        Ok(())
    }

    fn combine(&mut self, target: &Location, others: &[Location]) -> Result<(), RuntimeError> {
        let origin = self.spend(target, "combine")?;
        let (class, mut total) = {
            let jig = self.jig_mut(&origin)?;
            let amount = jig
                .amount
                .ok_or_else(|| RuntimeError::Unsupported(target.to_string(), "combine"))?;
            (jig.class, amount)
        };
        for location in others {
            let other = self.spend(location, "combine")?;
            if other == origin {
                return Err(RuntimeError::Unsupported(
                    location.to_string(),
                    "combine with itself",
                ));
            }
            let jig = self.jig_mut(&other)?;
            if jig.class != class {
                return Err(RuntimeError::ClassMismatch);
            }
            let amount = jig.amount();
            total = total
                .checked_add(amount)
                .ok_or(RuntimeError::InvalidAmount(amount))?;
            jig.amount = Some(0);
            jig.bindings.owner = None;
        }
        self.jig_mut(&origin)?.amount = Some(total);
        Ok(())
    }

    fn send(&mut self, location: &Location, to: &Owner, amount: Option<u64>) -> Result<(), RuntimeError> {
        let origin = self.spend(location, "send")?;
        let jig = self.jig_mut(&origin)?;
        let sender = jig.bindings.owner.clone();
        let held = match jig.amount {
            // Non-fungible units always move whole.
            None => {
                jig.sender = sender;
                jig.bindings.owner = Some(to.clone());
                return Ok(());
            }
            Some(held) => held,
        };

        let amount = amount.unwrap_or(held);
        if amount == 0 {
            return Err(RuntimeError::InvalidAmount(0));
        }
        if amount > held {
            return Err(RuntimeError::NotEnoughFunds);
        }
        if amount == held {
            jig.sender = sender;
            jig.bindings.owner = Some(to.clone());
            return Ok(());
        }

        jig.amount = Some(held - amount);
        let class = jig.class;
        self.create(
            |bindings| {
                Record::Jig(Jig {
                    bindings,
                    class,
                    amount: Some(amount),
                    number: None,
                    sender,
                })
            },
            to.clone(),
        );
        Ok(())
    }
}
