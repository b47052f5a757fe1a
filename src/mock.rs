//! An in-process runtime.
//!
//! `MockRun` executes contract calls on a local [`Ledger`], materialises
//! every batch as a real transaction (base outputs, an `OP_RETURN` carrying
//! the calls, then one dust output per record) and keeps raw transactions
//! and record states in a [`StateCache`]. Offer locks are evaluated on
//! broadcast, so take and cancel flows run end to end without a network.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::{all::OP_RETURN, OP_FALSE};
use bitcoin::script::{Builder, Instruction};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::contracts::Code;
use crate::ledger::{Authority, Committed, Execution, Ledger};
use crate::order_lock::{self, DUST_LIMIT};
use crate::runtime::{
    ExportOptions, Receipt, Record, RunInstance, RunTransaction, RuntimeError, TxAction,
};
use crate::script::{
    address_from_hash, decode_tx, instructions, new_transaction, push_bytes, sha256d, tx_out,
    Script, ScriptBuf, Transaction, TransactionExt, TxIn, TxOut, Txid,
};
use crate::storage::{get_json, jig_key, tx_key, MemoryCache, StateCache, StorageBatch};
use crate::types::{Jig, Location, Network, Owner};

const PROTOCOL_PREFIX: &[u8] = b"run";
const PROTOCOL_VERSION: u8 = 0x05;
const APP_ID: &[u8] = b"tokenkit";

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    actions: Vec<TxAction>,
}

struct MockState {
    ledger: Ledger,
    funded: u64,
}

pub struct MockRun {
    network: Network,
    owner: String,
    purse: String,
    cache: Arc<dyn StateCache>,
    state: Mutex<MockState>,
}

fn random_address(network: Network) -> String {
    let mut hash = [0u8; 20];
    rand::thread_rng().fill(&mut hash);
    address_from_hash(network.address_kind(), &hash)
}

fn metadata_script(actions: &[TxAction]) -> Result<ScriptBuf, RuntimeError> {
    let payload = serde_json::to_vec(&Metadata {
        actions: actions.to_vec(),
    })?;
    Ok(Builder::new()
        .push_opcode(OP_FALSE)
        .push_opcode(OP_RETURN)
        .push_slice(push_bytes(PROTOCOL_PREFIX)?)
        .push_slice(push_bytes(&[PROTOCOL_VERSION])?)
        .push_slice(push_bytes(APP_ID)?)
        .push_slice(push_bytes(&payload)?)
        .into_script())
}

fn parse_metadata(script: &Script) -> Option<Vec<TxAction>> {
    let parsed = instructions(script).ok()?;
    match parsed.as_slice() {
        [Instruction::PushBytes(zero), Instruction::Op(op), Instruction::PushBytes(prefix), Instruction::PushBytes(version), Instruction::PushBytes(_app), Instruction::PushBytes(payload)]
            if zero.is_empty()
                && *op == OP_RETURN
                && prefix.as_bytes() == PROTOCOL_PREFIX
                && version.as_bytes() == &[PROTOCOL_VERSION][..] =>
        {
            serde_json::from_slice::<Metadata>(payload.as_bytes())
                .ok()
                .map(|metadata| metadata.actions)
        }
        _ => None,
    }
}

/// Placeholder P2PKH unlocking data. The mock only evaluates offer locks.
fn placeholder_signature(tx: &Transaction, vin: usize, address: &str) -> Result<ScriptBuf, RuntimeError> {
    let mut digest_input = serialize(tx);
    digest_input.extend_from_slice(&(vin as u32).to_le_bytes());
    let mut sig = sha256d(&digest_input).to_vec();
    sig.push(0x41);
    let mut key = vec![0x02];
    key.extend_from_slice(&sha256d(address.as_bytes()));

    Ok(Builder::new()
        .push_slice(push_bytes(&sig)?)
        .push_slice(push_bytes(&key)?)
        .into_script())
}

fn input_location(input: &TxIn) -> Location {
    Location::output(input.previous_output.txid, input.previous_output.vout)
}

impl MockRun {
    /// A fresh runtime with random owner and purse keys and an in-memory
    /// cache.
    pub fn new() -> Self {
        Self::with_cache(Arc::new(MemoryCache::new()))
    }

    pub fn with_cache(cache: Arc<dyn StateCache>) -> Self {
        let network = Network::Mock;
        Self::with_addresses(random_address(network), random_address(network), cache)
    }

    pub fn with_addresses(
        owner: impl Into<String>,
        purse: impl Into<String>,
        cache: Arc<dyn StateCache>,
    ) -> Self {
        Self {
            network: Network::Mock,
            owner: owner.into(),
            purse: purse.into(),
            cache,
            state: Mutex::new(MockState {
                ledger: Ledger::new(),
                funded: 0,
            }),
        }
    }

    /// Lays out the transaction for `exec`. Returns it with the index of
    /// the first record output.
    fn build(
        &self,
        state: &mut MockState,
        exec: &Execution,
        rtx: &RunTransaction,
        pay: bool,
    ) -> Result<(Transaction, u32), RuntimeError> {
        let mut tx = rtx.base().cloned().unwrap_or_else(new_transaction);
        for location in exec.inputs() {
            let vout = location
                .vout()
                .ok_or_else(|| RuntimeError::BadTransaction(format!("{} is not an output", location)))?;
            tx.spend_outpoint(location.txid, vout);
        }
        if pay {
            state.funded += 1;
            let utxo = sha256d(format!("{}:{}", self.purse, state.funded).as_bytes());
            tx.spend_outpoint(Txid::from_byte_array(utxo), 0);
        }

        tx.output.push(tx_out(0, metadata_script(rtx.actions())?));
        let first_vout = tx.output.len() as u32;
        for record in exec.outputs() {
            let owner = record
                .owner()
                .ok_or_else(|| RuntimeError::BadTransaction("destroyed record output".into()))?;
            let satoshis = match record {
                Record::Code(code) => code.bindings.satoshis,
                Record::Jig(jig) => jig.bindings.satoshis,
            };
            tx.output.push(tx_out(satoshis.max(DUST_LIMIT), owner.script()?));
        }
        Ok((tx, first_vout))
    }

    /// Fills every unsigned input that does not spend an offer lock.
    fn sign_inputs(&self, ledger: &Ledger, tx: &mut Transaction) -> Result<(), RuntimeError> {
        let unsigned: Vec<usize> = tx
            .input
            .iter()
            .enumerate()
            .filter(|(_, input)| input.script_sig.is_empty())
            .filter(|(_, input)| {
                let locked = ledger
                    .at(&input_location(input))
                    .and_then(Record::owner)
                    .and_then(Owner::as_order_lock)
                    .is_some();
                !locked
            })
            .map(|(vin, _)| vin)
            .collect();
        for vin in unsigned {
            let script = placeholder_signature(tx, vin, &self.purse)?;
            tx.input[vin].script_sig = script;
        }
        Ok(())
    }

    fn persist(&self, tx: &Transaction, committed: &Committed) -> Result<(), RuntimeError> {
        let mut batch = StorageBatch::new();
        batch.put(tx_key(&tx.compute_txid()), tx.to_raw_hex().into_bytes());
        for record in committed.outputs.iter().chain(&committed.deleted) {
            batch.put_json(jig_key(&record.location()), record)?;
        }
        self.cache.apply_batch(batch)?;
        Ok(())
    }

    fn cached_record(&self, location: &Location) -> Result<Record, RuntimeError> {
        get_json::<Record>(self.cache.as_ref(), &jig_key(location))?
            .ok_or_else(|| RuntimeError::NotFound(location.to_string()))
    }

    fn cached_tx(&self, txid: &Txid) -> Result<Transaction, RuntimeError> {
        let raw = self
            .cache
            .get(&tx_key(txid))?
            .ok_or_else(|| RuntimeError::NotFound(format!("transaction {}", txid)))?;
        let raw = String::from_utf8(raw)
            .map_err(|_| RuntimeError::BadTransaction(format!("cached {} is not hex", txid)))?;
        Ok(decode_tx(&raw)?)
    }

    /// Verifies every input that spends an offer lock. Returns the locked
    /// record locations that were unlocked.
    fn check_locks(&self, ledger: &Ledger, tx: &Transaction) -> Result<Vec<Location>, RuntimeError> {
        let mut unlocked = Vec::new();
        for (vin, input) in tx.input.iter().enumerate() {
            let location = input_location(input);
            let is_locked = ledger
                .at(&location)
                .and_then(Record::owner)
                .and_then(Owner::as_order_lock)
                .is_some();
            if !is_locked {
                continue;
            }
            let prev = self.cached_tx(&input.previous_output.txid)?;
            let locked = prev
                .output
                .get(input.previous_output.vout as usize)
                .ok_or_else(|| RuntimeError::NotFound(location.to_string()))?;
            let spend = order_lock::verify_unlock(tx, vin, locked).map_err(|e| {
                RuntimeError::Verification {
                    vin,
                    reason: e.to_string(),
                }
            })?;
            debug!(vin, ?spend, %location, "offer lock satisfied");
            unlocked.push(location);
        }
        Ok(unlocked)
    }
}

impl Default for MockRun {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunInstance for MockRun {
    fn network(&self) -> Network {
        self.network
    }

    fn owner_address(&self) -> String {
        self.owner.clone()
    }

    fn purse_address(&self) -> String {
        self.purse.clone()
    }

    async fn next_owner(&self) -> Result<Owner, RuntimeError> {
        Ok(Owner::from(self.owner.clone()))
    }

    async fn load_code(&self, location: &Location) -> Result<Code, RuntimeError> {
        match self.cached_record(location)? {
            Record::Code(code) => Ok(code),
            Record::Jig(_) => Err(RuntimeError::NotFound(format!("class {}", location))),
        }
    }

    async fn sync_code(&self, code: &Code) -> Result<Code, RuntimeError> {
        let state = self.state.lock().await;
        state
            .ledger
            .latest(&code.origin())
            .and_then(Record::as_code)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(code.origin().to_string()))
    }

    async fn load_jig(&self, location: &Location) -> Result<Jig, RuntimeError> {
        match self.cached_record(location)? {
            Record::Jig(jig) => Ok(jig),
            Record::Code(_) => Err(RuntimeError::NotFound(format!("jig {}", location))),
        }
    }

    async fn sync_jig(&self, jig: &Jig) -> Result<Jig, RuntimeError> {
        let state = self.state.lock().await;
        state
            .ledger
            .latest(&jig.origin())
            .and_then(Record::as_jig)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(jig.origin().to_string()))
    }

    async fn publish(&self, rtx: RunTransaction) -> Result<Receipt, RuntimeError> {
        let mut state = self.state.lock().await;
        let exec = state
            .ledger
            .execute(rtx.actions(), Authority::signer(self.owner.clone()))?;
        let (mut tx, first_vout) = self.build(&mut state, &exec, &rtx, true)?;
        self.sign_inputs(&state.ledger, &mut tx)?;

        let txid = tx.compute_txid();
        let committed = state.ledger.commit(exec, txid, first_vout);
        self.persist(&tx, &committed)?;
        info!(%txid, actions = rtx.actions().len(), outputs = committed.outputs.len(), "published");

        Ok(Receipt {
            txid,
            records: committed.outputs,
            deleted: committed.deleted,
        })
    }

    async fn export(&self, rtx: &RunTransaction, options: ExportOptions) -> Result<String, RuntimeError> {
        let mut state = self.state.lock().await;
        let exec = state.ledger.execute(
            rtx.actions(),
            Authority::signer(self.owner.clone()).deferring_locks(),
        )?;
        let (mut tx, _) = self.build(&mut state, &exec, rtx, options.pay)?;
        if options.sign {
            self.sign_inputs(&state.ledger, &mut tx)?;
        }
        debug!(inputs = tx.input.len(), outputs = tx.output.len(), "exported");
        Ok(tx.to_raw_hex())
    }

    async fn rollback(&self, rtx: &RunTransaction) -> Result<(), RuntimeError> {
        // Exported batches are staged on a copy and never touch the ledger.
        debug!(actions = rtx.actions().len(), "rollback");
        Ok(())
    }

    async fn inventory(&self) -> Result<Vec<Jig>, RuntimeError> {
        let state = self.state.lock().await;
        Ok(state.ledger.owned_by(&self.owner))
    }

    async fn unspent(&self, class: &Location) -> Result<Vec<Location>, RuntimeError> {
        let state = self.state.lock().await;
        Ok(state.ledger.unspent_of(class))
    }

    async fn fetch_tx(&self, txid: &Txid) -> Result<String, RuntimeError> {
        Ok(self.cached_tx(txid)?.to_raw_hex())
    }

    async fn broadcast(&self, rawtx: &str) -> Result<Txid, RuntimeError> {
        let tx = decode_tx(rawtx)?;
        let (meta_index, actions) = tx
            .output
            .iter()
            .enumerate()
            .find_map(|(i, output)| parse_metadata(&output.script_pubkey).map(|actions| (i, actions)))
            .ok_or_else(|| RuntimeError::BadTransaction("missing run metadata".into()))?;
        if let Some(vin) = tx.input.iter().position(|input| input.script_sig.is_empty()) {
            return Err(RuntimeError::BadTransaction(format!("input {} is not signed", vin)));
        }

        let mut state = self.state.lock().await;
        let unlocked = self.check_locks(&state.ledger, &tx)?;
        let exec = state.ledger.execute(
            &actions,
            Authority::signer(self.owner.clone()).unlocking(unlocked),
        )?;

        let spent: HashSet<Location> = tx.input.iter().map(input_location).collect();
        if let Some(missing) = exec.inputs().iter().find(|location| !spent.contains(location)) {
            return Err(RuntimeError::BadTransaction(format!("{} is not spent", missing)));
        }
        let first_vout = meta_index + 1;
        let expected = exec.outputs();
        let actual = &tx.output[first_vout..];
        if actual.len() != expected.len() {
            warn!(expected = expected.len(), actual = actual.len(), "record outputs mismatch");
            return Err(RuntimeError::BadTransaction("record outputs mismatch".into()));
        }
        for (output, record) in actual.iter().zip(&expected) {
            let owner = record
                .owner()
                .ok_or_else(|| RuntimeError::BadTransaction("destroyed record output".into()))?;
            if output.script_pubkey != owner.script()? {
                return Err(RuntimeError::BadTransaction(format!(
                    "output for {} pays the wrong owner",
                    record.origin()
                )));
            }
        }

        let txid = tx.compute_txid();
        let committed = state.ledger.commit(exec, txid, first_vout as u32);
        self.persist(&tx, &committed)?;
        info!(%txid, outputs = committed.outputs.len(), "broadcast");
        Ok(txid)
    }

    async fn sign_with_purse(&self, tx: &mut Transaction) -> Result<(), RuntimeError> {
        let state = self.state.lock().await;
        self.sign_inputs(&state.ledger, tx)
    }

    async fn verify_script(&self, tx: &Transaction, vin: usize, locked: &TxOut) -> Result<(), RuntimeError> {
        order_lock::verify_unlock(tx, vin, locked)
            .map(|_| ())
            .map_err(|e| RuntimeError::Verification {
                vin,
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{BaseClass, ClassDef};
    use crate::runtime::MintArgs;

    async fn deploy_and_mint(run: &MockRun, amounts: &[u64]) -> (Code, Vec<Jig>) {
        let mut deploy = RunTransaction::new();
        deploy.update(TxAction::Deploy {
            class: ClassDef::builder("FooCoin", BaseClass::Token).build(),
        });
        let receipt = run.publish(deploy).await.unwrap();
        let code = receipt.codes().next().unwrap().clone();

        let mut mint = RunTransaction::new();
        for amount in amounts {
            mint.update(TxAction::Mint {
                code: code.location(),
                args: MintArgs::Fungible {
                    amount: *amount,
                    owner: Owner::from(run.owner_address()),
                },
            });
        }
        let receipt = run.publish(mint).await.unwrap();
        (code, receipt.jigs().cloned().collect())
    }

    #[test]
    fn test_metadata_round_trip() {
        let actions = vec![TxAction::Destroy {
            jig: Location::output(Txid::from_byte_array([1; 32]), 2),
        }];
        let script = metadata_script(&actions).unwrap();
        assert_eq!(parse_metadata(&script), Some(actions));
        let bare = Builder::new().push_opcode(OP_FALSE).push_opcode(OP_RETURN).into_script();
        assert_eq!(parse_metadata(&bare), None);
    }

    #[tokio::test]
    async fn test_publish_lays_out_outputs() {
        let run = MockRun::new();
        let (code, jigs) = deploy_and_mint(&run, &[10, 20]).await;
        assert_eq!(code.location().vout(), Some(1));
        // metadata at 0, class at 1, units after
        assert_eq!(jigs[0].location().vout(), Some(2));
        assert_eq!(jigs[1].location().vout(), Some(3));

        let raw = run.fetch_tx(&jigs[0].location().txid).await.unwrap();
        let tx = decode_tx(&raw).unwrap();
        assert_eq!(tx.output.len(), 4);
        assert!(parse_metadata(&tx.output[0].script_pubkey).is_some());
        assert_eq!(tx.output[2].value.to_sat(), DUST_LIMIT);
        assert!(tx.input.iter().all(|input| !input.script_sig.is_empty()));
    }

    #[tokio::test]
    async fn test_load_and_sync() {
        let run = MockRun::new();
        let (code, jigs) = deploy_and_mint(&run, &[10]).await;

        let loaded = run.load_code(&code.location()).await.unwrap();
        assert_eq!(loaded.supply(), 0);
        let synced = run.sync_code(&loaded).await.unwrap();
        assert_eq!(synced.supply(), 10);

        let jig = run.load_jig(&jigs[0].location()).await.unwrap();
        assert_eq!(run.sync_jig(&jig).await.unwrap(), jig);
        assert_eq!(run.inventory().await.unwrap(), vec![jig]);
        assert_eq!(run.unspent(&code.origin()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_of_exported_batch() {
        let run = MockRun::new();
        let (_, jigs) = deploy_and_mint(&run, &[10]).await;

        let mut send = RunTransaction::new();
        send.update(TxAction::Send {
            jig: jigs[0].location(),
            to: Owner::from("mfjPijd3gNj1Tx7QcdZaSWCEYbxfeVRaxN"),
            amount: Some(4),
        });
        let raw = run
            .export(&send, ExportOptions { sign: true, pay: true })
            .await
            .unwrap();
        let txid = run.broadcast(&raw).await.unwrap();
        assert_eq!(decode_tx(&raw).unwrap().compute_txid(), txid);
        assert_eq!(run.inventory().await.unwrap()[0].amount(), 6);
    }

    #[tokio::test]
    async fn test_broadcast_rejects_unsigned_inputs() {
        let run = MockRun::new();
        let (_, jigs) = deploy_and_mint(&run, &[10]).await;
        let mut destroy = RunTransaction::new();
        destroy.update(TxAction::Destroy {
            jig: jigs[0].location(),
        });
        let raw = run
            .export(&destroy, ExportOptions { sign: false, pay: true })
            .await
            .unwrap();
        let err = run.broadcast(&raw).await.unwrap_err();
        assert!(matches!(err, RuntimeError::BadTransaction(_)));
        assert_eq!(run.inventory().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sled_backed_cache() {
        let cache = Arc::new(crate::storage::SledCache::temporary().unwrap());
        let run = MockRun::with_cache(cache);
        let (code, _) = deploy_and_mint(&run, &[1]).await;
        assert_eq!(run.load_code(&code.location()).await.unwrap().name(), "FooCoin");
    }
}
