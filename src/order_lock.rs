//! Offer lock for peer-to-peer token swaps.
//!
//! An [`OrderLock`] owns a token unit until either a taker pays the
//! designated output (`address` receives `satoshis`) or the maker cancels by
//! spending the cancel baton alongside it. The locking script is a fixed
//! template; only the double SHA-256 of the designated output is spliced in.

use std::sync::OnceLock;

use bitcoin::consensus::encode::serialize;
use bitcoin::opcodes::{Opcode, OP_0, OP_FALSE, OP_TRUE};
use bitcoin::script::{Builder, Instruction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::script::{
    instructions, p2pkh_script, push_bytes, sha256d, sighash, tx_out, Script, ScriptBuf,
    ScriptError, Transaction, TransactionExt, TxOut,
};

/// Smallest output value the network relays.
pub const DUST_LIMIT: u64 = 546;
/// Largest price an offer may ask (2^53 - 1).
pub const MAX_SATOSHIS: u64 = 9_007_199_254_740_991;

/// Compiled lock program. Bytes 1..33 hold the designated output digest.
pub const SCRIPT_TEMPLATE: &str = concat!(
    "20000000000000000000000000000000000000000000000000000000000000000001c35279630142517a7554",
    "7901687f7501447f77007901207f7504000000007e517951797e56797eaa577901247f75547f778769757567",
    "54795579827758947f75557982770128947f77527987696861547921cdb285cc49e5ff3eed6536e7b426e8a5",
    "28b05bf9276bd05431a671743e651ceb002102dca1e194dd541a47f4c85fea6a4d45bb50f16ed2fddc391bf8",
    "0b525454f8b40920f941a26b1c1802eaa09109701e4e632e1ef730b0b68c9517e7c19be2ba4c7d37202f282d",
    "163597a82d72c263b004695297aecb4d758dccd1dbf61e82a3360bde2c202cde0b36a3821ef6dbd1cc8d754d",
    "cbae97526904b063c2722da89735162d282f56795679aa616100790079517f517f517f517f517f517f517f51",
    "7f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f51",
    "7f517f7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c",
    "7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e01007e81517a7561577956795679567956795379567954",
    "79577995939521414136d08c5ed2bf3ba048afe6dcaebafeffffffffffffffffffffffffffffff0061517951",
    "795179517997527a75517a5179009f635179517993527a75517a685179517a75517a7561527a75517a517951",
    "795296a0630079527994527a75517a68537982775279827754527993517993013051797e527e53797e57797e",
    "527e52797e5579517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f51",
    "7f517f517f517f517f517f517f517f517f517f517f517f517f7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c",
    "7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7e",
    "56797e0079517a75517a75517a75517a75517a75517a75517a75517a75517a75517a75517a75517a75610079",
    "5779ac517a75517a75517a75517a75517a75517a75517a75517a75517a75617777777777",
);

const HASH_START: usize = 1;
const HASH_END: usize = 33;

/// Byte range of the spent outpoint inside a preimage.
const PREIMAGE_OUTPOINT: std::ops::Range<usize> = 68..104;
/// Byte range of `hashPrevouts` inside a preimage.
const PREIMAGE_PREVOUTS: std::ops::Range<usize> = 4..36;

static TEMPLATE: OnceLock<Vec<u8>> = OnceLock::new();

fn template() -> Result<&'static [u8], ScriptError> {
    if let Some(bytes) = TEMPLATE.get() {
        return Ok(bytes);
    }
    let bytes = hex::decode(SCRIPT_TEMPLATE)?;
    Ok(TEMPLATE.get_or_init(|| bytes))
}

#[derive(Debug, Error)]
pub enum OrderLockError {
    #[error("Invalid address")]
    InvalidAddress,
    #[error("Invalid. Max: {MAX_SATOSHIS}")]
    TooLarge,
    #[error("Dust")]
    Dust,
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("Not an OrderLock script")]
    NotOrderLock,
    #[error("Malformed unlocking script")]
    MalformedUnlock,
    #[error("Unexpected sighash type {0:#04x}")]
    SighashType(u32),
    #[error("Preimage does not match the spending transaction")]
    PreimageMismatch,
    #[error("Designated output is not paid")]
    OutputMismatch,
    #[error("Cancel prevouts do not match the preimage")]
    PrevoutsMismatch,
}

/// Which branch of the lock an unlocking script selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spend {
    /// Pay the designated output. Commits to the own input and the output
    /// at the same index only.
    Take,
    /// Maker reclaims the unit. Commits to every input and no output.
    Cancel,
}

impl Spend {
    pub fn sighash_type(self) -> u32 {
        match self {
            Spend::Take => sighash::SINGLE | sighash::ANYONECANPAY | sighash::FORKID,
            Spend::Cancel => sighash::NONE | sighash::FORKID,
        }
    }

    fn flag(self) -> Opcode {
        match self {
            Spend::Take => OP_FALSE,
            Spend::Cancel => OP_TRUE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderLock {
    address: String,
    satoshis: u64,
}

impl OrderLock {
    pub fn new(address: impl Into<String>, satoshis: u64) -> Result<Self, OrderLockError> {
        let address = address.into();
        if address.len() < 27 {
            return Err(OrderLockError::InvalidAddress);
        }
        if satoshis > MAX_SATOSHIS {
            return Err(OrderLockError::TooLarge);
        }
        if satoshis < DUST_LIMIT {
            return Err(OrderLockError::Dust);
        }
        Ok(Self { address, satoshis })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn satoshis(&self) -> u64 {
        self.satoshis
    }

    /// The output a taker must create at the same index as the locked input.
    pub fn designated_output(&self) -> Result<TxOut, OrderLockError> {
        Ok(tx_out(self.satoshis, p2pkh_script(&self.address)?))
    }

    pub fn hash_output(&self) -> Result<[u8; 32], OrderLockError> {
        Ok(sha256d(&serialize(&self.designated_output()?)))
    }

    pub fn script(&self) -> Result<ScriptBuf, OrderLockError> {
        let template = template()?;
        let mut script = Vec::with_capacity(template.len());
        script.extend_from_slice(&template[..HASH_START]);
        script.extend_from_slice(&self.hash_output()?);
        script.extend_from_slice(&template[HASH_END..]);
        Ok(ScriptBuf::from_bytes(script))
    }
}

/// Returns the designated output digest embedded in an OrderLock script.
pub fn embedded_hash(script: &Script) -> Result<[u8; 32], OrderLockError> {
    let template = template()?;
    let script = script.as_bytes();
    if script.len() != template.len()
        || script[..HASH_START] != template[..HASH_START]
        || script[HASH_END..] != template[HASH_END..]
    {
        return Err(OrderLockError::NotOrderLock);
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&script[HASH_START..HASH_END]);
    Ok(hash)
}

/// Builds the unlocking script for input `vin` of `tx`, which spends
/// `locked`.
pub fn unlock_script(
    tx: &Transaction,
    vin: usize,
    locked: &TxOut,
    spend: Spend,
) -> Result<ScriptBuf, OrderLockError> {
    let preimage = tx.preimage(
        vin,
        &locked.script_pubkey,
        locked.value.to_sat(),
        spend.sighash_type(),
    )?;

    Ok(Builder::new()
        .push_slice(push_bytes(&preimage)?)
        // trailing prevouts: none beyond the lock and the cancel baton
        .push_opcode(OP_0)
        .push_opcode(spend.flag())
        .into_script())
}

/// Evaluates the lock's spending conditions for input `vin` of `tx`.
///
/// Mirrors the two branches of the lock program: a take must commit to an
/// output whose digest equals the embedded one, a cancel must spend the
/// cancel baton (output 0 of the locking transaction) as the next input.
/// In both cases the pushed preimage has to be the real preimage of `tx`.
pub fn verify_unlock(tx: &Transaction, vin: usize, locked: &TxOut) -> Result<Spend, OrderLockError> {
    let expected_hash = embedded_hash(&locked.script_pubkey)?;
    let input = tx.input.get(vin).ok_or(ScriptError::InputOutOfRange(vin))?;

    let parsed = instructions(&input.script_sig)?;
    let (preimage, trailing, spend) = match parsed.as_slice() {
        [Instruction::PushBytes(preimage), Instruction::PushBytes(trailing), flag] => {
            let spend = match flag {
                Instruction::PushBytes(empty) if empty.is_empty() => Spend::Take,
                Instruction::Op(op) if *op == OP_TRUE => Spend::Cancel,
                _ => return Err(OrderLockError::MalformedUnlock),
            };
            (preimage.as_bytes(), trailing.as_bytes(), spend)
        }
        _ => return Err(OrderLockError::MalformedUnlock),
    };

    if preimage.len() < PREIMAGE_OUTPOINT.end + 44 {
        return Err(OrderLockError::MalformedUnlock);
    }
    let n = preimage.len();
    let mut type_bytes = [0u8; 4];
    type_bytes.copy_from_slice(&preimage[n - 4..]);
    let sighash_type = u32::from_le_bytes(type_bytes);
    if sighash_type != spend.sighash_type() {
        return Err(OrderLockError::SighashType(sighash_type));
    }

    let actual = tx.preimage(vin, &locked.script_pubkey, locked.value.to_sat(), sighash_type)?;
    if actual.as_slice() != preimage {
        return Err(OrderLockError::PreimageMismatch);
    }

    match spend {
        Spend::Take => {
            if preimage[n - 40..n - 8] != expected_hash {
                return Err(OrderLockError::OutputMismatch);
            }
        }
        Spend::Cancel => {
            let self_outpoint = &preimage[PREIMAGE_OUTPOINT];
            let mut prevouts = Vec::with_capacity(72 + trailing.len());
            prevouts.extend_from_slice(self_outpoint);
            prevouts.extend_from_slice(&self_outpoint[..32]);
            prevouts.extend_from_slice(&[0u8; 4]);
            prevouts.extend_from_slice(trailing);
            if sha256d(&prevouts)[..] != preimage[PREIMAGE_PREVOUTS] {
                return Err(OrderLockError::PrevoutsMismatch);
            }
        }
    }

    Ok(spend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{new_transaction, tx_in, Amount, Txid};
    use bitcoin::hashes::Hash;

    const SELLER: &str = "mgxGAWN13irNZi1B8LdHXc4E8scDaAVRUV";
    const BUYER: &str = "mfjPijd3gNj1Tx7QcdZaSWCEYbxfeVRaxN";

    fn lock() -> OrderLock {
        OrderLock::new(SELLER, 100_000).unwrap()
    }

    fn locked_output() -> TxOut {
        tx_out(DUST_LIMIT, lock().script().unwrap())
    }

    fn offer_txid() -> Txid {
        Txid::from_byte_array([0x11; 32])
    }

    fn take_tx(pay_to: &str, satoshis: u64) -> Transaction {
        let mut tx = new_transaction();
        tx.spend_outpoint(offer_txid(), 3);
        tx.spend_outpoint(Txid::from_byte_array([0x22; 32]), 0);
        tx.pay_to(pay_to, satoshis).unwrap();
        tx.pay_to(BUYER, DUST_LIMIT).unwrap();
        tx
    }

    fn cancel_tx() -> Transaction {
        let mut tx = new_transaction();
        tx.spend_outpoint(offer_txid(), 3);
        tx.spend_outpoint(offer_txid(), 0);
        tx.pay_to(SELLER, DUST_LIMIT).unwrap();
        tx
    }

    #[test]
    fn rejects_invalid_construction() {
        assert!(matches!(OrderLock::new("short", 1000), Err(OrderLockError::InvalidAddress)));
        assert!(matches!(OrderLock::new(SELLER, 545), Err(OrderLockError::Dust)));
        assert!(matches!(OrderLock::new(SELLER, MAX_SATOSHIS + 1), Err(OrderLockError::TooLarge)));
        assert!(OrderLock::new(SELLER, DUST_LIMIT).is_ok());
    }

    #[test]
    fn script_only_differs_in_the_digest() {
        let template = hex::decode(SCRIPT_TEMPLATE).unwrap();
        let script = lock().script().unwrap();
        let bytes = script.as_bytes();
        assert_eq!(bytes.len(), template.len());
        assert_eq!(bytes.len(), 784);
        assert_eq!(bytes[0], 0x20);
        assert_eq!(&bytes[HASH_END..], &template[HASH_END..]);
        assert_eq!(&bytes[HASH_START..HASH_END], &lock().hash_output().unwrap());
        assert_eq!(embedded_hash(&script).unwrap(), lock().hash_output().unwrap());
    }

    #[test]
    fn script_is_deterministic_per_price_and_address() {
        let a = lock().script().unwrap();
        assert_eq!(a, lock().script().unwrap());
        assert_ne!(a, OrderLock::new(SELLER, 100_001).unwrap().script().unwrap());
        assert_ne!(a, OrderLock::new(BUYER, 100_000).unwrap().script().unwrap());
    }

    #[test]
    fn designated_output_serializes_price_then_p2pkh() {
        let bytes = serialize(&lock().designated_output().unwrap());
        assert_eq!(bytes.len(), 34);
        assert_eq!(&bytes[..8], &100_000u64.to_le_bytes());
        assert_eq!(bytes[8], 25);
    }

    #[test]
    fn take_unlock_verifies() {
        let locked = locked_output();
        let mut tx = take_tx(SELLER, 100_000);
        tx.input[0].script_sig = unlock_script(&tx, 0, &locked, Spend::Take).unwrap();
        assert_eq!(verify_unlock(&tx, 0, &locked).unwrap(), Spend::Take);
    }

    #[test]
    fn take_paying_too_little_fails() {
        let locked = locked_output();
        let mut tx = take_tx(SELLER, 99_999);
        tx.input[0].script_sig = unlock_script(&tx, 0, &locked, Spend::Take).unwrap();
        assert!(matches!(verify_unlock(&tx, 0, &locked), Err(OrderLockError::OutputMismatch)));
    }

    #[test]
    fn take_is_bound_to_the_transaction() {
        let locked = locked_output();
        let mut tx = take_tx(SELLER, 100_000);
        tx.input[0].script_sig = unlock_script(&tx, 0, &locked, Spend::Take).unwrap();
        tx.output[0].value = Amount::from_sat(100_001);
        assert!(matches!(verify_unlock(&tx, 0, &locked), Err(OrderLockError::PreimageMismatch)));
    }

    #[test]
    fn take_ignores_other_inputs() {
        let locked = locked_output();
        let mut tx = take_tx(SELLER, 100_000);
        tx.input[0].script_sig = unlock_script(&tx, 0, &locked, Spend::Take).unwrap();
        tx.input.push(tx_in(Txid::from_byte_array([0x33; 32]), 7));
        assert_eq!(verify_unlock(&tx, 0, &locked).unwrap(), Spend::Take);
    }

    #[test]
    fn cancel_unlock_verifies() {
        let locked = locked_output();
        let mut tx = cancel_tx();
        tx.input[0].script_sig = unlock_script(&tx, 0, &locked, Spend::Cancel).unwrap();
        assert_eq!(verify_unlock(&tx, 0, &locked).unwrap(), Spend::Cancel);
    }

    #[test]
    fn cancel_without_baton_fails() {
        let locked = locked_output();
        let mut tx = cancel_tx();
        tx.input[1] = tx_in(Txid::from_byte_array([0x44; 32]), 0);
        tx.input[0].script_sig = unlock_script(&tx, 0, &locked, Spend::Cancel).unwrap();
        assert!(matches!(verify_unlock(&tx, 0, &locked), Err(OrderLockError::PrevoutsMismatch)));
    }

    #[test]
    fn rejects_foreign_lock_and_garbage_unlock() {
        let p2pkh = tx_out(DUST_LIMIT, p2pkh_script(SELLER).unwrap());
        let tx = take_tx(SELLER, 100_000);
        assert!(matches!(verify_unlock(&tx, 0, &p2pkh), Err(OrderLockError::NotOrderLock)));

        let locked = locked_output();
        let mut tx = take_tx(SELLER, 100_000);
        tx.input[0].script_sig = Builder::new().push_opcode(OP_TRUE).into_script();
        assert!(matches!(verify_unlock(&tx, 0, &locked), Err(OrderLockError::MalformedUnlock)));
    }

    #[test]
    fn flag_must_match_sighash_type() {
        let locked = locked_output();
        let mut tx = cancel_tx();
        let mut script = unlock_script(&tx, 0, &locked, Spend::Cancel).unwrap().into_bytes();
        let last = script.len() - 1;
        script[last] = OP_FALSE.to_u8();
        tx.input[0].script_sig = ScriptBuf::from_bytes(script);
        assert!(matches!(
            verify_unlock(&tx, 0, &locked),
            Err(OrderLockError::SighashType(0x42))
        ));
    }
}
