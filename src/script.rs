//! Bitcoin transaction and script plumbing.
//!
//! Wire types, consensus encoding, addresses and script parsing come from
//! the `bitcoin` crate. What it does not cover is the BCH-style BIP143
//! (FORKID) signature-hash preimage the offer lock commits to, which is
//! assembled here from consensus-encoded parts.

use bitcoin::absolute::LockTime;
use bitcoin::address::{Address, NetworkUnchecked};
use bitcoin::consensus::encode::{self, serialize};
use bitcoin::hashes::Hash;
use bitcoin::script::{Instruction, PushBytes};
use bitcoin::transaction::Version;
use bitcoin::{PubkeyHash, Sequence, Witness};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use bitcoin::{Amount, NetworkKind, OutPoint, Script, ScriptBuf, Transaction, TxIn, TxOut, Txid};

pub mod sighash {
    pub const ALL: u32 = 0x01;
    pub const NONE: u32 = 0x02;
    pub const SINGLE: u32 = 0x03;
    pub const FORKID: u32 = 0x40;
    pub const ANYONECANPAY: u32 = 0x80;
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Bad hex: {0}")]
    BadHex(#[from] hex::FromHexError),
    #[error("Invalid transaction: {0}")]
    Decode(#[from] encode::Error),
    #[error("Invalid script: {0}")]
    Parse(#[from] bitcoin::script::Error),
    #[error("Push of {0} bytes is too large")]
    PushTooLarge(usize),
    #[error("Input index {0} out of range")]
    InputOutOfRange(usize),
}

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG` for `address`.
/// Only base58 pay-to-pubkey-hash addresses are accepted.
pub fn p2pkh_script(address: &str) -> Result<ScriptBuf, ScriptError> {
    let parsed: Address<NetworkUnchecked> = address
        .parse()
        .map_err(|e| ScriptError::InvalidAddress(format!("{address}: {e}")))?;
    let script = parsed.assume_checked().script_pubkey();
    if !script.is_p2pkh() {
        return Err(ScriptError::InvalidAddress(address.to_string()));
    }
    Ok(script)
}

/// The 20-byte public key hash a P2PKH address pays to.
pub fn address_hash(address: &str) -> Result<[u8; 20], ScriptError> {
    let script = p2pkh_script(address)?;
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&script.as_bytes()[3..23]);
    Ok(hash)
}

pub fn address_from_hash(kind: NetworkKind, hash: &[u8; 20]) -> String {
    Address::p2pkh(PubkeyHash::from_byte_array(*hash), kind).to_string()
}

/// Borrows `data` as a single script push.
pub fn push_bytes(data: &[u8]) -> Result<&PushBytes, ScriptError> {
    <&PushBytes>::try_from(data).map_err(|_| ScriptError::PushTooLarge(data.len()))
}

/// Splits a script into pushes and opcodes. `OP_0` comes back as an empty
/// push.
pub fn instructions(script: &Script) -> Result<Vec<Instruction<'_>>, ScriptError> {
    Ok(script.instructions().collect::<Result<Vec<_>, _>>()?)
}

/// Version 1, no inputs, no outputs, lock time 0.
pub fn new_transaction() -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: Vec::new(),
    }
}

/// Unsigned input spending `vout` of `txid`.
pub fn tx_in(txid: Txid, vout: u32) -> TxIn {
    TxIn {
        previous_output: OutPoint::new(txid, vout),
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

pub fn tx_out(satoshis: u64, script_pubkey: ScriptBuf) -> TxOut {
    TxOut {
        value: Amount::from_sat(satoshis),
        script_pubkey,
    }
}

pub fn decode_tx(raw: &str) -> Result<Transaction, ScriptError> {
    Ok(encode::deserialize(&hex::decode(raw)?)?)
}

/// Builder-style helpers and the FORKID preimage on [`Transaction`].
pub trait TransactionExt {
    /// Appends a P2PKH output paying `satoshis` to `address`.
    fn pay_to(&mut self, address: &str, satoshis: u64) -> Result<&mut Self, ScriptError>;

    /// Appends an input spending `vout` of `txid`.
    fn spend_outpoint(&mut self, txid: Txid, vout: u32) -> &mut Self;

    fn to_raw_hex(&self) -> String;

    /// BIP143 signature-hash preimage for input `vin` spending an output
    /// locked by `script_code` and worth `satoshis`.
    fn preimage(
        &self,
        vin: usize,
        script_code: &ScriptBuf,
        satoshis: u64,
        sighash_type: u32,
    ) -> Result<Vec<u8>, ScriptError>;
}

impl TransactionExt for Transaction {
    fn pay_to(&mut self, address: &str, satoshis: u64) -> Result<&mut Self, ScriptError> {
        let script = p2pkh_script(address)?;
        self.output.push(tx_out(satoshis, script));
        Ok(self)
    }

    fn spend_outpoint(&mut self, txid: Txid, vout: u32) -> &mut Self {
        self.input.push(tx_in(txid, vout));
        self
    }

    fn to_raw_hex(&self) -> String {
        encode::serialize_hex(self)
    }

    fn preimage(
        &self,
        vin: usize,
        script_code: &ScriptBuf,
        satoshis: u64,
        sighash_type: u32,
    ) -> Result<Vec<u8>, ScriptError> {
        let input = self.input.get(vin).ok_or(ScriptError::InputOutOfRange(vin))?;
        let base = sighash_type & 0x1f;
        let anyone_can_pay = sighash_type & sighash::ANYONECANPAY != 0;

        let hash_prevouts = if anyone_can_pay {
            [0u8; 32]
        } else {
            let prevouts: Vec<u8> = self
                .input
                .iter()
                .flat_map(|i| serialize(&i.previous_output))
                .collect();
            sha256d(&prevouts)
        };

        let hash_sequence = if anyone_can_pay || base == sighash::SINGLE || base == sighash::NONE {
            [0u8; 32]
        } else {
            let sequences: Vec<u8> = self
                .input
                .iter()
                .flat_map(|i| i.sequence.0.to_le_bytes())
                .collect();
            sha256d(&sequences)
        };

        let hash_outputs = if base != sighash::SINGLE && base != sighash::NONE {
            let outputs: Vec<u8> = self.output.iter().flat_map(|o| serialize(o)).collect();
            sha256d(&outputs)
        } else if base == sighash::SINGLE && vin < self.output.len() {
            sha256d(&serialize(&self.output[vin]))
        } else {
            [0u8; 32]
        };

        let mut buf = Vec::with_capacity(156 + script_code.len());
        buf.extend_from_slice(&self.version.0.to_le_bytes());
        buf.extend_from_slice(&hash_prevouts);
        buf.extend_from_slice(&hash_sequence);
        buf.extend_from_slice(&serialize(&input.previous_output));
        buf.extend_from_slice(&serialize(script_code));
        buf.extend_from_slice(&satoshis.to_le_bytes());
        buf.extend_from_slice(&input.sequence.0.to_le_bytes());
        buf.extend_from_slice(&hash_outputs);
        buf.extend_from_slice(&self.lock_time.to_consensus_u32().to_le_bytes());
        buf.extend_from_slice(&sighash_type.to_le_bytes());
        Ok(buf)
    }
}
