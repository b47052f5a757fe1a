//! Peer-to-peer offers.
//!
//! An offer locks a unit with an [`OrderLock`]: anyone may take it by
//! paying the lock's price to its address, and the maker may cancel it by
//! spending the cancel baton (output 0 of the offer transaction) alongside
//! the locked unit.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::error::KitError;
use crate::jigbox::JigBox;
use crate::kit::TokenKit;
use crate::order_lock::{self, OrderLock, Spend, DUST_LIMIT};
use crate::runtime::{ExportOptions, RunInstance, RunTransaction, RuntimeError, TxAction};
use crate::script::{decode_tx, new_transaction, Transaction, TransactionExt, TxOut, Txid};
use crate::types::{Jig, Location, Owner};
use crate::validation::{
    cached_regex, number, object, string, Assertion, NumberOpts, ObjectOpts, Params, Schema,
    StringOpts, ValidationError,
};

/// What an offer is made from.
pub enum HoldingSource<'b, R: RunInstance + ?Sized> {
    /// A unit moved into the lock wholesale.
    Unit(Jig),
    /// `amount` split off a box's consolidated holdings.
    Box {
        jigbox: &'b mut JigBox<R>,
        amount: Option<u64>,
    },
}

pub struct OfferParams<'b, R: RunInstance + ?Sized> {
    pub source: Option<HoldingSource<'b, R>>,
    /// Address the price is paid to.
    pub address: String,
    /// Price in satoshis.
    pub satoshis: u64,
}

fn has_keys(keys: &'static [&'static str]) -> Assertion {
    Arc::new(move |map: &Params| keys.iter().all(|key| map.get(*key).map_or(false, |v| !v.is_null())))
}

static ADDRESS: OnceLock<Regex> = OnceLock::new();

pub fn schema() -> Result<Schema, ValidationError> {
    let address = cached_regex(&ADDRESS, r"^[132nm][a-km-zA-HJ-NP-Z1-9]{25,34}$")?;
    Ok(Schema::new()
        .field(
            "jig",
            object(ObjectOpts {
                allow_blank: true,
                assert: Some(has_keys(&["origin", "location"])),
                message: Some("must be a Jig".to_string()),
                ..Default::default()
            }),
        )
        .field(
            "jigbox",
            object(ObjectOpts {
                allow_blank: true,
                assert: Some(has_keys(&["contract", "type"])),
                message: Some("must be a JigBox".to_string()),
                ..Default::default()
            }),
        )
        .field(
            "amount",
            number(NumberOpts {
                allow_blank: true,
                integer: true,
                min: Some(1.0),
                ..Default::default()
            }),
        )
        .field(
            "address",
            string(StringOpts {
                matches: Some(address),
                message: Some("must be a Bitcoin address".to_string()),
                ..Default::default()
            }),
        )
        .field(
            "satoshis",
            number(NumberOpts {
                integer: true,
                min: Some(1.0),
                ..Default::default()
            }),
        ))
}

impl<'b, R: RunInstance + ?Sized> OfferParams<'b, R> {
    /// The params as the JSON object the offer schema checks.
    fn to_params(&self) -> Result<Params, KitError> {
        let mut params = Map::new();
        let (jig, jigbox, amount) = match &self.source {
            Some(HoldingSource::Unit(jig)) => (serde_json::to_value(jig)?, Value::Null, Value::Null),
            Some(HoldingSource::Box { jigbox, amount }) => (
                Value::Null,
                json!({
                    "contract": jigbox.contract().origin(),
                    "type": jigbox.kind().to_string(),
                }),
                amount.map_or(Value::Null, Value::from),
            ),
            None => (Value::Null, Value::Null, Value::Null),
        };
        params.insert("jig".into(), jig);
        params.insert("jigbox".into(), jigbox);
        params.insert("amount".into(), amount);
        params.insert("address".into(), Value::from(self.address.clone()));
        params.insert("satoshis".into(), Value::from(self.satoshis));
        Ok(params)
    }
}

/// The locked output a unit at `location` sits in.
async fn locked_output<R: RunInstance + ?Sized>(run: &R, location: &Location) -> Result<TxOut, KitError> {
    let vout = location.vout().ok_or(KitError::NotAnOffer(*location))?;
    let raw = run.fetch_tx(&location.txid).await?;
    let tx = decode_tx(&raw)?;
    tx.output
        .get(vout as usize)
        .cloned()
        .ok_or(KitError::NotAnOffer(*location))
}

/// Runs the lock program locally, then through the runtime. Any failure
/// aborts the spend.
async fn verify<R: RunInstance + ?Sized>(
    run: &R,
    tx: &Transaction,
    vin: usize,
    locked: &TxOut,
) -> Result<(), KitError> {
    if let Err(e) = order_lock::verify_unlock(tx, vin, locked) {
        error!(vin, error = %e, "offer unlock rejected");
        return Err(KitError::ScriptVerification {
            vin,
            reason: e.to_string(),
        });
    }
    match run.verify_script(tx, vin, locked).await {
        Ok(()) => Ok(()),
        Err(RuntimeError::Verification { vin, reason }) => {
            error!(vin, %reason, "runtime rejected offer unlock");
            Err(KitError::ScriptVerification { vin, reason })
        }
        Err(e) => Err(e.into()),
    }
}

/// Offer operations.
pub struct Dex<'a, R: RunInstance + ?Sized> {
    kit: &'a TokenKit<R>,
}

impl<'a, R: RunInstance + ?Sized> Dex<'a, R> {
    pub(crate) fn new(kit: &'a TokenKit<R>) -> Self {
        Self { kit }
    }

    fn run(&self) -> &R {
        self.kit.run().as_ref()
    }

    /// Locks a unit, or an amount split off a box, for sale. Returns the
    /// locked unit.
    pub async fn create_offer(&self, params: OfferParams<'_, R>) -> Result<Jig, KitError> {
        schema()?.validate(params.to_params()?)?;
        let OfferParams {
            source,
            address,
            satoshis,
        } = params;
        let source = match source {
            Some(HoldingSource::Box {
                amount: Some(0) | None,
                ..
            })
            | None => return Err(KitError::InvalidOfferSource),
            Some(source) => source,
        };

        let lock = OrderLock::new(address.clone(), satoshis)?;
        let owner = Owner::from(lock.clone());

        let mut base = new_transaction();
        base.pay_to(&address, DUST_LIMIT)?;
        let mut tx = RunTransaction::with_base(base);

        let locked = match source {
            HoldingSource::Unit(jig) => {
                let jig = self.run().sync_jig(&jig).await?;
                tx.update(TxAction::Send {
                    jig: jig.location(),
                    to: owner.clone(),
                    amount: None,
                });
                self.run().publish(tx).await?;
                self.run().sync_jig(&jig).await?
            }
            HoldingSource::Box {
                jigbox,
                amount: Some(amount),
            } => {
                let source = jigbox.consolidate(&mut tx)?.location();
                tx.update(TxAction::Send {
                    jig: source,
                    to: owner.clone(),
                    amount: Some(amount),
                });
                let receipt = self.run().publish(tx).await?;
                jigbox.sync().await?;
                let locked = receipt
                    .jigs()
                    .find(|jig| jig.owner() == Some(&owner))
                    .cloned()
                    .ok_or_else(|| RuntimeError::NotFound("locked unit".into()))?;
                locked
            }
            _ => return Err(KitError::InvalidOfferSource),
        };

        info!(
            location = %locked.location(),
            address = %lock.address(),
            satoshis = lock.satoshis(),
            "offer created"
        );
        Ok(locked)
    }

    /// Buys the offer at `location` with the purse. Returns the txid.
    pub async fn take_offer(&self, location: &Location) -> Result<Txid, KitError> {
        let locked = locked_output(self.run(), location).await?;
        let offer = self.run().load_jig(location).await?;
        let lock = offer
            .owner()
            .and_then(Owner::as_order_lock)
            .cloned()
            .ok_or(KitError::NotAnOffer(*location))?;
        let myself = self.run().next_owner().await?;

        let mut base = new_transaction();
        base.output.push(lock.designated_output()?);
        let mut rtx = RunTransaction::with_base(base);
        rtx.update(TxAction::Send {
            jig: *location,
            to: myself,
            amount: offer.amount,
        });
        let raw = self
            .run()
            .export(&rtx, ExportOptions { sign: false, pay: true })
            .await?;
        self.run().rollback(&rtx).await?;

        let mut tx = decode_tx(&raw)?;
        self.unlock_and_broadcast(&mut tx, location, &locked, Spend::Take)
            .await
    }

    /// Returns the offer at `location` to the runtime owner. Returns the
    /// txid.
    pub async fn cancel_offer(&self, location: &Location) -> Result<Txid, KitError> {
        let locked = locked_output(self.run(), location).await?;
        let offer = self.run().load_jig(location).await?;
        if offer.owner().and_then(Owner::as_order_lock).is_none() {
            return Err(KitError::NotAnOffer(*location));
        }
        let myself = self.run().next_owner().await?;

        let mut rtx = RunTransaction::new();
        rtx.update(TxAction::Send {
            jig: *location,
            to: myself,
            amount: offer.amount,
        });
        let raw = self
            .run()
            .export(&rtx, ExportOptions { sign: false, pay: false })
            .await?;
        self.run().rollback(&rtx).await?;

        let mut tx = decode_tx(&raw)?;
        tx.spend_outpoint(location.txid, 0);
        self.unlock_and_broadcast(&mut tx, location, &locked, Spend::Cancel)
            .await
    }

    async fn unlock_and_broadcast(
        &self,
        tx: &mut Transaction,
        location: &Location,
        locked: &TxOut,
        spend: Spend,
    ) -> Result<Txid, KitError> {
        let vin = tx
            .input
            .iter()
            .position(|input| {
                input.previous_output.txid == location.txid
                    && Some(input.previous_output.vout) == location.vout()
            })
            .ok_or(KitError::NotAnOffer(*location))?;

        let script = order_lock::unlock_script(tx, vin, locked, spend)?;
        tx.input[vin].script_sig = script;
        self.run().sign_with_purse(tx).await?;
        verify(self.run(), tx, vin, locked).await?;

        let txid = self.run().broadcast(&tx.to_raw_hex()).await?;
        info!(offer = %location, %txid, ?spend, "offer spent");
        Ok(txid)
    }

    /// Unspent units of the class at `origin` currently held by an offer
    /// lock.
    pub async fn list_offers(&self, origin: &Location) -> Result<Vec<Jig>, KitError> {
        self.kit.order_lock()?;
        let mut offers = Vec::new();
        for location in self.run().unspent(origin).await? {
            let jig = self.run().load_jig(&location).await?;
            if jig.owner().and_then(Owner::as_order_lock).is_some() {
                offers.push(jig);
            }
        }
        Ok(offers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ValidationError;

    const SELLER: &str = "mgxGAWN13irNZi1B8LdHXc4E8scDaAVRUV";

    fn params(overrides: Value) -> Params {
        let mut base = json!({
            "jig": { "origin": "x_o1", "location": "x_o2" },
            "address": SELLER,
            "satoshis": 1000,
        });
        for (k, v) in overrides.as_object().unwrap() {
            base[k] = v.clone();
        }
        base.as_object().cloned().unwrap()
    }

    fn field_of(result: Result<Params, ValidationError>) -> Option<String> {
        result.err().and_then(|e| e.field().map(str::to_string))
    }

    #[test]
    fn test_schema_accepts_jig_offer() {
        assert!(schema().unwrap().validate(params(json!({}))).is_ok());
    }

    #[test]
    fn test_schema_rejects() {
        let cases = [
            (json!({ "jig": { "origin": "x_o1" } }), "jig"),
            (json!({ "jigbox": { "contract": "x_o1" } }), "jigbox"),
            (json!({ "amount": 1.5 }), "amount"),
            (json!({ "address": "0abc" }), "address"),
            (json!({ "address": "mgxGAWN13irNZi1B8LdHXc4E8scDaAVRUl" }), "address"),
            (json!({ "satoshis": 0 }), "satoshis"),
        ];
        for (overrides, field) in cases {
            assert_eq!(
                field_of(schema().unwrap().validate(params(overrides.clone()))).as_deref(),
                Some(field),
                "{overrides}"
            );
        }
    }
}
