//! Balance aggregation over the units of one class held by the runtime
//! owner.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::contracts::Code;
use crate::error::KitError;
use crate::runtime::{RunInstance, RunTransaction, RuntimeError, TxAction};
use crate::script::Txid;
use crate::tokens;
use crate::types::{Jig, Location, Owner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JigBoxKind {
    Ft,
    Nft,
}

impl FromStr for JigBoxKind {
    type Err = KitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FT" => Ok(JigBoxKind::Ft),
            "NFT" => Ok(JigBoxKind::Nft),
            _ => Err(KitError::InvalidJigBoxType(s.to_string())),
        }
    }
}

impl fmt::Display for JigBoxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JigBoxKind::Ft => "FT",
            JigBoxKind::Nft => "NFT",
        })
    }
}

/// Largest number of decimal places a balance is rendered with.
pub const MAX_DECIMALS: u32 = 100;

/// Renders `amount / 10^decimals` with exactly `decimals` fractional
/// digits.
pub fn format_decimal(amount: u64, decimals: u32) -> String {
    let digits = amount.to_string();
    let scale = decimals as usize;
    if scale == 0 {
        return digits;
    }
    let padded = if digits.len() <= scale {
        format!("{}{}", "0".repeat(scale + 1 - digits.len()), digits)
    } else {
        digits
    };
    let (whole, fraction) = padded.split_at(padded.len() - scale);
    format!("{}.{}", whole, fraction)
}

/// The units of one class held by the runtime owner.
pub struct JigBox<R: RunInstance + ?Sized> {
    run: Arc<R>,
    contract: Code,
    kind: JigBoxKind,
    jigs: Vec<Jig>,
}

impl<R: RunInstance + ?Sized> fmt::Debug for JigBox<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JigBox")
            .field("contract", &self.contract.origin())
            .field("kind", &self.kind)
            .field("jigs", &self.jigs.len())
            .finish()
    }
}

impl<R: RunInstance + ?Sized> JigBox<R> {
    pub async fn from_class(run: Arc<R>, contract: Code, kind: JigBoxKind) -> Result<Self, KitError> {
        let mut jigbox = Self {
            run,
            contract,
            kind,
            jigs: Vec::new(),
        };
        jigbox.sync().await?;
        Ok(jigbox)
    }

    pub async fn from_origin(run: Arc<R>, origin: &Location, kind: JigBoxKind) -> Result<Self, KitError> {
        let contract = tokens::load_class(run.as_ref(), origin).await?;
        Self::from_class(run, contract, kind).await
    }

    pub fn jigs(&self) -> &[Jig] {
        &self.jigs
    }

    pub fn kind(&self) -> JigBoxKind {
        self.kind
    }

    pub fn contract(&self) -> &Code {
        &self.contract
    }

    fn ensure_fungible(&self) -> Result<(), KitError> {
        match self.kind {
            JigBoxKind::Ft => Ok(()),
            JigBoxKind::Nft => Err(KitError::MethodUnavailable),
        }
    }

    pub fn balance(&self) -> Result<u64, KitError> {
        self.ensure_fungible()?;
        Ok(self
            .jigs
            .iter()
            .fold(0u64, |sum, jig| sum.saturating_add(jig.amount())))
    }

    pub fn balance_as_decimal(&self) -> Result<String, KitError> {
        let decimals = self.contract.decimals();
        if decimals > MAX_DECIMALS {
            return Err(KitError::InvalidDecimals(decimals));
        }
        Ok(format_decimal(self.balance()?, decimals))
    }

    /// Queues a combine of every held unit into the first one and returns
    /// the unit debits are taken from.
    pub(crate) fn consolidate(&self, tx: &mut RunTransaction) -> Result<&Jig, KitError> {
        let (first, rest) = self
            .jigs
            .split_first()
            .ok_or(KitError::Runtime(RuntimeError::NotEnoughFunds))?;
        if !rest.is_empty() && self.kind == JigBoxKind::Ft {
            tx.update(TxAction::Combine {
                target: first.location(),
                others: rest.iter().map(Jig::location).collect(),
            });
        }
        Ok(first)
    }

    /// Sends `amount` to `owner`. Holdings are combined first, so the box
    /// is left with at most one unit.
    pub async fn send(&mut self, owner: impl Into<Owner>, amount: u64) -> Result<Txid, KitError> {
        self.send_many(vec![(owner.into(), amount)]).await
    }

    /// As [`JigBox::send`] for several recipients in one transaction,
    /// preserving their order.
    pub async fn send_many<O>(&mut self, recipients: Vec<(O, u64)>) -> Result<Txid, KitError>
    where
        O: Into<Owner>,
    {
        self.ensure_fungible()?;
        if recipients.is_empty() {
            return Err(KitError::InvalidRecipients("send_many(recipients)"));
        }

        let mut tx = RunTransaction::new();
        let source = self.consolidate(&mut tx)?.location();
        for (owner, amount) in recipients {
            tx.update(TxAction::Send {
                jig: source,
                to: owner.into(),
                amount: Some(amount),
            });
        }
        let receipt = self.run.publish(tx).await?;
        self.sync().await?;
        info!(class = %self.contract.name(), txid = %receipt.txid, "sent");
        Ok(receipt.txid)
    }

    /// Destroys `amount` tokens over two transactions: a self-send that
    /// isolates the amount in its own unit, then the destroy. Returns the
    /// destroy txid.
    pub async fn burn(&mut self, amount: u64) -> Result<Txid, KitError> {
        self.ensure_fungible()?;

        let mut split = RunTransaction::new();
        let source = self.consolidate(&mut split)?;
        let to = source
            .owner()
            .cloned()
            .ok_or(KitError::Runtime(RuntimeError::NotEnoughFunds))?;
        split.update(TxAction::Send {
            jig: source.location(),
            to,
            amount: Some(amount),
        });
        let first = self.run.publish(split).await?;
        self.sync().await?;
        debug!(txid = %first.txid, amount, "burn split published");

        let unit = self
            .jigs
            .iter()
            .find(|jig| jig.amount() == amount)
            .ok_or(KitError::BurnUnitMissing(amount))?;
        let unit = self.run.sync_jig(unit).await?;

        let mut destroy = RunTransaction::new();
        destroy.update(TxAction::Destroy {
            jig: unit.location(),
        });
        let receipt = self.run.publish(destroy).await?;
        self.sync().await?;
        info!(class = %self.contract.name(), txid = %receipt.txid, amount, "burned");
        Ok(receipt.txid)
    }

    /// Reloads the held units of this box's class.
    pub async fn sync(&mut self) -> Result<(), KitError> {
        let class = self.contract.origin();
        self.jigs = self
            .run
            .inventory()
            .await?
            .into_iter()
            .filter(|jig| jig.class == class)
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(9069, 2), "90.69");
        assert_eq!(format_decimal(9000, 0), "9000");
        assert_eq!(format_decimal(5, 3), "0.005");
        assert_eq!(format_decimal(0, 2), "0.00");
        assert_eq!(format_decimal(100, 2), "1.00");
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("ft".parse::<JigBoxKind>().unwrap(), JigBoxKind::Ft);
        assert_eq!("Nft".parse::<JigBoxKind>().unwrap(), JigBoxKind::Nft);
        let err = "sft".parse::<JigBoxKind>().unwrap_err();
        assert_eq!(err.to_string(), "Invalid JigBox type. Must be `FT` or `NFT`.");
    }
}
