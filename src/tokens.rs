//! Class plumbing shared by the fungible and non-fungible facets.

use serde_json::Value;
use tracing::info;

use crate::contracts::{ClassDef, Code};
use crate::error::KitError;
use crate::runtime::{MintArgs, RunInstance, RunTransaction, RuntimeError, TxAction};
use crate::script::Txid;
use crate::types::{Location, Owner};
use crate::validation::{is_blank, Params};

/// What `deploy` and `upgrade` accept: raw parameters to build a class
/// from, or a class built elsewhere.
#[derive(Debug, Clone)]
pub enum ClassSource {
    Params(Value),
    Class(ClassDef),
}

impl From<Value> for ClassSource {
    fn from(params: Value) -> Self {
        ClassSource::Params(params)
    }
}

impl From<ClassDef> for ClassSource {
    fn from(class: ClassDef) -> Self {
        ClassSource::Class(class)
    }
}

/// Removes `key` from validated params as a string.
pub(crate) fn take_string(params: &mut Params, key: &str) -> String {
    match params.remove(key) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    }
}

/// Removes `key` from validated params, mapping blank values to `None`.
pub(crate) fn take_present(params: &mut Params, key: &str) -> Option<Value> {
    params.remove(key).filter(|value| !is_blank(value))
}

/// Adds what the relay DEX expects of tradeable classes: the OrderLock
/// class among its friends and no interactivity.
pub fn apply_relay_requirements(class: &mut ClassDef, order_lock: Location) {
    let mut friends = match class.props.remove("friends") {
        Some(Value::Array(friends)) => friends,
        _ => Vec::new(),
    };
    friends.push(Value::from(order_lock.to_string()));
    class.set_prop("friends", friends);
    class.set_prop("interactive", false);
}

pub async fn deploy_class<R: RunInstance + ?Sized>(run: &R, class: ClassDef) -> Result<Code, KitError> {
    let name = class.name.clone();
    let mut tx = RunTransaction::new();
    tx.update(TxAction::Deploy { class });
    let receipt = run.publish(tx).await?;
    let code = receipt
        .codes()
        .next()
        .cloned()
        .ok_or_else(|| RuntimeError::NotFound(format!("deployed class {}", name)))?;
    info!(class = %name, location = %code.location(), "class deployed");
    Ok(code)
}

/// Loads the class at `origin` and brings it up to date.
pub async fn load_class<R: RunInstance + ?Sized>(run: &R, origin: &Location) -> Result<Code, KitError> {
    let code = run.load_code(origin).await?;
    Ok(run.sync_code(&code).await?)
}

/// Mints one unit per entry of `recipients` in a single transaction.
pub async fn mint_tokens<R: RunInstance + ?Sized>(
    run: &R,
    origin: &Location,
    recipients: Vec<MintArgs>,
) -> Result<Txid, KitError> {
    if recipients.is_empty() {
        return Err(KitError::InvalidRecipients("mint(origin, recipients)"));
    }
    let code = load_class(run, origin).await?;

    let count = recipients.len();
    let mut tx = RunTransaction::new();
    for args in recipients {
        tx.update(TxAction::Mint {
            code: code.location(),
            args,
        });
    }
    let receipt = run.publish(tx).await?;
    info!(class = %code.name(), txid = %receipt.txid, count, "minted");
    Ok(receipt.txid)
}

/// Upgrades the class at `origin` to `new_class`.
///
/// Every static prop of the deployed class is carried over unless it is
/// named in `updated`. Runtime bindings are never copied.
pub async fn upgrade_class<R: RunInstance + ?Sized>(
    run: &R,
    origin: &Location,
    mut new_class: ClassDef,
    updated: &[String],
) -> Result<Code, KitError> {
    let code = load_class(run, origin).await?;
    for (key, value) in &code.class.props {
        if !updated.iter().any(|u| u == key) {
            new_class.set_prop(key.clone(), value.clone());
        }
    }

    let mut tx = RunTransaction::new();
    tx.update(TxAction::Upgrade {
        code: code.location(),
        class: new_class,
    });
    let receipt = run.publish(tx).await?;
    info!(class = %code.name(), txid = %receipt.txid, "class upgraded");
    Ok(run.sync_code(&code).await?)
}

/// Calls the static `transfer` of a transferable class.
pub async fn transfer_class<R: RunInstance + ?Sized>(
    run: &R,
    origin: &Location,
    owner: Owner,
) -> Result<Code, KitError> {
    let code = load_class(run, origin).await?;
    let mut tx = RunTransaction::new();
    tx.update(TxAction::TransferClass {
        code: code.location(),
        to: owner.clone(),
    });
    run.publish(tx).await?;
    info!(class = %code.name(), to = %owner, "class transferred");
    Ok(run.sync_code(&code).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::BaseClass;
    use serde_json::json;

    #[test]
    fn relay_requirements_append_to_friends() {
        let lock: Location = crate::config::ORDER_LOCK_LOCATION.parse().unwrap();
        let mut class = ClassDef::builder("FooNFT", BaseClass::Nft)
            .prop("friends", json!(["someone"]))
            .build();
        apply_relay_requirements(&mut class, lock);
        assert_eq!(
            class.prop("friends"),
            Some(&json!(["someone", crate::config::ORDER_LOCK_LOCATION]))
        );
        assert_eq!(class.prop("interactive"), Some(&json!(false)));
    }

    #[test]
    fn take_helpers() {
        let mut params = json!({"a": "x", "b": 0, "c": 3}).as_object().cloned().unwrap();
        assert_eq!(take_string(&mut params, "a"), "x");
        assert_eq!(take_string(&mut params, "missing"), "");
        assert_eq!(take_present(&mut params, "b"), None);
        assert_eq!(take_present(&mut params, "c"), Some(json!(3)));
        assert!(params.is_empty());
    }
}
