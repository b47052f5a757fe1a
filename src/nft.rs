//! Non-fungible token classes.

use serde_json::Value;

use crate::contracts::{BaseClass, ClassDef, Code};
use crate::error::KitError;
use crate::ft::{class_name_field, metadata_field};
use crate::jigbox::{JigBox, JigBoxKind};
use crate::kit::TokenKit;
use crate::runtime::{MintArgs, RunInstance};
use crate::script::Txid;
use crate::tokens::{self, apply_relay_requirements, take_present, take_string, ClassSource};
use crate::types::{Location, Owner};
use crate::validation::{as_integer, number, validate_params, NumberOpts, Schema, ValidationError};

/// Static props an upgrade never overwrites.
pub const PROTECTED_PROPS: [&str; 4] = ["max", "maxSupply", "supply", "total"];

pub fn schema() -> Result<Schema, ValidationError> {
    Ok(Schema::new()
        .field("className", class_name_field(BaseClass::Nft.default_name())?)
        .field("metadata", metadata_field())
        .field(
            "maxSupply",
            number(NumberOpts {
                allow_blank: true,
                integer: true,
                min: Some(1.0),
                ..Default::default()
            }),
        ))
}

/// Builds an undeployed non-fungible class from `params`, tradeable
/// through the OrderLock class at `order_lock`.
pub fn create(params: Value, order_lock: Location) -> Result<ClassDef, KitError> {
    let mut params = validate_params(params, &schema()?)?;

    let name = take_string(&mut params, "className");
    let metadata = params.remove("metadata").unwrap_or(Value::Null);
    let max_supply = take_present(&mut params, "maxSupply")
        .as_ref()
        .and_then(as_integer);
    let transferable = take_present(&mut params, "transferable").is_some();

    let base = BaseClass::Nft;
    let mut builder = ClassDef::builder(name, base)
        .transferable(transferable)
        .prop("metadata", metadata)
        .prop("sealed", false)
        .prop("supply", 0)
        .prop("total", 0)
        .prop("version", base.version());
    if let Some(max) = max_supply {
        builder = builder.prop("maxSupply", max);
    }
    let mut class = builder.props(params).build();
    apply_relay_requirements(&mut class, order_lock);
    Ok(class)
}

/// Non-fungible token operations.
pub struct Nft<'a, R: RunInstance + ?Sized> {
    kit: &'a TokenKit<R>,
}

impl<'a, R: RunInstance + ?Sized> Nft<'a, R> {
    pub(crate) fn new(kit: &'a TokenKit<R>) -> Self {
        Self { kit }
    }

    pub fn create(&self, params: Value) -> Result<ClassDef, KitError> {
        create(params, self.kit.order_lock()?)
    }

    fn resolve(&self, source: ClassSource) -> Result<ClassDef, KitError> {
        let class = match source {
            ClassSource::Params(params) => self.create(params)?,
            ClassSource::Class(class) => class,
        };
        if class.base.is_fungible() {
            return Err(KitError::WrongClassKind {
                name: class.name,
                expected: "non-fungible",
            });
        }
        Ok(class)
    }

    pub async fn deploy(&self, source: impl Into<ClassSource>) -> Result<Code, KitError> {
        let class = self.resolve(source.into())?;
        tokens::deploy_class(self.kit.run().as_ref(), class).await
    }

    /// Upgrades the class at `origin`. Supply counters and the supply cap
    /// are preserved.
    pub async fn upgrade(&self, origin: &Location, source: impl Into<ClassSource>) -> Result<Code, KitError> {
        let class = self.resolve(source.into())?;
        let updated: Vec<String> = class
            .props
            .keys()
            .filter(|key| !PROTECTED_PROPS.contains(&key.as_str()))
            .cloned()
            .collect();
        tokens::upgrade_class(self.kit.run().as_ref(), origin, class, &updated).await
    }

    /// Mints one numbered unit per recipient, in one transaction.
    pub async fn mint<O>(&self, origin: &Location, recipients: Vec<O>) -> Result<Txid, KitError>
    where
        O: Into<Owner>,
    {
        let args = recipients
            .into_iter()
            .map(|owner| MintArgs::NonFungible { owner: owner.into() })
            .collect();
        tokens::mint_tokens(self.kit.run().as_ref(), origin, args).await
    }

    pub async fn get_jig_box(&self, origin: &Location) -> Result<JigBox<R>, KitError> {
        JigBox::from_origin(self.kit.run().clone(), origin, JigBoxKind::Nft).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ORDER_LOCK_LOCATION;
    use serde_json::json;

    fn lock() -> Location {
        ORDER_LOCK_LOCATION.parse().unwrap()
    }

    #[test]
    fn test_create_sets_static_props() {
        let class = create(
            json!({
                "className": "FooNFT",
                "metadata": { "name": "Foo bar" },
                "maxSupply": 2,
                "foo": "bar",
            }),
            lock(),
        )
        .unwrap();

        assert_eq!(class.name, "FooNFT");
        assert_eq!(class.base, BaseClass::Nft);
        assert_eq!(class.max_supply(), Some(2));
        assert_eq!(class.supply(), 0);
        assert_eq!(class.prop("total"), Some(&json!(0)));
        assert_eq!(class.prop("version"), Some(&json!("1.0")));
        assert_eq!(class.prop("friends"), Some(&json!([ORDER_LOCK_LOCATION])));
        assert_eq!(class.prop("interactive"), Some(&json!(false)));
        assert_eq!(class.prop("foo"), Some(&json!("bar")));
    }

    #[test]
    fn test_create_without_cap() {
        let class = create(json!({ "metadata": { "name": "Foo bar" } }), lock()).unwrap();
        assert_eq!(class.name, "NFT");
        assert!(class.prop("maxSupply").is_none());
        assert_eq!(class.max_supply(), None);
    }

    #[test]
    fn test_cap_written_as_float_is_stored_as_integer() {
        let class = create(
            json!({ "metadata": { "name": "Foo bar" }, "maxSupply": 2.0 }),
            lock(),
        )
        .unwrap();
        assert_eq!(class.prop("maxSupply"), Some(&json!(2)));
        assert_eq!(class.max_supply(), Some(2));
    }

    #[test]
    fn test_create_rejects_bad_cap() {
        for cap in [json!(0.5), json!(-3), json!("two")] {
            let err = create(
                json!({ "metadata": { "name": "Foo bar" }, "maxSupply": cap }),
                lock(),
            )
            .unwrap_err();
            assert_eq!(err.to_string(), "'maxSupply' is invalid. must be a number");
        }
    }

    #[test]
    fn test_missing_metadata() {
        let err = create(json!({ "className": "FooNFT" }), lock()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "'metadata' is invalid. must be valid token metadata"
        );
    }
}
