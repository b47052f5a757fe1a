//! Fungible token classes.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::contracts::{BaseClass, ClassDef, Code};
use crate::error::KitError;
use crate::jigbox::{JigBox, JigBoxKind, MAX_DECIMALS};
use crate::kit::TokenKit;
use crate::runtime::{MintArgs, RunInstance};
use crate::script::Txid;
use crate::tokens::{self, take_present, take_string, ClassSource};
use crate::types::{Location, Owner};
use crate::validation::{
    as_integer, cached_regex, metadata_schema, number, object, string, validate_params, Field,
    NumberOpts, ObjectOpts, Schema, StringOpts, ValidationError,
};

/// Static props an upgrade never overwrites.
pub const PROTECTED_PROPS: [&str; 1] = ["supply"];

static CLASS_NAME: OnceLock<Regex> = OnceLock::new();

pub(crate) fn class_name_field(default: &str) -> Result<Field, ValidationError> {
    let pattern = cached_regex(&CLASS_NAME, r"(?i)^[a-z]\w*$")?;
    Ok(Field::new(string(StringOpts {
        matches: Some(pattern),
        min: Some(1),
        message: Some("must be a valid class name".to_string()),
        ..Default::default()
    }))
    .with_default(default))
}

pub(crate) fn metadata_field() -> Field {
    Field::new(object(ObjectOpts {
        schema: Some(metadata_schema()),
        message: Some("must be valid token metadata".to_string()),
        ..Default::default()
    }))
}

pub fn schema() -> Result<Schema, ValidationError> {
    Ok(Schema::new()
        .field("className", class_name_field(BaseClass::Token.default_name())?)
        .field("metadata", metadata_field())
        .field(
            "symbol",
            string(StringOpts {
                min: Some(1),
                message: Some("must be a non-empty string".to_string()),
                ..Default::default()
            }),
        )
        .field(
            "decimals",
            number(NumberOpts {
                allow_blank: true,
                integer: true,
                min: Some(0.0),
                max: Some(MAX_DECIMALS as f64),
                message: Some(format!("must be an integer from 0 to {MAX_DECIMALS}")),
                ..Default::default()
            }),
        ))
}

/// Builds an undeployed fungible class from `params`.
///
/// `className`, `metadata`, `symbol`, `decimals` and `transferable` are
/// interpreted; every other param becomes a static prop.
pub fn create(params: Value) -> Result<ClassDef, KitError> {
    let mut params = validate_params(params, &schema()?)?;

    let name = take_string(&mut params, "className");
    let metadata = params.remove("metadata").unwrap_or(Value::Null);
    let symbol = take_string(&mut params, "symbol");
    let decimals = take_present(&mut params, "decimals")
        .as_ref()
        .and_then(as_integer)
        .unwrap_or(0);
    let transferable = take_present(&mut params, "transferable").is_some();

    let base = BaseClass::Token;
    Ok(ClassDef::builder(name, base)
        .transferable(transferable)
        .prop("metadata", metadata)
        .prop("sealed", false)
        .prop("symbol", symbol)
        .prop("decimals", decimals)
        .prop("supply", 0)
        .prop("version", base.version())
        .props(params)
        .build())
}

fn resolve(source: ClassSource) -> Result<ClassDef, KitError> {
    let class = match source {
        ClassSource::Params(params) => create(params)?,
        ClassSource::Class(class) => class,
    };
    if !class.base.is_fungible() {
        return Err(KitError::WrongClassKind {
            name: class.name,
            expected: "fungible",
        });
    }
    Ok(class)
}

/// Fungible token operations.
pub struct Ft<'a, R: RunInstance + ?Sized> {
    kit: &'a TokenKit<R>,
}

impl<'a, R: RunInstance + ?Sized> Ft<'a, R> {
    pub(crate) fn new(kit: &'a TokenKit<R>) -> Self {
        Self { kit }
    }

    pub fn create(&self, params: Value) -> Result<ClassDef, KitError> {
        create(params)
    }

    pub async fn deploy(&self, source: impl Into<ClassSource>) -> Result<Code, KitError> {
        let class = resolve(source.into())?;
        tokens::deploy_class(self.kit.run().as_ref(), class).await
    }

    /// Upgrades the class at `origin`. The running supply is preserved.
    pub async fn upgrade(&self, origin: &Location, source: impl Into<ClassSource>) -> Result<Code, KitError> {
        let class = resolve(source.into())?;
        let updated: Vec<String> = class
            .props
            .keys()
            .filter(|key| !PROTECTED_PROPS.contains(&key.as_str()))
            .cloned()
            .collect();
        tokens::upgrade_class(self.kit.run().as_ref(), origin, class, &updated).await
    }

    /// Mints `amount` to `owner` for each recipient, in one transaction.
    pub async fn mint<O>(&self, origin: &Location, recipients: Vec<(u64, O)>) -> Result<Txid, KitError>
    where
        O: Into<Owner>,
    {
        let args = recipients
            .into_iter()
            .map(|(amount, owner)| MintArgs::Fungible {
                amount,
                owner: owner.into(),
            })
            .collect();
        tokens::mint_tokens(self.kit.run().as_ref(), origin, args).await
    }

    /// The runtime owner's holdings of the class at `origin`.
    pub async fn get_jig_box(&self, origin: &Location) -> Result<JigBox<R>, KitError> {
        JigBox::from_origin(self.kit.run().clone(), origin, JigBoxKind::Ft).await
    }
}
