//! Deployable contract classes.
//!
//! A token class is plain data: a name, the base class whose behaviour it
//! inherits, an explicit transfer capability and a bag of static
//! properties. Deploying it through the runtime yields a [`Code`], the same
//! class plus the runtime's bindings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Bindings, Location, Owner};
use crate::validation::as_integer;

/// Static property names owned by the runtime.
pub const BINDING_KEYS: [&str; 5] = ["location", "origin", "nonce", "owner", "satoshis"];

pub type StaticProps = Map<String, Value>;

/// Behaviour a token class inherits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseClass {
    /// Fungible token: `mint(amount, owner)`, `send(to, amount)`, `combine`.
    Token,
    /// Non-fungible token: `mint(owner)` numbered up to `maxSupply`.
    Nft,
}

impl BaseClass {
    pub fn version(self) -> &'static str {
        match self {
            BaseClass::Token => "2.0",
            BaseClass::Nft => "1.0",
        }
    }

    pub fn default_name(self) -> &'static str {
        match self {
            BaseClass::Token => "FT",
            BaseClass::Nft => "NFT",
        }
    }

    pub fn is_fungible(self) -> bool {
        matches!(self, BaseClass::Token)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub base: BaseClass,
    /// Adds a static `transfer(owner)` to the class.
    #[serde(default)]
    pub transferable: bool,
    #[serde(default)]
    pub props: StaticProps,
}

impl ClassDef {
    pub fn builder(name: impl Into<String>, base: BaseClass) -> ClassBuilder {
        ClassBuilder::new(name, base)
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Sets a static property. Runtime bindings are ignored.
    pub fn set_prop(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if BINDING_KEYS.contains(&key.as_str()) {
            return;
        }
        self.props.insert(key, value.into());
    }

    /// Declared decimal places. Values past `u32::MAX` saturate.
    pub fn decimals(&self) -> u32 {
        self.prop("decimals")
            .and_then(as_integer)
            .map_or(0, |d| u32::try_from(d).unwrap_or(u32::MAX))
    }

    pub fn supply(&self) -> u64 {
        self.prop("supply").and_then(as_integer).unwrap_or(0)
    }

    /// `maxSupply`, falling back to the relay-style `max`.
    pub fn max_supply(&self) -> Option<u64> {
        self.prop("maxSupply")
            .or_else(|| self.prop("max"))
            .and_then(as_integer)
            .filter(|max| *max > 0)
    }

    pub fn is_upgradable(&self) -> bool {
        self.prop("upgradable").and_then(Value::as_bool).unwrap_or(true)
    }
}

/// Builds a [`ClassDef`] without any runtime code synthesis.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    def: ClassDef,
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>, base: BaseClass) -> Self {
        Self {
            def: ClassDef {
                name: name.into(),
                base,
                transferable: false,
                props: StaticProps::new(),
            },
        }
    }

    pub fn transferable(mut self, transferable: bool) -> Self {
        self.def.transferable = transferable;
        self
    }

    pub fn prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.def.set_prop(key, value);
        self
    }

    /// Copies every entry of `props` onto the class.
    pub fn props(mut self, props: StaticProps) -> Self {
        for (key, value) in props {
            self.def.set_prop(key, value);
        }
        self
    }

    pub fn build(self) -> ClassDef {
        self.def
    }
}

/// A deployed class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    #[serde(flatten)]
    pub bindings: Bindings,
    #[serde(flatten)]
    pub class: ClassDef,
}

impl Code {
    pub fn location(&self) -> Location {
        self.bindings.location
    }

    pub fn origin(&self) -> Location {
        self.bindings.origin
    }

    pub fn owner(&self) -> Option<&Owner> {
        self.bindings.owner.as_ref()
    }

    pub fn name(&self) -> &str {
        &self.class.name
    }

    pub fn decimals(&self) -> u32 {
        self.class.decimals()
    }

    pub fn supply(&self) -> u64 {
        self.class.supply()
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.class.prop(key)
    }
}
