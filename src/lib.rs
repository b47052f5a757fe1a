// src/lib.rs

pub mod config;
pub mod contracts;
pub mod dex;
pub mod error;
pub mod ft;
pub mod jigbox;
pub mod kit;
pub mod ledger;
pub mod logging;
pub mod mock;
pub mod nft;
pub mod order_lock;
pub mod runtime;
pub mod script;
pub mod storage;
pub mod tokens;
pub mod types;
pub mod validation;

pub use config::KitConfig;
pub use contracts::{BaseClass, ClassBuilder, ClassDef, Code};
pub use dex::{Dex, HoldingSource, OfferParams};
pub use error::KitError;
pub use jigbox::{JigBox, JigBoxKind};
pub use kit::TokenKit;
pub use mock::MockRun;
pub use order_lock::OrderLock;
pub use runtime::{RunInstance, RunTransaction, RuntimeError};
pub use types::{Jig, Location, Network, Owner};
