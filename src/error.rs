use thiserror::Error;

use crate::config::ConfigError;
use crate::order_lock::OrderLockError;
use crate::runtime::RuntimeError;
use crate::script::ScriptError;
use crate::types::{Location, Network, TypeError};
use crate::validation::ValidationError;

/// Every failure a kit operation can surface. Runtime errors pass through
/// with the runtime's own message.
#[derive(Debug, Error)]
pub enum KitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    OrderLock(#[from] OrderLockError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Method unavailable. Type must be \"FT\".")]
    MethodUnavailable,
    #[error("Invalid JigBox type. Must be `FT` or `NFT`.")]
    InvalidJigBoxType(String),
    #[error("Invalid recipients. `{0}` expects a non-empty list of recipients.")]
    InvalidRecipients(&'static str),
    #[error("offer must be created from a jig or jigbox with amount")]
    InvalidOfferSource,
    #[error("{0} is not an offer")]
    NotAnOffer(Location),
    #[error("Script verification failed for input {vin}: {reason}")]
    ScriptVerification { vin: usize, reason: String },
    #[error("No OrderLock class is configured for the {0} network")]
    MissingOrderLockPreset(Network),
    #[error("{name} is not a {expected} class")]
    WrongClassKind { name: String, expected: &'static str },
    #[error("Burn split did not produce a unit of {0}")]
    BurnUnitMissing(u64),
    #[error("Invalid decimals: {0}. Max: 100")]
    InvalidDecimals(u32),
}
