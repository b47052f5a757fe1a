//! Declarative parameter validation.
//!
//! A [`Schema`] maps field names to a [`Field`]: a [`Validator`] plus an
//! optional default. [`validate_params`] walks the schema in declaration
//! order, injects defaults for blank fields and stops at the first field
//! that fails. Keys the schema does not name pass through untouched.
//!
//! "Blank" follows the loose truthiness token parameters are written with:
//! `null`, a missing key, `false`, `0` and `""` are all blank.

use std::fmt;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// A parameter object as accepted by the token and offer builders.
pub type Params = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid params")]
    InvalidParams,
    #[error("'{field}' is invalid. {message}")]
    InvalidField { field: String, message: String },
    #[error("bad pattern: {0}")]
    Pattern(String),
}

impl ValidationError {
    /// Name of the offending field, if the error concerns one.
    pub fn field(&self) -> Option<&str> {
        match self {
            ValidationError::InvalidParams | ValidationError::Pattern(_) => None,
            ValidationError::InvalidField { field, .. } => Some(field),
        }
    }
}

type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Custom assertion run by [`object`] validators after the shape checks.
pub type Assertion = Arc<dyn Fn(&Params) -> bool + Send + Sync>;

/// A pure predicate over a JSON value paired with the message reported
/// when it rejects.
#[derive(Clone)]
pub struct Validator {
    predicate: Predicate,
    message: String,
}

impl Validator {
    pub fn new<F>(message: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn check(&self, value: &Value) -> bool {
        (self.predicate)(value)
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Returns true for values that count as "not given".
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f == 0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Reads a non-negative integral number, whether it was written `2` or
/// `2.0`.
pub fn as_integer(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|n| *n >= 0.0 && n.fract() == 0.0 && *n < u64::MAX as f64)
            .map(|n| n as u64)
    })
}

/// `pattern` compiled on first use and shared through `cell` afterwards.
pub fn cached_regex(cell: &'static OnceLock<Regex>, pattern: &str) -> Result<Regex, ValidationError> {
    if let Some(regex) = cell.get() {
        return Ok(regex.clone());
    }
    let regex = Regex::new(pattern).map_err(|e| ValidationError::Pattern(e.to_string()))?;
    Ok(cell.get_or_init(|| regex).clone())
}

#[derive(Debug, Clone, Default)]
pub struct NumberOpts {
    pub allow_blank: bool,
    pub integer: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub message: Option<String>,
}

/// Builds a number validator.
pub fn number(opts: NumberOpts) -> Validator {
    let NumberOpts {
        allow_blank,
        integer,
        min,
        max,
        message,
    } = opts;

    Validator::new(
        message.unwrap_or_else(|| "must be a number".to_string()),
        move |value| {
            if allow_blank && is_blank(value) {
                return true;
            }
            let Some(n) = value.as_f64() else {
                return false;
            };
            if integer && n.fract() != 0.0 {
                return false;
            }
            if min.map_or(false, |min| n < min) {
                return false;
            }
            if max.map_or(false, |max| n > max) {
                return false;
            }
            true
        },
    )
}

#[derive(Debug, Clone, Default)]
pub struct StringOpts {
    pub allow_blank: bool,
    pub matches: Option<Regex>,
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub message: Option<String>,
}

/// Builds a string validator. `min`/`max` bound the length in characters.
pub fn string(opts: StringOpts) -> Validator {
    let StringOpts {
        allow_blank,
        matches,
        min,
        max,
        message,
    } = opts;

    Validator::new(
        message.unwrap_or_else(|| "must be a string".to_string()),
        move |value| {
            if allow_blank && is_blank(value) {
                return true;
            }
            let Some(s) = value.as_str() else {
                return false;
            };
            if let Some(re) = &matches {
                if !re.is_match(s) {
                    return false;
                }
            }
            let len = s.chars().count();
            if min.map_or(false, |min| len < min) {
                return false;
            }
            if max.map_or(false, |max| len > max) {
                return false;
            }
            true
        },
    )
}

#[derive(Clone, Default)]
pub struct ObjectOpts {
    pub allow_blank: bool,
    pub assert: Option<Assertion>,
    pub schema: Option<Schema>,
    pub message: Option<String>,
}

/// Builds an object validator. A nested schema is applied to a copy of the
/// value, so defaults it declares never leak into the caller's params.
pub fn object(opts: ObjectOpts) -> Validator {
    let ObjectOpts {
        allow_blank,
        assert,
        schema,
        message,
    } = opts;

    Validator::new(
        message.unwrap_or_else(|| "must be an object".to_string()),
        move |value| {
            if allow_blank && is_blank(value) {
                return true;
            }
            let Some(map) = value.as_object() else {
                return false;
            };
            if let Some(schema) = &schema {
                if schema.validate(map.clone()).is_err() {
                    return false;
                }
            }
            if let Some(assert) = &assert {
                if !assert(map) {
                    return false;
                }
            }
            true
        },
    )
}

#[derive(Debug, Clone)]
pub struct Field {
    validator: Validator,
    default: Option<Value>,
}

impl Field {
    pub fn new(validator: Validator) -> Self {
        Self {
            validator,
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }
}

impl From<Validator> for Field {
    fn from(validator: Validator) -> Self {
        Field::new(validator)
    }
}

/// Ordered field name -> [`Field`] mapping.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<(String, Field)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field, replacing any earlier field of the same name in place.
    pub fn field(mut self, name: impl Into<String>, field: impl Into<Field>) -> Self {
        let name = name.into();
        let field = field.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = field,
            None => self.fields.push((name, field)),
        }
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(name, field)| (name.as_str(), field))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validates `params`, returning them with defaults applied.
    pub fn validate(&self, mut params: Params) -> Result<Params, ValidationError> {
        for (key, field) in &self.fields {
            let blank = params.get(key).map_or(true, is_blank);
            if blank {
                if let Some(default) = &field.default {
                    params.insert(key.clone(), default.clone());
                }
            }

            let value = params.get(key).unwrap_or(&Value::Null);
            if !field.validator.check(value) {
                tracing::debug!(field = %key, reason = %field.validator.message(), "parameter rejected");
                return Err(ValidationError::InvalidField {
                    field: key.clone(),
                    message: field.validator.message.clone(),
                });
            }
        }

        Ok(params)
    }
}

/// Validates an arbitrary JSON value against `schema`. Anything other than
/// an object is rejected outright.
pub fn validate_params(params: Value, schema: &Schema) -> Result<Params, ValidationError> {
    match params {
        Value::Object(map) => schema.validate(map),
        _ => Err(ValidationError::InvalidParams),
    }
}

/// Schema for the `metadata` object carried by every token class.
pub fn metadata_schema() -> Schema {
    Schema::new().field(
        "name",
        string(StringOpts {
            min: Some(1),
            message: Some("must have a name".to_string()),
            ..Default::default()
        }),
    )
}
