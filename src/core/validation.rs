//! Pluggable validation: the validator contract and the engine that runs it.

use crate::core::key;
use crate::core::rules::FieldFormat;
use crate::core::snapshot::Snapshot;
use crate::error::{Result, ValidationError};
use crate::value::Value;
use parking_lot::RwLock;
use std::sync::Arc;

/// Which fields a validator rules on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Coverage {
    /// Runs for every mutation.
    Blanket,
    /// Runs only for mutations inside these top-level field groups.
    FieldGroups(Vec<String>),
}

impl Coverage {
    /// Returns `true` if a mutation in `group` should be checked.
    pub fn covers(&self, group: &str) -> bool {
        match self {
            Self::Blanket => true,
            Self::FieldGroups(groups) => groups.iter().any(|g| g == group),
        }
    }
}

/// Trait for configuration validators.
///
/// Implement this trait to plug custom checks into the store. Validators see
/// a candidate [`Snapshot`] before it is committed and can veto it.
///
/// # Examples
///
/// ```rust
/// use hotswap_store::core::{Coverage, Snapshot, Validator};
/// use hotswap_store::error::ValidationError;
///
/// struct PortValidator;
///
/// impl Validator for PortValidator {
///     fn name(&self) -> &str {
///         "ports"
///     }
///
///     fn validate(&self, config: &Snapshot) -> Result<(), ValidationError> {
///         match config.get("server.port").and_then(|v| v.as_i64()) {
///             Some(port) if port > 65535 => Err(ValidationError::invalid_field(
///                 "server.port",
///                 "must be <= 65535",
///             )),
///             _ => Ok(()),
///         }
///     }
///
///     fn coverage(&self) -> Coverage {
///         Coverage::FieldGroups(vec!["server".to_string()])
///     }
/// }
/// ```
pub trait Validator: Send + Sync {
    /// Display name used in error reports.
    fn name(&self) -> &str;

    /// Validate a whole configuration.
    ///
    /// # Errors
    ///
    /// Should return a `ValidationError` describing what validation failed.
    fn validate(&self, config: &Snapshot) -> std::result::Result<(), ValidationError>;

    /// Validate a single-field mutation.
    ///
    /// `context` holds the touched field group of the candidate (the new value
    /// plus its siblings). Defaults to [`validate`](Validator::validate).
    ///
    /// # Errors
    ///
    /// Should return a `ValidationError` describing what validation failed.
    fn validate_field(
        &self,
        key: &str,
        context: &Snapshot,
    ) -> std::result::Result<(), ValidationError> {
        let _ = key;
        self.validate(context)
    }

    /// Field groups this validator rules on.
    fn coverage(&self) -> Coverage {
        Coverage::Blanket
    }
}

type CheckFn = Arc<dyn Fn(&Snapshot) -> std::result::Result<(), ValidationError> + Send + Sync>;

/// A validator backed by a closure.
///
/// Blanket by default; restrict it with [`for_groups`](FnValidator::for_groups).
///
/// # Examples
///
/// ```rust
/// use hotswap_store::core::FnValidator;
/// use hotswap_store::error::ValidationError;
///
/// let validator = FnValidator::new("no-debug-in-prod", |config| {
///     let prod = config.get("app.env").and_then(|v| v.as_str()) == Some("prod");
///     let debug = config.get("app.debug").and_then(|v| v.as_bool()) == Some(true);
///     if prod && debug {
///         return Err(ValidationError::invalid_field("app.debug", "not allowed in prod"));
///     }
///     Ok(())
/// })
/// .for_groups(["app"]);
/// ```
#[derive(Clone)]
pub struct FnValidator {
    name: String,
    check: CheckFn,
    coverage: Coverage,
}

impl FnValidator {
    /// Wrap `check` as a blanket validator.
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Snapshot) -> std::result::Result<(), ValidationError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
            coverage: Coverage::Blanket,
        }
    }

    /// Only run for mutations inside these field groups.
    pub fn for_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.coverage = Coverage::FieldGroups(groups.into_iter().map(Into::into).collect());
        self
    }
}

impl Validator for FnValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, config: &Snapshot) -> std::result::Result<(), ValidationError> {
        (self.check)(config)
    }

    fn coverage(&self) -> Coverage {
        self.coverage.clone()
    }
}

/// Name reported for failures of the built-in plausibility checks.
pub const BASELINE_VALIDATOR: &str = "baseline";

/// Runs registered validators against candidate snapshots.
///
/// The validator list sits behind its own lock; every pass works on a
/// point-in-time copy, so validators can be added or removed concurrently.
#[derive(Default)]
pub struct ValidationEngine {
    validators: RwLock<Vec<Arc<dyn Validator>>>,
}

impl ValidationEngine {
    /// Create an engine with no validators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validator.
    pub fn add(&self, validator: Arc<dyn Validator>) {
        self.validators.write().push(validator);
    }

    /// Remove every validator with this name. Returns `true` if any was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut validators = self.validators.write();
        let before = validators.len();
        validators.retain(|v| v.name() != name);
        validators.len() != before
    }

    /// Remove all validators.
    pub fn clear(&self) {
        self.validators.write().clear();
    }

    /// Names of the registered validators, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.validators
            .read()
            .iter()
            .map(|v| v.name().to_string())
            .collect()
    }

    /// Number of registered validators.
    pub fn len(&self) -> usize {
        self.validators.read().len()
    }

    /// Returns `true` if no validators are registered.
    pub fn is_empty(&self) -> bool {
        self.validators.read().is_empty()
    }

    fn current(&self) -> Vec<Arc<dyn Validator>> {
        self.validators.read().clone()
    }

    /// Run every validator's full check against `candidate`.
    ///
    /// # Errors
    ///
    /// Returns the first failure as [`ConfigError::Validation`](crate::error::ConfigError::Validation).
    pub fn validate_all(&self, candidate: &Snapshot) -> Result<()> {
        for validator in self.current() {
            validator
                .validate(candidate)
                .map_err(|e| e.into_config_error(validator.name(), "", None))?;
        }
        Ok(())
    }

    /// Validate a single-field mutation of `key` to `value` inside `candidate`.
    ///
    /// Only validators covering the key's field group run, against a context
    /// holding just that group. With no validators registered, a built-in
    /// plausibility check on port/URL/email/host/timeout-like keys runs instead.
    ///
    /// # Errors
    ///
    /// Returns the first failure as [`ConfigError::Validation`](crate::error::ConfigError::Validation), or
    /// [`ConfigError::InvalidKey`](crate::error::ConfigError::InvalidKey) for a malformed key.
    pub fn validate_field(&self, key: &str, value: &Value, candidate: &Snapshot) -> Result<()> {
        key::segments(key)?;
        let validators = self.current();

        if validators.is_empty() {
            return baseline_check(key, value)
                .map_err(|e| e.into_config_error(BASELINE_VALIDATOR, key, Some(value)));
        }

        let group = key::field_group(key);
        let context = candidate.group(group);

        for validator in validators
            .iter()
            .filter(|v| v.coverage().covers(group))
        {
            validator
                .validate_field(key, &context)
                .map_err(|e| e.into_config_error(validator.name(), key, Some(value)))?;
        }
        Ok(())
    }
}

/// Format checks keyed off the leaf name, applied to every leaf of `value`.
fn baseline_check(key: &str, value: &Value) -> std::result::Result<(), ValidationError> {
    let mut failure = None;
    value.for_each_leaf(key, &mut |path, leaf| {
        if failure.is_some() || leaf.is_null() {
            return;
        }
        let leaf_name = path.rsplit('.').next().unwrap_or(path).to_ascii_lowercase();
        if let Some(format) = baseline_format(&leaf_name) {
            if let Err(reason) = format.check(leaf) {
                failure = Some(ValidationError::invalid_field(path, reason));
            }
        }
    });
    failure.map_or(Ok(()), Err)
}

fn baseline_format(leaf: &str) -> Option<FieldFormat> {
    if leaf == "port" || leaf.ends_with("_port") {
        Some(FieldFormat::Port)
    } else if leaf == "url" || leaf.ends_with("_url") {
        Some(FieldFormat::Url)
    } else if leaf == "email" || leaf.ends_with("_email") {
        Some(FieldFormat::Email)
    } else if leaf == "host" || leaf == "hostname" || leaf.ends_with("_host") {
        Some(FieldFormat::Hostname)
    } else if leaf.contains("timeout") {
        Some(FieldFormat::Duration)
    } else {
        None
    }
}
