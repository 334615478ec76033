//! Declarative field rules and the rule-set validator built from them.

use crate::core::key;
use crate::core::snapshot::Snapshot;
use crate::core::validation::{Coverage, Validator};
use crate::error::{ConfigError, Result, ValidationError};
use crate::value::Value;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, LazyLock};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)+$").expect("valid regex")
});

static HOSTNAME: LazyLock<Regex> = LazyLock::new(|| {
    let label = r"[A-Za-z0-9]([A-Za-z0-9\-]{0,61}[A-Za-z0-9])?";
    Regex::new(&format!(r"^{label}(\.{label})*$")).expect("valid regex")
});

static DURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(\.\d+)?(ns|us|ms|s|m|h))+$").expect("valid regex"));

/// Well-known value formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    /// Absolute URL with a scheme
    Url,
    /// `local@domain.tld`
    Email,
    /// DNS hostname or IP address
    Hostname,
    /// Non-negative number of seconds or a duration string such as `30s` or `1m30s`
    Duration,
    /// Integer in `1..=65535`
    Port,
}

impl FieldFormat {
    /// Check `value` against this format, returning the failure reason.
    pub fn check(&self, value: &Value) -> std::result::Result<(), String> {
        match self {
            Self::Url => {
                let text = expect_str(value, "a URL")?;
                url::Url::parse(text)
                    .map(|_| ())
                    .map_err(|e| format!("'{text}' is not a valid URL: {e}"))
            }
            Self::Email => {
                let text = expect_str(value, "an email address")?;
                if EMAIL.is_match(text) {
                    Ok(())
                } else {
                    Err(format!("'{text}' is not a valid email address"))
                }
            }
            Self::Hostname => {
                let text = expect_str(value, "a hostname")?;
                if text.parse::<std::net::IpAddr>().is_ok()
                    || (text.len() <= 253 && HOSTNAME.is_match(text))
                {
                    Ok(())
                } else {
                    Err(format!("'{text}' is not a valid hostname"))
                }
            }
            Self::Duration => match value {
                Value::String(text) if DURATION.is_match(text) => Ok(()),
                Value::String(text) => Err(format!("'{text}' is not a valid duration")),
                other => match other.as_f64() {
                    Some(secs) if secs >= 0.0 => Ok(()),
                    Some(_) => Err("must not be negative".to_string()),
                    None => Err(format!("expected a duration, found {}", other.type_name())),
                },
            },
            Self::Port => {
                let port = match value {
                    Value::String(text) => text.parse::<i64>().ok(),
                    other => other.as_i64(),
                };
                match port {
                    Some(p) if (1..=65535).contains(&p) => Ok(()),
                    Some(p) => Err(format!("port {p} is outside 1-65535")),
                    None => Err(format!("expected a port number, found {value}")),
                }
            }
        }
    }
}

fn expect_str<'a>(value: &'a Value, what: &str) -> std::result::Result<&'a str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected {what}, found {}", value.type_name()))
}

type CustomCheck = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// What a [`Rule`] checks.
#[derive(Clone)]
pub enum Check {
    /// The field must be present and not null.
    Required,
    /// The field must be numeric and inside the inclusive bounds.
    Range {
        /// Lower bound
        min: Option<f64>,
        /// Upper bound
        max: Option<f64>,
    },
    /// The field must be a string matching the pattern.
    Pattern(Regex),
    /// The field must equal one of the listed values.
    OneOf(Vec<Value>),
    /// The field must satisfy a well-known format.
    Format(FieldFormat),
    /// The field must satisfy the predicate.
    Custom(CustomCheck),
}

impl fmt::Debug for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => f.write_str("Required"),
            Self::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            Self::Pattern(re) => f.debug_tuple("Pattern").field(&re.as_str()).finish(),
            Self::OneOf(values) => f.debug_tuple("OneOf").field(values).finish(),
            Self::Format(format) => f.debug_tuple("Format").field(format).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A predicate over one field path plus the message reported on failure.
///
/// # Examples
///
/// ```rust
/// use hotswap_store::core::Rule;
///
/// let rule = Rule::range("server.port", 1, 65535).with_message("port out of range");
/// assert_eq!(rule.field(), "server.port");
/// ```
#[derive(Debug, Clone)]
pub struct Rule {
    field: String,
    check: Check,
    message: Option<String>,
}

impl Rule {
    /// Build a rule from its parts.
    pub fn new(field: impl Into<String>, check: Check) -> Self {
        Self {
            field: field.into(),
            check,
            message: None,
        }
    }

    /// The field must be present.
    pub fn required(field: impl Into<String>) -> Self {
        Self::new(field, Check::Required)
    }

    /// The field must be a number within `min..=max`.
    pub fn range(field: impl Into<String>, min: impl Into<f64>, max: impl Into<f64>) -> Self {
        Self::new(
            field,
            Check::Range {
                min: Some(min.into()),
                max: Some(max.into()),
            },
        )
    }

    /// The field must be a number no smaller than `min`.
    pub fn min(field: impl Into<String>, min: impl Into<f64>) -> Self {
        Self::new(
            field,
            Check::Range {
                min: Some(min.into()),
                max: None,
            },
        )
    }

    /// The field must be a number no larger than `max`.
    pub fn max(field: impl Into<String>, max: impl Into<f64>) -> Self {
        Self::new(
            field,
            Check::Range {
                min: None,
                max: Some(max.into()),
            },
        )
    }

    /// The field must be a string matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pattern is not a valid regular expression.
    pub fn pattern(field: impl Into<String>, pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern)
            .map_err(|e| ConfigError::Other(format!("Invalid rule pattern '{pattern}': {e}")))?;
        Ok(Self::new(field, Check::Pattern(re)))
    }

    /// The field must equal one of `values`.
    pub fn one_of<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::new(
            field,
            Check::OneOf(values.into_iter().map(Into::into).collect()),
        )
    }

    /// The field must satisfy `format`.
    pub fn format(field: impl Into<String>, format: FieldFormat) -> Self {
        Self::new(field, Check::Format(format))
    }

    /// The field must satisfy `predicate`.
    pub fn custom<F>(field: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::new(field, Check::Custom(Arc::new(predicate)))
    }

    /// Override the failure message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Dot path this rule applies to.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Returns `true` for presence rules.
    pub fn is_required(&self) -> bool {
        matches!(self.check, Check::Required)
    }

    /// Evaluate the rule against `config`.
    pub fn evaluate(&self, config: &Snapshot) -> std::result::Result<(), ValidationError> {
        let value = config.get(&self.field).filter(|v| !v.is_null());

        let outcome = match (&self.check, value) {
            (Check::Required, None) => Err("is required".to_string()),
            // Every other check only constrains values that are present.
            (_, None) | (Check::Required, Some(_)) => Ok(()),
            (Check::Range { min, max }, Some(value)) => check_range(value, *min, *max),
            (Check::Pattern(re), Some(value)) => match value.as_str() {
                Some(text) if re.is_match(text) => Ok(()),
                Some(text) => Err(format!("'{text}' does not match pattern {}", re.as_str())),
                None => Err(format!("expected a string, found {}", value.type_name())),
            },
            (Check::OneOf(allowed), Some(value)) => {
                if allowed.contains(value) {
                    Ok(())
                } else {
                    Err(format!("{value} is not one of {}", Value::List(allowed.clone())))
                }
            }
            (Check::Format(format), Some(value)) => format.check(value),
            (Check::Custom(predicate), Some(value)) => {
                if predicate(value) {
                    Ok(())
                } else {
                    Err(format!("{value} was rejected"))
                }
            }
        };

        outcome.map_err(|reason| {
            ValidationError::invalid_field(&self.field, self.message.clone().unwrap_or(reason))
        })
    }
}

fn check_range(
    value: &Value,
    min: Option<f64>,
    max: Option<f64>,
) -> std::result::Result<(), String> {
    let Some(number) = value.as_f64() else {
        return Err(format!("expected a number, found {}", value.type_name()));
    };
    if let Some(min) = min {
        if number < min {
            return Err(format!("{value} is below the minimum {min}"));
        }
    }
    if let Some(max) = max {
        if number > max {
            return Err(format!("{value} exceeds the maximum {max}"));
        }
    }
    Ok(())
}

/// A named collection of [`Rule`]s.
///
/// A rule set is field-aware: it rules on the field groups its rules name and
/// is skipped for mutations elsewhere. During a single-field mutation its
/// `required` rules only apply to the key being set, so a partial update never
/// fails because unrelated siblings are still missing.
///
/// # Examples
///
/// ```rust
/// use hotswap_store::core::{Rule, RuleSet};
///
/// let rules = RuleSet::new("database")
///     .rule(Rule::required("db.host"))
///     .rule(Rule::required("db.user"))
///     .rule(Rule::range("db.pool", 1, 64));
/// assert_eq!(rules.len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct RuleSet {
    name: String,
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Create an empty rule set.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }

    /// Add a rule.
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn run<'a>(
        &self,
        rules: impl Iterator<Item = &'a Rule>,
        config: &Snapshot,
    ) -> std::result::Result<(), ValidationError> {
        for rule in rules {
            rule.evaluate(config)?;
        }
        Ok(())
    }
}

impl Validator for RuleSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, config: &Snapshot) -> std::result::Result<(), ValidationError> {
        self.run(self.rules.iter(), config)
    }

    fn validate_field(
        &self,
        key: &str,
        context: &Snapshot,
    ) -> std::result::Result<(), ValidationError> {
        self.run(
            self.rules
                .iter()
                .filter(|rule| !rule.is_required() || rule.field() == key),
            context,
        )
    }

    fn coverage(&self) -> Coverage {
        let mut groups: Vec<String> = Vec::new();
        for rule in &self.rules {
            let group = key::field_group(rule.field());
            if !groups.iter().any(|g| g == group) {
                groups.push(group.to_string());
            }
        }
        Coverage::FieldGroups(groups)
    }
}
