//! Conditions that gate attribute values.
//!
//! A condition is a pure predicate over one or more component attributes. It
//! is used both to decide whether an imported value is usable and to accept
//! or reject answers proposed for a decision. Missing and `Null` values
//! always reject.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::component::Component;
use crate::error::ValidationError;
use crate::value::Value;

/// A stateless predicate over component attributes.
///
/// Implementations must not have side effects; the same condition instance is
/// shared by every decision it guards.
pub trait Condition: fmt::Debug + fmt::Display + Send + Sync {
    /// The attribute this condition primarily reads.
    fn attribute(&self) -> &str;

    /// Checks a single value. `None` means the attribute is absent.
    fn check(&self, value: Option<&Value>) -> bool;

    /// Evaluates the condition against a component.
    fn evaluate(&self, component: &Component) -> bool {
        self.check(component.attribute(self.attribute()))
    }
}

/// Shared handle to a condition.
pub type SharedCondition = Arc<dyn Condition>;

/// Evaluates `condition` against `component`.
pub fn evaluate(component: &Component, condition: &dyn Condition) -> bool {
    let accepted = condition.evaluate(component);
    tracing::trace!(component = %component.id, %condition, accepted, "condition evaluated");
    accepted
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// Numeric value within `[min, max]` (inclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct RangeCondition {
    attribute: String,
    min: f64,
    max: f64,
}

impl RangeCondition {
    /// Creates a range condition; `min` must not exceed `max`.
    pub fn new(attribute: impl Into<String>, min: f64, max: f64) -> Result<Self, ValidationError> {
        let attribute = attribute.into();
        if attribute.trim().is_empty() {
            return Err(ValidationError::EmptyAttribute);
        }
        if min.is_nan() || max.is_nan() || min > max {
            return Err(ValidationError::InvalidRange { attribute, min, max });
        }
        Ok(Self { attribute, min, max })
    }

    #[must_use]
    pub const fn min(&self) -> f64 {
        self.min
    }

    #[must_use]
    pub const fn max(&self) -> f64 {
        self.max
    }
}

impl Condition for RangeCondition {
    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn check(&self, value: Option<&Value>) -> bool {
        present(value)
            .and_then(Value::as_float)
            .map_or(false, |v| v >= self.min && v <= self.max)
    }
}

impl fmt::Display for RangeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "range({}: [{}, {}])", self.attribute, self.min, self.max)
    }
}

/// Value must equal one of an allowed set.
#[derive(Debug, Clone, PartialEq)]
pub struct OneOfCondition {
    attribute: String,
    allowed: Vec<Value>,
}

impl OneOfCondition {
    pub fn new(attribute: impl Into<String>, allowed: Vec<Value>) -> Result<Self, ValidationError> {
        let attribute = attribute.into();
        if attribute.trim().is_empty() {
            return Err(ValidationError::EmptyAttribute);
        }
        Ok(Self { attribute, allowed })
    }
}

impl Condition for OneOfCondition {
    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn check(&self, value: Option<&Value>) -> bool {
        present(value).map_or(false, |v| self.allowed.contains(v))
    }
}

impl fmt::Display for OneOfCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allowed: Vec<String> = self.allowed.iter().map(ToString::to_string).collect();
        write!(f, "one_of({}: [{}])", self.attribute, allowed.join(", "))
    }
}

/// String value must match a regular expression.
#[derive(Debug, Clone)]
pub struct RegexCondition {
    attribute: String,
    regex: Regex,
}

impl RegexCondition {
    pub fn new(attribute: impl Into<String>, pattern: &str) -> Result<Self, ValidationError> {
        let attribute = attribute.into();
        if attribute.trim().is_empty() {
            return Err(ValidationError::EmptyAttribute);
        }
        let regex = Regex::new(pattern).map_err(|e| ValidationError::InvalidRegex {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { attribute, regex })
    }
}

impl Condition for RegexCondition {
    fn attribute(&self) -> &str {
        &self.attribute
    }

    fn check(&self, value: Option<&Value>) -> bool {
        present(value)
            .and_then(Value::as_string)
            .map_or(false, |s| self.regex.is_match(s))
    }
}

impl fmt::Display for RegexCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "regex({}: {})", self.attribute, self.regex.as_str())
    }
}

/// Cross-attribute condition: `lower < upper` (or `<=` when not strict).
///
/// A typical use is requiring the return temperature of a boiler to stay
/// below its flow temperature. Checked on a bare value the other attribute is
/// missing, so [`Condition::check`] always rejects.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedCondition {
    lower: String,
    upper: String,
    strict: bool,
}

impl OrderedCondition {
    pub fn new(
        lower: impl Into<String>,
        upper: impl Into<String>,
        strict: bool,
    ) -> Result<Self, ValidationError> {
        let lower = lower.into();
        let upper = upper.into();
        if lower.trim().is_empty() || upper.trim().is_empty() {
            return Err(ValidationError::EmptyAttribute);
        }
        Ok(Self { lower, upper, strict })
    }

    /// The attribute that must hold the larger value.
    #[must_use]
    pub fn upper(&self) -> &str {
        &self.upper
    }
}

impl Condition for OrderedCondition {
    fn attribute(&self) -> &str {
        &self.lower
    }

    fn check(&self, _value: Option<&Value>) -> bool {
        false
    }

    fn evaluate(&self, component: &Component) -> bool {
        let read = |name: &str| present(component.attribute(name)).and_then(Value::as_float);
        match (read(self.lower.as_str()), read(self.upper.as_str())) {
            (Some(lo), Some(hi)) if self.strict => lo < hi,
            (Some(lo), Some(hi)) => lo <= hi,
            _ => false,
        }
    }
}

impl fmt::Display for OrderedCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = if self.strict { "<" } else { "<=" };
        write!(f, "ordered({} {op} {})", self.lower, self.upper)
    }
}

/// Serializable description of a condition, used in model snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSpec {
    Range {
        attribute: String,
        min: f64,
        max: f64,
    },
    OneOf {
        attribute: String,
        allowed: Vec<Value>,
    },
    Regex {
        attribute: String,
        pattern: String,
    },
    Ordered {
        lower: String,
        upper: String,
        #[serde(default)]
        strict: bool,
    },
}

impl ConditionSpec {
    /// Creates a range spec.
    #[must_use]
    pub fn range(attribute: impl Into<String>, min: f64, max: f64) -> Self {
        Self::Range {
            attribute: attribute.into(),
            min,
            max,
        }
    }

    /// Attribute the built condition primarily reads.
    #[must_use]
    pub fn attribute(&self) -> &str {
        match self {
            Self::Range { attribute, .. }
            | Self::OneOf { attribute, .. }
            | Self::Regex { attribute, .. } => attribute,
            Self::Ordered { lower, .. } => lower,
        }
    }

    /// Builds the condition this spec describes.
    pub fn build(&self) -> Result<SharedCondition, ValidationError> {
        Ok(match self {
            Self::Range { attribute, min, max } => {
                Arc::new(RangeCondition::new(attribute.clone(), *min, *max)?)
            }
            Self::OneOf { attribute, allowed } => {
                Arc::new(OneOfCondition::new(attribute.clone(), allowed.clone())?)
            }
            Self::Regex { attribute, pattern } => {
                Arc::new(RegexCondition::new(attribute.clone(), pattern)?)
            }
            Self::Ordered { lower, upper, strict } => {
                Arc::new(OrderedCondition::new(lower.clone(), upper.clone(), *strict)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentId, ComponentKind};

    fn boiler_with(power: Option<Value>) -> Component {
        let mut boiler = Component::new(ComponentId::new("boiler").unwrap(), ComponentKind::Boiler);
        if let Some(v) = power {
            boiler.set_attribute("rated_power", v).unwrap();
        }
        boiler
    }

    #[test]
    fn test_range_gates_power() {
        let power = RangeCondition::new("rated_power", 10.0, 100.0).unwrap();

        assert!(!evaluate(&boiler_with(Some(Value::Int(5))), &power));
        assert!(!evaluate(&boiler_with(Some(Value::Int(150))), &power));
        assert!(evaluate(&boiler_with(Some(Value::Int(50))), &power));
        assert!(!evaluate(&boiler_with(None), &power));
    }

    #[test]
    fn test_range_bounds_are_inclusive() {
        let power = RangeCondition::new("rated_power", 10.0, 100.0).unwrap();
        assert!(power.check(Some(&Value::Float(10.0))));
        assert!(power.check(Some(&Value::Float(100.0))));
        assert!(!power.check(Some(&Value::Float(100.000_001))));
    }

    #[test]
    fn test_range_rejects_null_and_non_numeric() {
        let power = RangeCondition::new("rated_power", 0.0, 1.0).unwrap();
        assert!(!power.check(Some(&Value::Null)));
        assert!(!power.check(Some(&Value::String("0.5".into()))));
        assert!(!power.check(Some(&Value::Bool(true))));
    }

    #[test]
    fn test_range_requires_min_not_above_max() {
        assert!(matches!(
            RangeCondition::new("rated_power", 100.0, 10.0),
            Err(ValidationError::InvalidRange { .. })
        ));
        assert!(RangeCondition::new("rated_power", 5.0, 5.0).is_ok());
        assert!(RangeCondition::new("rated_power", f64::NAN, 5.0).is_err());
    }

    #[test]
    fn test_one_of() {
        let answer = OneOfCondition::new("confirm", vec![Value::from("y")]).unwrap();
        assert!(!answer.check(Some(&Value::Int(1))));
        assert!(!answer.check(Some(&Value::Bool(false))));
        assert!(answer.check(Some(&Value::from("y"))));
        assert!(!answer.check(None));
    }

    #[test]
    fn test_regex() {
        let cond = RegexCondition::new("description", r"^DN\d+$").unwrap();
        assert!(cond.check(Some(&Value::from("DN50"))));
        assert!(!cond.check(Some(&Value::from("DN-50"))));
        assert!(!cond.check(Some(&Value::Int(50))));

        assert!(matches!(
            RegexCondition::new("description", "("),
            Err(ValidationError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_ordered_reads_both_attributes() {
        let cond = OrderedCondition::new("return_temperature", "flow_temperature", true).unwrap();
        let mut boiler = boiler_with(None);
        boiler.set_attribute("flow_temperature", 70.0).unwrap();
        assert!(!cond.evaluate(&boiler));

        boiler.set_attribute("return_temperature", 50.0).unwrap();
        assert!(cond.evaluate(&boiler));

        boiler.set_attribute("return_temperature", 70.0).unwrap();
        assert!(!cond.evaluate(&boiler));

        let lenient = OrderedCondition::new("return_temperature", "flow_temperature", false).unwrap();
        assert!(lenient.evaluate(&boiler));
        assert!(!lenient.check(Some(&Value::Float(1.0))));
    }

    #[test]
    fn test_spec_builds_conditions() {
        let spec: ConditionSpec = serde_json::from_value(serde_json::json!({
            "type": "range",
            "attribute": "rated_power",
            "min": 10.0,
            "max": 100.0
        }))
        .unwrap();
        assert_eq!(spec.attribute(), "rated_power");
        let cond = spec.build().unwrap();
        assert_eq!(cond.to_string(), "range(rated_power: [10, 100])");

        let bad = ConditionSpec::range("rated_power", 2.0, 1.0);
        assert!(bad.build().is_err());
    }
}
