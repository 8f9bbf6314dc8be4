//! Shape/type checks for dot-path configuration entries.
//!
//! Rules are keyed by a pattern such as `kafka.connections.*.brokers`, where
//! `*` matches exactly one path segment.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use jobline_core::{QueueError, QueueResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ValueType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Number => value.is_number(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Array => "array",
            ValueType::Object => "object",
        }
    }
}

/// Constraints for every key matching `pattern`.
///
/// `min`/`max` bound numeric values, and the length of strings and arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pattern: String,
    required: bool,
    value_type: Option<ValueType>,
    one_of: Vec<Value>,
    min: Option<f64>,
    max: Option<f64>,
}

impl Rule {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            required: false,
            value_type: None,
            one_of: Vec::new(),
            min: None,
            max: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn of_type(mut self, value_type: ValueType) -> Self {
        self.value_type = Some(value_type);
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.one_of = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, key: &str) -> bool {
        pattern_matches(&self.pattern, key)
    }

    fn check(&self, key: &str, value: &Value) -> Result<(), String> {
        if let Some(expected) = self.value_type {
            if !expected.matches(value) {
                return Err(format!("{key}: expected {}, got {value}", expected.as_str()));
            }
        }

        if !self.one_of.is_empty() && !self.one_of.contains(value) {
            let allowed: Vec<String> = self.one_of.iter().map(Value::to_string).collect();
            return Err(format!("{key}: {value} is not one of [{}]", allowed.join(", ")));
        }

        let measured = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => Some(s.chars().count() as f64),
            Value::Array(a) => Some(a.len() as f64),
            _ => None,
        };
        if let Some(m) = measured {
            if let Some(min) = self.min.filter(|min| m < *min) {
                return Err(format!("{key}: {value} is below the minimum {min}"));
            }
            if let Some(max) = self.max.filter(|max| m > *max) {
                return Err(format!("{key}: {value} is above the maximum {max}"));
            }
        }
        Ok(())
    }
}

/// `*` matches one segment; segment counts must agree.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let mut pattern_segments = pattern.split('.');
    let mut key_segments = key.split('.');
    loop {
        match (pattern_segments.next(), key_segments.next()) {
            (None, None) => return true,
            (Some(p), Some(k)) if p == "*" || p == k => continue,
            _ => return false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub message: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
        }
    }

    pub fn into_result(self) -> QueueResult<()> {
        if self.valid {
            Ok(())
        } else {
            Err(QueueError::config(
                self.message.unwrap_or_else(|| "validation failed".into()),
            ))
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigValidator {
    rules: Vec<Rule>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Check one entry against every rule whose pattern matches `key`.
    pub fn validate_value(&self, key: &str, value: &Value) -> ValidationResult {
        for rule in self.rules.iter().filter(|r| r.matches(key)) {
            if let Err(message) = rule.check(key, value) {
                return ValidationResult::invalid(message);
            }
        }
        ValidationResult::ok()
    }

    /// Check a full set of entries: every present key against its rules, and
    /// every required pattern against at least one present key.
    pub fn validate(&self, entries: &BTreeMap<String, Value>) -> ValidationResult {
        for rule in self.rules.iter().filter(|r| r.required) {
            if !entries.keys().any(|k| rule.matches(k)) {
                return ValidationResult::invalid(format!("{}: required", rule.pattern));
            }
        }
        for (key, value) in entries {
            let result = self.validate_value(key, value);
            if !result.valid {
                return result;
            }
        }
        ValidationResult::ok()
    }

    /// Rules for the `kafka.connections.<name>.*` subtree.
    pub fn connector_rules() -> Self {
        const P: &str = "kafka.connections.*";
        let positive_int = |field: &str| {
            Rule::new(format!("{P}.{field}"))
                .of_type(ValueType::Integer)
                .min(1.0)
        };

        Self::new()
            .with_rule(
                Rule::new(format!("{P}.brokers"))
                    .required()
                    .of_type(ValueType::String)
                    .min(1.0),
            )
            .with_rule(
                Rule::new(format!("{P}.default_queue"))
                    .required()
                    .of_type(ValueType::String)
                    .min(1.0)
                    .max(249.0),
            )
            .with_rule(
                Rule::new(format!("{P}.group_id"))
                    .of_type(ValueType::String)
                    .min(1.0),
            )
            .with_rule(
                Rule::new(format!("{P}.compression"))
                    .one_of(["none", "gzip", "snappy", "lz4", "zstd"]),
            )
            .with_rule(Rule::new(format!("{P}.acks")).one_of(["0", "1", "all", "-1"]))
            .with_rule(
                Rule::new(format!("{P}.batch_size"))
                    .of_type(ValueType::Integer)
                    .min(0.0),
            )
            .with_rule(
                Rule::new(format!("{P}.linger_ms"))
                    .of_type(ValueType::Integer)
                    .min(0.0),
            )
            .with_rule(
                Rule::new(format!("{P}.max_attempts"))
                    .of_type(ValueType::Integer)
                    .min(0.0)
                    .max(100.0),
            )
            .with_rule(positive_int("poll_timeout_ms"))
            .with_rule(positive_int("flush_timeout_ms"))
            .with_rule(positive_int("transaction_timeout_ms"))
            .with_rule(positive_int("max_backoff_secs"))
            .with_rule(positive_int("rebalance_interval_secs"))
            .with_rule(positive_int("consumer_ttl_secs"))
            .with_rule(positive_int("idempotency_ttl_secs"))
            .with_rule(positive_int("topic_partitions"))
            .with_rule(positive_int("replication_factor"))
            .with_rule(
                Rule::new(format!("{P}.auto_create_topics")).of_type(ValueType::Boolean),
            )
            .with_rule(
                Rule::new(format!("{P}.pool.min_connections"))
                    .of_type(ValueType::Integer)
                    .min(0.0),
            )
            .with_rule(positive_int("pool.max_connections"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcard_matches_exactly_one_segment() {
        assert!(pattern_matches("kafka.connections.*.brokers", "kafka.connections.main.brokers"));
        assert!(!pattern_matches("kafka.connections.*.brokers", "kafka.connections.brokers"));
        assert!(!pattern_matches(
            "kafka.connections.*.brokers",
            "kafka.connections.a.b.brokers"
        ));
        assert!(pattern_matches("a.b", "a.b"));
        assert!(!pattern_matches("a.b", "a.b.c"));
    }

    #[test]
    fn type_enum_and_range_checks() {
        let v = ConfigValidator::connector_rules();

        assert!(v.validate_value("kafka.connections.k.max_attempts", &json!(3)).valid);

        let bad_type = v.validate_value("kafka.connections.k.max_attempts", &json!("3"));
        assert!(!bad_type.valid);
        assert!(bad_type.message.unwrap().contains("expected integer"));

        let bad_enum = v.validate_value("kafka.connections.k.compression", &json!("brotli"));
        assert!(!bad_enum.valid);

        let too_small = v.validate_value("kafka.connections.k.poll_timeout_ms", &json!(0));
        assert!(too_small.message.unwrap().contains("below the minimum"));

        // Unmatched keys are accepted as-is.
        assert!(v
            .validate_value("kafka.connections.k.consumer.session.timeout.ms", &json!("6000"))
            .valid);
    }

    #[test]
    fn required_patterns_must_be_present() {
        let v = ConfigValidator::connector_rules();
        let mut entries = BTreeMap::new();
        entries.insert("kafka.connections.k.default_queue".to_string(), json!("mail"));

        let result = v.validate(&entries);
        assert!(!result.valid);
        assert_eq!(
            result.message.as_deref(),
            Some("kafka.connections.*.brokers: required")
        );

        entries.insert("kafka.connections.k.brokers".to_string(), json!("localhost:9092"));
        assert!(v.validate(&entries).valid);
    }

    #[test]
    fn invalid_result_converts_to_fatal_error() {
        let err = ValidationResult::invalid("nope").into_result().unwrap_err();
        assert!(err.is_fatal());
        assert!(ValidationResult::ok().into_result().is_ok());
    }
}
