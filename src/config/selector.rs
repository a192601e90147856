//! Structured label/annotation predicates.
//!
//! A [`Requirement`] is evaluated against a metadata map (labels or
//! annotations). The same value renders the Kubernetes `labelSelector` query
//! string for server-side filtering.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ConfigError;

// Qualified name with optional DNS subdomain prefix, as accepted for label and annotation keys.
static KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$")
        .expect("Invalid selector key regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One (key, operator, values) term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Requirement {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Requirement {
            key: key.into(),
            operator: Operator::Equals,
            values: vec![value.into()],
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Requirement {
            key: key.into(),
            operator: Operator::Exists,
            values: Vec::new(),
        }
    }

    pub fn matches(&self, map: &BTreeMap<String, String>) -> bool {
        let value = map.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => {
                value.map_or(false, |v| self.values.iter().any(|want| want == v))
            }
            // Absence satisfies the negative operators, as in Kubernetes selectors.
            Operator::NotEquals | Operator::NotIn => {
                value.map_or(true, |v| self.values.iter().all(|want| want != v))
            }
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !KEY_REGEX.is_match(&self.key) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid selector key: {:?}",
                self.key
            )));
        }
        let arity_ok = match self.operator {
            Operator::Equals | Operator::NotEquals => self.values.len() == 1,
            Operator::In | Operator::NotIn => !self.values.is_empty(),
            Operator::Exists | Operator::DoesNotExist => self.values.is_empty(),
        };
        if !arity_ok {
            return Err(ConfigError::ValidationFailed(format!(
                "Selector {:?} on key {} has {} value(s)",
                self.operator,
                self.key,
                self.values.len()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, self.values.join(",")),
            Operator::NotEquals => write!(f, "{}!={}", self.key, self.values.join(",")),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Which metadata map a marker is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerSource {
    Label,
    Annotation,
}

/// A requirement bound to the metadata map it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerRule {
    pub source: MarkerSource,
    #[serde(flatten)]
    pub requirement: Requirement,
}

impl MarkerRule {
    pub fn annotation(requirement: Requirement) -> Self {
        MarkerRule {
            source: MarkerSource::Annotation,
            requirement,
        }
    }

    pub fn label(requirement: Requirement) -> Self {
        MarkerRule {
            source: MarkerSource::Label,
            requirement,
        }
    }

    pub fn matches(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> bool {
        match self.source {
            MarkerSource::Label => self.requirement.matches(labels),
            MarkerSource::Annotation => self.requirement.matches(annotations),
        }
    }

    /// `labelSelector` value for server-side filtering; only label rules can be pushed down.
    pub fn label_selector(&self) -> Option<String> {
        match self.source {
            MarkerSource::Label => Some(self.requirement.to_string()),
            MarkerSource::Annotation => None,
        }
    }
}

/// Eligibility test shared by the cluster and agent clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentPodFilter {
    pub eligibility: MarkerRule,
    pub opt_out: Option<MarkerRule>,
}

impl ParentPodFilter {
    pub fn is_parent(
        &self,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> bool {
        self.eligibility.matches(labels, annotations)
            && !self
                .opt_out
                .as_ref()
                .map_or(false, |rule| rule.matches(labels, annotations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_equals_and_not_equals() {
        let eq = Requirement::equals("k8s-app", "kube-apiserver");
        assert!(eq.matches(&map(&[("k8s-app", "kube-apiserver")])));
        assert!(!eq.matches(&map(&[("k8s-app", "kube-scheduler")])));
        assert!(!eq.matches(&map(&[])));

        let ne = Requirement {
            key: "tier".into(),
            operator: Operator::NotEquals,
            values: vec!["node".into()],
        };
        assert!(ne.matches(&map(&[])));
        assert!(ne.matches(&map(&[("tier", "control-plane")])));
        assert!(!ne.matches(&map(&[("tier", "node")])));
    }

    #[test]
    fn test_set_operators() {
        let r#in = Requirement {
            key: "component".into(),
            operator: Operator::In,
            values: vec!["apiserver".into(), "scheduler".into()],
        };
        assert!(r#in.matches(&map(&[("component", "scheduler")])));
        assert!(!r#in.matches(&map(&[("component", "proxy")])));

        let not_in = Requirement {
            operator: Operator::NotIn,
            ..r#in.clone()
        };
        assert!(not_in.matches(&map(&[("component", "proxy")])));
        assert!(!not_in.matches(&map(&[("component", "apiserver")])));
    }

    #[test]
    fn test_existence_operators() {
        let exists = Requirement::exists("checkpointer.alpha.coreos.com/checkpoint");
        assert!(exists.matches(&map(&[("checkpointer.alpha.coreos.com/checkpoint", "")])));
        let absent = Requirement {
            operator: Operator::DoesNotExist,
            ..exists.clone()
        };
        assert!(absent.matches(&map(&[])));
        assert!(!absent.matches(&map(&[("checkpointer.alpha.coreos.com/checkpoint", "")])));
    }

    #[test]
    fn test_display_renders_selector_syntax() {
        assert_eq!(Requirement::equals("a", "b").to_string(), "a=b");
        assert_eq!(Requirement::exists("a").to_string(), "a");
        let r = Requirement {
            key: "a".into(),
            operator: Operator::NotIn,
            values: vec!["x".into(), "y".into()],
        };
        assert_eq!(r.to_string(), "a notin (x,y)");
    }

    #[test]
    fn test_validate() {
        assert!(Requirement::equals("checkpointer.alpha.coreos.com/checkpoint", "true")
            .validate()
            .is_ok());
        assert!(Requirement::equals("bad key", "x").validate().is_err());
        let missing_value = Requirement {
            key: "a".into(),
            operator: Operator::Equals,
            values: vec![],
        };
        assert!(missing_value.validate().is_err());
    }

    #[test]
    fn test_filter_with_opt_out() {
        let filter = ParentPodFilter {
            eligibility: MarkerRule::annotation(Requirement::equals("checkpoint", "true")),
            opt_out: Some(MarkerRule::label(Requirement::exists("no-checkpoint"))),
        };
        let annotations = map(&[("checkpoint", "true")]);
        assert!(filter.is_parent(&map(&[]), &annotations));
        assert!(!filter.is_parent(&map(&[("no-checkpoint", "")]), &annotations));
        assert!(!filter.is_parent(&map(&[]), &map(&[])));
    }

    #[test]
    fn test_label_selector_pushdown() {
        let label = MarkerRule::label(Requirement::equals("checkpoint", "true"));
        assert_eq!(label.label_selector().as_deref(), Some("checkpoint=true"));
        let annotation = MarkerRule::annotation(Requirement::equals("checkpoint", "true"));
        assert_eq!(annotation.label_selector(), None);
    }

    #[test]
    fn test_marker_rule_serde_flatten() {
        let rule: MarkerRule = serde_json::from_str(
            r#"{"source":"annotation","key":"checkpointer.alpha.coreos.com/checkpoint","operator":"equals","values":["true"]}"#,
        )
        .unwrap();
        assert_eq!(rule.source, MarkerSource::Annotation);
        assert_eq!(rule.requirement.operator, Operator::Equals);
    }
}
