//! Workload selector projection and evaluation
//!
//! A workload's placement selector is projected into `selector/*` labels on
//! the workload itself. Those labels act as a reverse index: given a device,
//! [`device_lookup_keys`] produces the keys under which every workload that
//! could possibly match it is indexed ([`workload_index_keys`]). Candidates
//! are then confirmed with [`matches_device`].
//!
//! An empty selector (no `matchLabels`, no `matchExpressions`) projects to
//! nothing and matches nothing.
//!
//! Selector keys carrying a prefix (`kubernetes.io/arch`) cannot be nested
//! under `selector/` as-is; [`projection_key`] folds the `/` into a `.`.
//! Keys that still do not fit a label name fall back to the shared
//! `doesnotexist` sentinel, which every device lookup includes.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::edge_workload::EdgeWorkloadSpec;
use crate::labels::{
    LABEL_TRUE, MAX_LABEL_VALUE_LEN, SELECTOR_DEVICE_NAME_KEY, SELECTOR_DOES_NOT_EXIST_KEY,
    SELECTOR_LABEL_PREFIX, selector_label,
};

/// Selector errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unsupported selector operator {operator:?} for key {key:?}")]
    UnsupportedOperator { key: String, operator: String },

    #[error("operator {operator} on key {key:?} requires at least one value")]
    MissingValues { key: String, operator: String },
}

/// Selector operators understood by the evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl Operator {
    fn parse(req: &LabelSelectorRequirement) -> Result<Self, SelectorError> {
        match req.operator.as_str() {
            "In" => Ok(Self::In),
            "NotIn" => Ok(Self::NotIn),
            "Exists" => Ok(Self::Exists),
            "DoesNotExist" => Ok(Self::DoesNotExist),
            other => Err(SelectorError::UnsupportedOperator {
                key: req.key.clone(),
                operator: other.to_string(),
            }),
        }
    }

    /// Operators that can match a device lacking the key
    fn is_negative(self) -> bool {
        matches!(self, Self::NotIn | Self::DoesNotExist)
    }
}

/// Returns true if `s` is usable as a label name or value
fn is_label_token(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_LABEL_VALUE_LEN
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && s.starts_with(|c: char| c.is_ascii_alphanumeric())
        && s.ends_with(|c: char| c.is_ascii_alphanumeric())
}

/// Key under `selector/` standing for a device label key
///
/// `kubernetes.io/arch` becomes `kubernetes.io.arch`. Keys that do not fit
/// a label name map to the `doesnotexist` sentinel. Two label keys may
/// share a projection key; candidates are confirmed by the evaluator.
pub fn projection_key(label_key: &str) -> String {
    let folded = label_key.replace('/', ".");
    if is_label_token(&folded) {
        folded
    } else {
        SELECTOR_DOES_NOT_EXIST_KEY.to_string()
    }
}

/// Project a workload's placement into its `selector/*` labels
pub fn project(spec: &EdgeWorkloadSpec) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();

    if let Some(device) = spec.device.as_deref().filter(|d| !d.is_empty()) {
        if is_label_token(device) {
            labels.insert(selector_label(SELECTOR_DEVICE_NAME_KEY), device.to_string());
        } else {
            labels.insert(selector_label(SELECTOR_DOES_NOT_EXIST_KEY), LABEL_TRUE.to_string());
        }
        return labels;
    }

    let Some(selector) = &spec.device_selector else {
        return labels;
    };

    for key in selector.match_labels.iter().flatten().map(|(k, _)| k) {
        labels.insert(selector_label(&projection_key(key)), LABEL_TRUE.to_string());
    }

    for req in selector.match_expressions.iter().flatten() {
        // Unknown operators project like a positive requirement; the
        // evaluator rejects them later.
        let negative = Operator::parse(req).is_ok_and(Operator::is_negative);
        let key = if negative {
            SELECTOR_DOES_NOT_EXIST_KEY.to_string()
        } else {
            projection_key(&req.key)
        };
        labels.insert(selector_label(&key), LABEL_TRUE.to_string());
    }

    labels
}

/// Label changes that bring `current` in line with `projected`
///
/// Returns a merge-patch style map (`None` deletes) touching only
/// `selector/*` keys, or `None` when nothing needs to change.
pub fn projection_patch(
    current: &BTreeMap<String, String>,
    projected: &BTreeMap<String, String>,
) -> Option<BTreeMap<String, Option<String>>> {
    let mut patch = BTreeMap::new();

    for (k, v) in projected {
        if current.get(k) != Some(v) {
            patch.insert(k.clone(), Some(v.clone()));
        }
    }
    for k in current.keys() {
        if k.starts_with(SELECTOR_LABEL_PREFIX) && !projected.contains_key(k) {
            patch.insert(k.clone(), None);
        }
    }

    (!patch.is_empty()).then_some(patch)
}

/// Key of the `WorkloadByDevice` index
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKey {
    /// Workloads pinned to this device name
    Device(String),
    /// Workloads whose selector names this projection key
    Label(String),
}

impl IndexKey {
    /// Label-selector query returning the workloads indexed under this key
    pub fn query(&self) -> String {
        match self {
            Self::Device(name) => format!("{}={name}", selector_label(SELECTOR_DEVICE_NAME_KEY)),
            Self::Label(key) => selector_label(key),
        }
    }
}

/// Index keys contributed by a workload's projection labels
///
/// The device name for `selector/devicename`, otherwise the bare key.
pub fn workload_index_keys(labels: &BTreeMap<String, String>) -> Vec<IndexKey> {
    let keys: BTreeSet<IndexKey> = labels
        .iter()
        .filter_map(|(k, v)| {
            let key = k.strip_prefix(SELECTOR_LABEL_PREFIX)?;
            Some(if key == SELECTOR_DEVICE_NAME_KEY {
                IndexKey::Device(v.clone())
            } else {
                IndexKey::Label(key.to_string())
            })
        })
        .collect();
    keys.into_iter().collect()
}

/// Index keys to look up every workload that may match a device
pub fn device_lookup_keys(name: &str, labels: &BTreeMap<String, String>) -> Vec<IndexKey> {
    let mut keys = BTreeSet::new();
    if is_label_token(name) {
        keys.insert(IndexKey::Device(name.to_string()));
    }
    keys.extend(labels.keys().map(|k| IndexKey::Label(projection_key(k))));
    keys.insert(IndexKey::Label(SELECTOR_DOES_NOT_EXIST_KEY.to_string()));
    keys.into_iter().collect()
}

/// Returns true if the selector has neither labels nor expressions
pub fn is_empty_selector(selector: &LabelSelector) -> bool {
    selector.match_labels.as_ref().is_none_or(BTreeMap::is_empty)
        && selector.match_expressions.as_ref().is_none_or(Vec::is_empty)
}

/// Evaluate a label selector against a label set
///
/// An empty selector matches nothing.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    if is_empty_selector(selector) {
        return Ok(false);
    }

    for (k, v) in selector.match_labels.iter().flatten() {
        if labels.get(k) != Some(v) {
            return Ok(false);
        }
    }

    for req in selector.match_expressions.iter().flatten() {
        if !requirement_matches(req, labels)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Check that every requirement can be evaluated
pub fn validate(selector: &LabelSelector) -> Result<(), SelectorError> {
    for req in selector.match_expressions.iter().flatten() {
        checked_operator(req)?;
    }
    Ok(())
}

fn checked_operator(req: &LabelSelectorRequirement) -> Result<Operator, SelectorError> {
    let op = Operator::parse(req)?;
    if matches!(op, Operator::In | Operator::NotIn) && req.values.as_ref().is_none_or(Vec::is_empty) {
        return Err(SelectorError::MissingValues {
            key: req.key.clone(),
            operator: req.operator.clone(),
        });
    }
    Ok(op)
}

fn requirement_matches(
    req: &LabelSelectorRequirement,
    labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    let op = checked_operator(req)?;
    let values = req.values.as_deref().unwrap_or_default();

    let current = labels.get(&req.key);
    Ok(match op {
        Operator::In => current.is_some_and(|v| values.contains(v)),
        Operator::NotIn => current.is_none_or(|v| !values.contains(v)),
        Operator::Exists => current.is_some(),
        Operator::DoesNotExist => current.is_none(),
    })
}

/// Returns true if the workload should run on the device
pub fn matches_device(
    spec: &EdgeWorkloadSpec,
    device_name: &str,
    device_labels: &BTreeMap<String, String>,
) -> Result<bool, SelectorError> {
    if let Some(device) = spec.device.as_deref().filter(|d| !d.is_empty()) {
        return Ok(device == device_name);
    }
    match &spec.device_selector {
        Some(selector) => selector_matches(selector, device_labels),
        None => Ok(false),
    }
}

/// Render a selector in the API server's `labelSelector` query syntax
pub fn to_query_string(selector: &LabelSelector) -> Result<String, SelectorError> {
    let mut parts = Vec::new();

    for (k, v) in selector.match_labels.iter().flatten() {
        parts.push(format!("{k}={v}"));
    }
    for req in selector.match_expressions.iter().flatten() {
        let values = req.values.as_deref().unwrap_or_default().join(",");
        parts.push(match Operator::parse(req)? {
            Operator::In => format!("{} in ({values})", req.key),
            Operator::NotIn => format!("{} notin ({values})", req.key),
            Operator::Exists => req.key.clone(),
            Operator::DoesNotExist => format!("!{}", req.key),
        });
    }

    Ok(parts.join(","))
}
