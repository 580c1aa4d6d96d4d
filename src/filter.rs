//! Filter expression trees and their evaluation.
//!
//! A filter is a tree of [`FilterGroup`] nodes (AND/OR with optional
//! negation) whose leaves are [`FilterRule`] predicates. Trees arrive as JSON
//! and are discriminated structurally: a node with `logic` and `rules` is a
//! group, a node with `operator` is a rule.
//!
//! Two evaluation paths share the same rule semantics:
//!
//! - [`evaluate`] is total. It never fails, treating unknown fields as
//!   missing values and unknown operators as non-matching.
//! - [`CompiledFilter`] validates the whole tree once against a dataset's
//!   columns, then evaluates records without any error branches. Bulk
//!   materialization always goes through this path.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Bound,
};

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{
    data::{coerce_date, coerce_number, is_blank, json_to_date, json_to_number, json_to_text},
    error::{EngineError, EngineResult, IssueKind, ValidationIssue},
    schema::{Column, ColumnType},
    source::RecordView,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
    Between,
    IsEmpty,
    IsNotEmpty,
    InCohort,
    NotInCohort,
    /// Operator name not recognised; rejected by validation.
    Unknown(String),
}

const NUMERIC_OR_DATE: &[ColumnType] = &[ColumnType::Number, ColumnType::Date];
const STRING_ONLY: &[ColumnType] = &[ColumnType::String];

impl Operator {
    pub fn parse(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "equals" | "eq" => Operator::Equals,
            "not_equals" | "neq" => Operator::NotEquals,
            "contains" => Operator::Contains,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "between" => Operator::Between,
            "is_empty" => Operator::IsEmpty,
            "is_not_empty" => Operator::IsNotEmpty,
            "in_cohort" => Operator::InCohort,
            "not_in_cohort" => Operator::NotInCohort,
            _ => Operator::Unknown(token.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Contains => "contains",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Between => "between",
            Operator::IsEmpty => "is_empty",
            Operator::IsNotEmpty => "is_not_empty",
            Operator::InCohort => "in_cohort",
            Operator::NotInCohort => "not_in_cohort",
            Operator::Unknown(token) => token,
        }
    }

    /// Column types this operator may be applied to; `None` means any.
    pub fn compatible_types(&self) -> Option<&'static [ColumnType]> {
        match self {
            Operator::Contains => Some(STRING_ONLY),
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte | Operator::Between => {
                Some(NUMERIC_OR_DATE)
            }
            _ => None,
        }
    }

    pub fn accepts(&self, column_type: ColumnType) -> bool {
        self.compatible_types()
            .is_none_or(|types| types.contains(&column_type))
    }

    /// Cohort membership operators test the patient id, not a field.
    pub fn is_cohort_membership(&self) -> bool {
        matches!(self, Operator::InCohort | Operator::NotInCohort)
    }

    fn needs_value(&self) -> bool {
        !matches!(self, Operator::IsEmpty | Operator::IsNotEmpty)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Operator {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        Ok(Operator::parse(&token))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub field: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub value: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<JsonValue>,
}

impl FilterRule {
    pub fn new(field: impl Into<String>, operator: Operator, value: JsonValue) -> Self {
        Self {
            id: String::new(),
            field: field.into(),
            operator,
            value,
            value2: None,
        }
    }

    pub fn between(field: impl Into<String>, low: JsonValue, high: JsonValue) -> Self {
        Self {
            value2: Some(high),
            ..Self::new(field, Operator::Between, low)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(default)]
    pub id: String,
    pub logic: Logic,
    #[serde(default)]
    pub negate: bool,
    pub rules: Vec<FilterNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterNode {
    Group(FilterGroup),
    Rule(FilterRule),
}

impl<'de> Deserialize<'de> for FilterNode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = JsonValue::deserialize(deserializer)?;
        node_from_json(value).map_err(serde::de::Error::custom)
    }
}

/// Discriminates a node by its keys so a malformed one is reported by name.
fn node_from_json(value: JsonValue) -> Result<FilterNode, String> {
    let JsonValue::Object(map) = &value else {
        return Err(format!("filter node must be an object, found {value}"));
    };
    let label = match map.get("id").and_then(JsonValue::as_str) {
        Some(id) if !id.is_empty() => format!(" '{id}'"),
        _ => String::new(),
    };
    if map.contains_key("logic") || map.contains_key("rules") {
        if let Some(key) = ["logic", "rules"].into_iter().find(|key| !map.contains_key(*key)) {
            return Err(format!("filter group{label} is missing required key '{key}'"));
        }
        return serde_json::from_value(value)
            .map(FilterNode::Group)
            .map_err(|err| format!("filter group{label}: {err}"));
    }
    if !map.contains_key("operator") {
        let mut keys = map.keys().map(String::as_str).collect::<Vec<_>>();
        keys.sort_unstable();
        let found = keys.join(", ");
        return Err(format!(
            "filter rule{label} is missing required key 'operator' (found: {found})"
        ));
    }
    serde_json::from_value(value)
        .map(FilterNode::Rule)
        .map_err(|err| format!("filter rule{label}: {err}"))
}

impl From<FilterRule> for FilterNode {
    fn from(rule: FilterRule) -> Self {
        FilterNode::Rule(rule)
    }
}

impl From<FilterGroup> for FilterNode {
    fn from(group: FilterGroup) -> Self {
        FilterNode::Group(group)
    }
}

impl FilterGroup {
    pub fn new(logic: Logic, rules: Vec<FilterNode>) -> Self {
        Self {
            id: String::new(),
            logic,
            negate: false,
            rules,
        }
    }

    pub fn and(rules: Vec<FilterNode>) -> Self {
        Self::new(Logic::And, rules)
    }

    pub fn or(rules: Vec<FilterNode>) -> Self {
        Self::new(Logic::Or, rules)
    }

    /// The empty group, which matches every record.
    pub fn match_all() -> Self {
        Self::and(Vec::new())
    }

    pub fn negated(mut self) -> Self {
        self.negate = !self.negate;
        self
    }

    /// Leaf rules in depth-first order.
    pub fn leaf_rules(&self) -> Vec<&FilterRule> {
        let mut out = Vec::new();
        collect_rules(self, &mut out);
        out
    }

    pub fn rule_count(&self) -> usize {
        self.rules
            .iter()
            .map(|node| match node {
                FilterNode::Rule(_) => 1,
                FilterNode::Group(group) => group.rule_count(),
            })
            .sum()
    }

    /// Dataset fields the tree reads, excluding cohort membership rules.
    pub fn referenced_fields(&self) -> BTreeSet<String> {
        self.leaf_rules()
            .into_iter()
            .filter(|rule| !rule.operator.is_cohort_membership())
            .map(|rule| rule.field.clone())
            .collect()
    }

    /// Operators applied to each referenced field.
    pub fn operators_by_field(&self) -> BTreeMap<String, BTreeSet<Operator>> {
        let mut map: BTreeMap<String, BTreeSet<Operator>> = BTreeMap::new();
        for rule in self.leaf_rules() {
            if rule.operator.is_cohort_membership() {
                continue;
            }
            map.entry(rule.field.clone())
                .or_default()
                .insert(rule.operator.clone());
        }
        map
    }

    /// Cohort ids named by `in_cohort` / `not_in_cohort` rules.
    pub fn referenced_cohorts(&self) -> BTreeSet<String> {
        self.leaf_rules()
            .into_iter()
            .filter(|rule| rule.operator.is_cohort_membership())
            .filter_map(|rule| rule.value.as_str().map(str::to_string))
            .collect()
    }

    /// Rewrites rule fields through `rename`, leaving unmapped fields alone.
    pub fn rename_fields(&mut self, rename: &BTreeMap<String, String>) {
        for node in &mut self.rules {
            match node {
                FilterNode::Rule(rule) => {
                    if rule.operator.is_cohort_membership() {
                        continue;
                    }
                    if let Some(target) = rename.get(&rule.field) {
                        rule.field = target.clone();
                    }
                }
                FilterNode::Group(group) => group.rename_fields(rename),
            }
        }
    }

    /// Gives every group and rule without an id a fresh one.
    pub fn assign_missing_ids(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        for node in &mut self.rules {
            match node {
                FilterNode::Rule(rule) if rule.id.is_empty() => {
                    rule.id = Uuid::new_v4().to_string();
                }
                FilterNode::Rule(_) => {}
                FilterNode::Group(group) => group.assign_missing_ids(),
            }
        }
    }

    /// Structural equality that ignores group and rule ids.
    pub fn same_shape(&self, other: &FilterGroup) -> bool {
        self.logic == other.logic
            && self.negate == other.negate
            && self.rules.len() == other.rules.len()
            && self.rules.iter().zip(&other.rules).all(|pair| match pair {
                (FilterNode::Rule(a), FilterNode::Rule(b)) => {
                    a.field == b.field
                        && a.operator == b.operator
                        && a.value == b.value
                        && a.value2 == b.value2
                }
                (FilterNode::Group(a), FilterNode::Group(b)) => a.same_shape(b),
                _ => false,
            })
    }

    /// Carries ids from `previous` onto id-less groups and rules.
    ///
    /// A rule takes the id of the earlier rule at the same depth-first
    /// position when both name the same field, otherwise the first unclaimed
    /// earlier rule on that field. Groups inherit positionally.
    pub fn inherit_ids(&mut self, previous: &FilterGroup) {
        let mut claimed: BTreeSet<String> = self
            .leaf_rules()
            .into_iter()
            .filter(|rule| !rule.id.is_empty())
            .map(|rule| rule.id.clone())
            .collect();
        let earlier = previous.leaf_rules();
        let mut position = 0;
        inherit_rule_ids(self, &earlier, &mut claimed, &mut position);
        inherit_group_ids(self, previous);
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|err| anyhow!("Invalid filter JSON: {err}"))
    }
}

fn inherit_rule_ids(
    group: &mut FilterGroup,
    earlier: &[&FilterRule],
    claimed: &mut BTreeSet<String>,
    position: &mut usize,
) {
    for node in &mut group.rules {
        let rule = match node {
            FilterNode::Group(child) => {
                inherit_rule_ids(child, earlier, claimed, position);
                continue;
            }
            FilterNode::Rule(rule) => rule,
        };
        let at = *position;
        *position += 1;
        if !rule.id.is_empty() {
            continue;
        }
        let inherited = {
            let free = |candidate: &&&FilterRule| {
                !candidate.id.is_empty()
                    && candidate.field == rule.field
                    && !claimed.contains(&candidate.id)
            };
            earlier
                .get(at)
                .filter(free)
                .or_else(|| earlier.iter().find(free))
                .map(|candidate| candidate.id.clone())
        };
        if let Some(id) = inherited {
            claimed.insert(id.clone());
            rule.id = id;
        }
    }
}

fn inherit_group_ids(group: &mut FilterGroup, previous: &FilterGroup) {
    if group.id.is_empty() {
        group.id = previous.id.clone();
    }
    let earlier = previous.rules.iter().filter_map(|node| match node {
        FilterNode::Group(child) => Some(child),
        FilterNode::Rule(_) => None,
    });
    let later = group.rules.iter_mut().filter_map(|node| match node {
        FilterNode::Group(child) => Some(child),
        FilterNode::Rule(_) => None,
    });
    for (child, before) in later.zip(earlier) {
        inherit_group_ids(child, before);
    }
}

fn collect_rules<'a>(group: &'a FilterGroup, out: &mut Vec<&'a FilterRule>) {
    for node in &group.rules {
        match node {
            FilterNode::Rule(rule) => out.push(rule),
            FilterNode::Group(child) => collect_rules(child, out),
        }
    }
}

/// Membership sets of cohorts that `in_cohort` rules may reference.
pub trait CohortLookup {
    fn members(&self, cohort_id: &str) -> Option<&BTreeSet<String>>;
}

/// Lookup with no cohorts available.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCohorts;

impl CohortLookup for NoCohorts {
    fn members(&self, _cohort_id: &str) -> Option<&BTreeSet<String>> {
        None
    }
}

impl CohortLookup for BTreeMap<String, BTreeSet<String>> {
    fn members(&self, cohort_id: &str) -> Option<&BTreeSet<String>> {
        self.get(cohort_id)
    }
}

/// Column types and cohort memberships a tree is evaluated against.
#[derive(Clone, Copy)]
pub struct EvalContext<'a> {
    pub columns: &'a [Column],
    pub cohorts: &'a dyn CohortLookup,
}

impl<'a> EvalContext<'a> {
    pub fn new(columns: &'a [Column], cohorts: &'a dyn CohortLookup) -> Self {
        Self { columns, cohorts }
    }

    fn column_type(&self, field: &str) -> Option<ColumnType> {
        self.columns
            .iter()
            .find(|c| c.name == field)
            .map(|c| c.column_type)
    }
}

/// Evaluates `node` against one record.
///
/// Total over any tree: a field the record lacks reads as empty, a field
/// absent from the columns is compared as text, and an unknown operator
/// never matches. An empty group matches every record before negation.
pub fn evaluate(record: &dyn RecordView, node: &FilterNode, ctx: &EvalContext<'_>) -> bool {
    match node {
        FilterNode::Group(group) => evaluate_group(record, group, ctx),
        FilterNode::Rule(rule) => {
            let column_type = ctx.column_type(&rule.field).unwrap_or(ColumnType::String);
            Predicate::from_rule(rule, column_type, ctx.cohorts).test(record, &rule.field)
        }
    }
}

pub fn evaluate_group(record: &dyn RecordView, group: &FilterGroup, ctx: &EvalContext<'_>) -> bool {
    let combined = match group.logic {
        Logic::And => group.rules.iter().all(|node| evaluate(record, node, ctx)),
        Logic::Or => {
            group.rules.is_empty() || group.rules.iter().any(|node| evaluate(record, node, ctx))
        }
    };
    combined != group.negate
}

/// Every problem in `group` relative to `columns` and the available cohorts.
pub fn validate(
    group: &FilterGroup,
    columns: &[Column],
    cohorts: &dyn CohortLookup,
) -> Vec<ValidationIssue> {
    group
        .leaf_rules()
        .into_iter()
        .flat_map(|rule| validate_rule(rule, columns, cohorts))
        .collect()
}

fn validate_rule(
    rule: &FilterRule,
    columns: &[Column],
    cohorts: &dyn CohortLookup,
) -> Vec<ValidationIssue> {
    let issue =
        |kind| ValidationIssue::new(Some(rule.id.as_str()), Some(rule.field.as_str()), kind);
    let op = &rule.operator;
    if let Operator::Unknown(token) = op {
        return vec![issue(IssueKind::UnknownOperator(token.clone()))];
    }
    if op.is_cohort_membership() {
        return match rule.value.as_str() {
            None => vec![issue(IssueKind::MissingValue(op.to_string()))],
            Some(id) if cohorts.members(id).is_none() => {
                vec![issue(IssueKind::UnknownCohort(id.to_string()))]
            }
            Some(_) => Vec::new(),
        };
    }
    let Some(column) = columns.iter().find(|c| c.name == rule.field) else {
        return vec![issue(IssueKind::UnknownField)];
    };
    if !op.accepts(column.column_type) {
        return vec![issue(IssueKind::IncompatibleType {
            operator: op.to_string(),
            expected: op.compatible_types().unwrap_or_default().to_vec(),
            actual: column.column_type,
        })];
    }
    if !op.needs_value() {
        return Vec::new();
    }

    let mut issues = Vec::new();
    let mut operands = vec![&rule.value];
    if *op == Operator::Between {
        match &rule.value2 {
            Some(upper) if !upper.is_null() => operands.push(upper),
            _ => issues.push(issue(IssueKind::MissingSecondValue)),
        }
    }
    for operand in operands {
        if operand.is_null() {
            issues.push(issue(IssueKind::MissingValue(op.to_string())));
            continue;
        }
        let text = json_to_text(operand).unwrap_or_default();
        match column.column_type {
            ColumnType::Number if json_to_number(operand).is_none() => {
                issues.push(issue(IssueKind::NonNumericValue(text)));
            }
            ColumnType::Date if json_to_date(operand).is_none() => {
                issues.push(issue(IssueKind::InvalidDate(text)));
            }
            _ => {}
        }
    }
    issues
}

/// A rule with its operands parsed for one column type.
#[derive(Debug, Clone)]
enum Predicate<'a> {
    TextEquals { target: String, negate: bool },
    NumberEquals { target: f64, negate: bool },
    DateEquals { target: NaiveDate, negate: bool },
    Contains { needle: String },
    NumberRange { lower: Bound<f64>, upper: Bound<f64> },
    DateRange { lower: Bound<NaiveDate>, upper: Bound<NaiveDate> },
    Empty { negate: bool },
    Member { members: Option<&'a BTreeSet<String>>, negate: bool },
    Never,
}

impl<'a> Predicate<'a> {
    fn from_rule(rule: &FilterRule, column_type: ColumnType, cohorts: &'a dyn CohortLookup) -> Self {
        let negate = matches!(rule.operator, Operator::NotEquals);
        match &rule.operator {
            Operator::Equals | Operator::NotEquals => {
                equality_predicate(&rule.value, column_type, negate)
            }
            Operator::Contains => Predicate::Contains {
                needle: json_to_text(&rule.value).unwrap_or_default().to_lowercase(),
            },
            Operator::Gt => range_predicate(column_type, Some((&rule.value, false)), None),
            Operator::Gte => range_predicate(column_type, Some((&rule.value, true)), None),
            Operator::Lt => range_predicate(column_type, None, Some((&rule.value, false))),
            Operator::Lte => range_predicate(column_type, None, Some((&rule.value, true))),
            Operator::Between => match &rule.value2 {
                Some(upper) => range_predicate(
                    column_type,
                    Some((&rule.value, true)),
                    Some((upper, true)),
                ),
                None => Predicate::Never,
            },
            Operator::IsEmpty => Predicate::Empty { negate: false },
            Operator::IsNotEmpty => Predicate::Empty { negate: true },
            Operator::InCohort | Operator::NotInCohort => Predicate::Member {
                members: rule.value.as_str().and_then(|id| cohorts.members(id)),
                negate: rule.operator == Operator::NotInCohort,
            },
            Operator::Unknown(_) => Predicate::Never,
        }
    }

    fn test(&self, record: &dyn RecordView, field: &str) -> bool {
        match self {
            Predicate::Member { members, negate } => {
                let present = match (members, record.patient_id()) {
                    (Some(set), Some(id)) => set.contains(id),
                    _ => false,
                };
                present != *negate
            }
            Predicate::Empty { negate } => is_blank(record.value(field)) != *negate,
            Predicate::TextEquals { target, negate } => {
                let value = record.value(field).unwrap_or_default();
                (value.trim().to_lowercase() == *target) != *negate
            }
            Predicate::NumberEquals { target, negate } => {
                let equal = record
                    .value(field)
                    .and_then(coerce_number)
                    .is_some_and(|v| v == *target);
                equal != *negate
            }
            Predicate::DateEquals { target, negate } => {
                let equal = record
                    .value(field)
                    .and_then(coerce_date)
                    .is_some_and(|v| v == *target);
                equal != *negate
            }
            Predicate::Contains { needle } => record
                .value(field)
                .is_some_and(|v| v.to_lowercase().contains(needle.as_str())),
            Predicate::NumberRange { lower, upper } => record
                .value(field)
                .and_then(coerce_number)
                .is_some_and(|v| within(&v, lower, upper)),
            Predicate::DateRange { lower, upper } => record
                .value(field)
                .and_then(coerce_date)
                .is_some_and(|v| within(&v, lower, upper)),
            Predicate::Never => false,
        }
    }
}

fn equality_predicate<'a>(value: &JsonValue, column_type: ColumnType, negate: bool) -> Predicate<'a> {
    match column_type {
        ColumnType::Number => {
            if let Some(target) = json_to_number(value) {
                return Predicate::NumberEquals { target, negate };
            }
        }
        ColumnType::Date => {
            if let Some(target) = json_to_date(value) {
                return Predicate::DateEquals { target, negate };
            }
        }
        ColumnType::String | ColumnType::Categorical => {}
    }
    Predicate::TextEquals {
        target: json_to_text(value).unwrap_or_default().trim().to_lowercase(),
        negate,
    }
}

type Endpoint<'v> = Option<(&'v JsonValue, bool)>;

fn range_predicate<'a>(column_type: ColumnType, lower: Endpoint<'_>, upper: Endpoint<'_>) -> Predicate<'a> {
    if column_type == ColumnType::Date {
        let lower = bound(lower, json_to_date);
        let upper = bound(upper, json_to_date);
        return match (lower, upper) {
            (Some(lower), Some(upper)) => Predicate::DateRange { lower, upper },
            _ => Predicate::Never,
        };
    }
    match (bound(lower, json_to_number), bound(upper, json_to_number)) {
        (Some(lower), Some(upper)) => Predicate::NumberRange { lower, upper },
        _ => Predicate::Never,
    }
}

/// Converts an endpoint; `None` when the operand fails to parse.
fn bound<T>(endpoint: Endpoint<'_>, parse: fn(&JsonValue) -> Option<T>) -> Option<Bound<T>> {
    match endpoint {
        None => Some(Bound::Unbounded),
        Some((value, inclusive)) => {
            let parsed = parse(value)?;
            Some(if inclusive {
                Bound::Included(parsed)
            } else {
                Bound::Excluded(parsed)
            })
        }
    }
}

fn within<T: PartialOrd>(value: &T, lower: &Bound<T>, upper: &Bound<T>) -> bool {
    let above = match lower {
        Bound::Included(l) => value >= l,
        Bound::Excluded(l) => value > l,
        Bound::Unbounded => true,
    };
    let below = match upper {
        Bound::Included(u) => value <= u,
        Bound::Excluded(u) => value < u,
        Bound::Unbounded => true,
    };
    above && below
}

#[derive(Debug, Clone)]
enum CompiledNode<'a> {
    Group {
        logic: Logic,
        negate: bool,
        children: Vec<CompiledNode<'a>>,
    },
    Rule {
        field: String,
        predicate: Predicate<'a>,
    },
}

impl CompiledNode<'_> {
    fn matches(&self, record: &dyn RecordView) -> bool {
        match self {
            CompiledNode::Group {
                logic,
                negate,
                children,
            } => {
                let combined = match logic {
                    Logic::And => children.iter().all(|child| child.matches(record)),
                    Logic::Or => {
                        children.is_empty() || children.iter().any(|child| child.matches(record))
                    }
                };
                combined != *negate
            }
            CompiledNode::Rule { field, predicate } => predicate.test(record, field),
        }
    }
}

/// A filter tree validated against one dataset's columns.
#[derive(Debug, Clone)]
pub struct CompiledFilter<'a> {
    root: CompiledNode<'a>,
    rule_count: usize,
}

impl<'a> CompiledFilter<'a> {
    /// Validates `group` and prepares it for bulk evaluation.
    ///
    /// Fails with [`EngineError::Validation`] listing every issue found.
    pub fn compile(
        group: &FilterGroup,
        columns: &[Column],
        cohorts: &'a dyn CohortLookup,
    ) -> EngineResult<Self> {
        let issues = validate(group, columns, cohorts);
        if !issues.is_empty() {
            return Err(EngineError::validation(issues));
        }
        Ok(Self {
            root: compile_group(group, columns, cohorts),
            rule_count: group.rule_count(),
        })
    }

    pub fn matches(&self, record: &dyn RecordView) -> bool {
        self.root.matches(record)
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }
}

fn compile_group<'a>(
    group: &FilterGroup,
    columns: &[Column],
    cohorts: &'a dyn CohortLookup,
) -> CompiledNode<'a> {
    let children = group
        .rules
        .iter()
        .map(|node| match node {
            FilterNode::Group(child) => compile_group(child, columns, cohorts),
            FilterNode::Rule(rule) => {
                let column_type = columns
                    .iter()
                    .find(|c| c.name == rule.field)
                    .map(|c| c.column_type)
                    .unwrap_or(ColumnType::String);
                CompiledNode::Rule {
                    field: rule.field.clone(),
                    predicate: Predicate::from_rule(rule, column_type, cohorts),
                }
            }
        })
        .collect();
    CompiledNode::Group {
        logic: group.logic,
        negate: group.negate,
        children,
    }
}

/// Parses shorthand rules such as `age >= 18` or `diagnosis contains flu`.
pub fn parse_rule_expressions(expressions: &[String]) -> Result<Vec<FilterRule>> {
    expressions.iter().map(|e| parse_rule_expression(e)).collect()
}

fn parse_rule_expression(expression: &str) -> Result<FilterRule> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Empty filter expression"));
    }

    let lowered = trimmed.to_ascii_lowercase();
    for (suffix, op) in [
        (" is not empty", Operator::IsNotEmpty),
        (" is empty", Operator::IsEmpty),
    ] {
        if lowered.ends_with(suffix) {
            let field = trimmed[..trimmed.len() - suffix.len()].trim();
            return Ok(FilterRule::new(field, op, JsonValue::Null));
        }
    }

    for (needle, op) in [
        (" not_in_cohort ", Operator::NotInCohort),
        (" in_cohort ", Operator::InCohort),
        (" contains ", Operator::Contains),
    ] {
        if let Some(idx) = lowered.find(needle) {
            let (left, right_with_space) = trimmed.split_at(idx);
            let right = unquote(right_with_space[needle.len()..].trim());
            return Ok(FilterRule::new(
                left.trim(),
                op,
                JsonValue::String(right.to_string()),
            ));
        }
    }

    if let Some(idx) = lowered.find(" between ") {
        let field = trimmed[..idx].trim();
        let range = &trimmed[idx + " between ".len()..];
        let lowered_range = range.to_ascii_lowercase();
        let split = lowered_range
            .find(" and ")
            .ok_or_else(|| anyhow!("Expected 'between <low> and <high>' in '{trimmed}'"))?;
        let low = operand(range[..split].trim());
        let high = operand(range[split + " and ".len()..].trim());
        return Ok(FilterRule::between(field, low, high));
    }

    for needle in ["!=", ">=", "<=", "=", ">", "<"] {
        if let Some(idx) = trimmed.find(needle) {
            let op = match needle {
                "=" => Operator::Equals,
                "!=" => Operator::NotEquals,
                ">" => Operator::Gt,
                ">=" => Operator::Gte,
                "<" => Operator::Lt,
                _ => Operator::Lte,
            };
            let left = trimmed[..idx].trim();
            let right = trimmed[idx + needle.len()..].trim();
            return Ok(FilterRule::new(left, op, operand(right)));
        }
    }

    Err(anyhow!("Failed to parse filter expression '{trimmed}'"))
}

/// Operands keep their literal text; each column type coerces it when the rule is compiled.
fn operand(raw: &str) -> JsonValue {
    JsonValue::String(unquote(raw).to_string())
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2 {
        let bytes = value.as_bytes();
        if (bytes[0] == b'"' && bytes[value.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[value.len() - 1] == b'\'')
        {
            return &value[1..value.len() - 1];
        }
    }
    value
}
