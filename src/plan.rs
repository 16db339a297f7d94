// 🗺️ Query Plan Builder - Minimal grouped aggregation per rule
//
// A plan names exactly the fields a rule needs:
//   - match:       optional single-field equality from the rule's filter text
//   - group key:   (valuation date, account)
//   - passthrough: first value per group (entity id, account template fields)
//   - summed:      every formula field, summed per group
//
// The plan is store-neutral. `to_pipeline_json` renders a Mongo-style
// aggregation pipeline; the SQLite executor in `db` renders SQL.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Suffix for the passthrough copy of a field that is also summed
pub const FIRST_SUFFIX: &str = "__first";

// ============================================================================
// OPTIONS
// ============================================================================

/// Names of the fields every source dataset carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseFields {
    #[serde(default = "default_valuation_field")]
    pub valuation: String,
    #[serde(default = "default_account_field")]
    pub account: String,
    #[serde(default = "default_entity_field")]
    pub entity: String,
}

fn default_valuation_field() -> String {
    "valuationDt".to_string()
}

fn default_account_field() -> String {
    "account".to_string()
}

fn default_entity_field() -> String {
    "eagleEntityId".to_string()
}

impl Default for BaseFields {
    fn default() -> Self {
        BaseFields {
            valuation: default_valuation_field(),
            account: default_account_field(),
            entity: default_entity_field(),
        }
    }
}

/// What to do with a field that both the formula and the account template use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// First value only; the formula sees the first value too
    #[default]
    Passthrough,
    /// Sum only; the account is built from the summed value
    Summed,
    /// Summed under its own name, first value under `<name>__first`
    Both,
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverlapPolicy::Passthrough => write!(f, "passthrough"),
            OverlapPolicy::Summed => write!(f, "summed"),
            OverlapPolicy::Both => write!(f, "both"),
        }
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "passthrough" => Ok(OverlapPolicy::Passthrough),
            "summed" => Ok(OverlapPolicy::Summed),
            "both" => Ok(OverlapPolicy::Both),
            _ => Err(format!("Invalid overlap policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOptions {
    #[serde(default)]
    pub base_fields: BaseFields,
    #[serde(default)]
    pub overlap: OverlapPolicy,
}

// ============================================================================
// MATCH CONSTRAINT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatchValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MatchValue {
    pub fn to_json(&self) -> Value {
        match self {
            MatchValue::Bool(b) => Value::Bool(*b),
            MatchValue::Integer(i) => json!(i),
            MatchValue::Float(f) => json!(f),
            MatchValue::Text(s) => Value::String(s.clone()),
        }
    }

    /// Equality against a stored row value, numbers compared numerically
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (MatchValue::Bool(b), Value::Bool(v)) => b == v,
            (MatchValue::Integer(i), Value::Number(n)) => n.as_f64() == Some(*i as f64),
            (MatchValue::Float(f), Value::Number(n)) => n.as_f64() == Some(*f),
            (MatchValue::Text(s), Value::String(v)) => s == v,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchConstraint {
    pub field: String,
    pub value: MatchValue,
}

/// Parse a rule filter such as `shareClass='A'` or `isComposite=true`.
///
/// Empty text and `none` mean no filter. Anything that is not a single
/// `field=value` pair is ignored, and the rule runs unfiltered.
pub fn parse_filter(filter: &str) -> Option<MatchConstraint> {
    let filter = filter.trim();
    if filter.is_empty() || filter.eq_ignore_ascii_case("none") {
        return None;
    }

    let parts: Vec<&str> = filter.split('=').collect();
    if parts.len() != 2 {
        debug!("Ignoring filter '{}': expected a single field=value pair", filter);
        return None;
    }

    let field = parts[0].trim();
    if field.is_empty() {
        debug!("Ignoring filter '{}': empty field name", filter);
        return None;
    }

    let raw = parts[1].trim().trim_matches(|c| c == '\'' || c == '"');
    Some(MatchConstraint {
        field: field.to_string(),
        value: decode_filter_value(raw),
    })
}

fn decode_filter_value(raw: &str) -> MatchValue {
    if raw.eq_ignore_ascii_case("true") {
        return MatchValue::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return MatchValue::Bool(false);
    }

    let numeric = raw.chars().any(|c| c.is_ascii_digit())
        && raw.chars().all(|c| c.is_ascii_digit() || c == '.');
    if numeric {
        if !raw.contains('.') {
            if let Ok(i) = raw.parse::<i64>() {
                return MatchValue::Integer(i);
            }
        }
        // Decimals, and integers too wide for i64
        if let Ok(f) = raw.parse::<f64>() {
            return MatchValue::Float(f);
        }
    }

    MatchValue::Text(raw.to_string())
}

// ============================================================================
// AGGREGATION PLAN
// ============================================================================

/// A source field and the key it appears under in result rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanField {
    pub field: String,
    pub output: String,
}

impl PlanField {
    fn same(field: &str) -> Self {
        PlanField {
            field: field.to_string(),
            output: field.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKey {
    pub valuation: String,
    pub account: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationPlan {
    pub source_table: String,
    pub match_constraint: Option<MatchConstraint>,
    pub group_key: GroupKey,
    pub passthrough: Vec<PlanField>,
    pub summed: Vec<PlanField>,
}

impl AggregationPlan {
    /// Every source field the query has to read, without duplicates
    pub fn projected_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = vec![
            self.group_key.valuation.clone(),
            self.group_key.account.clone(),
        ];
        for f in self.passthrough.iter().chain(self.summed.iter()) {
            if !fields.contains(&f.field) {
                fields.push(f.field.clone());
            }
        }
        fields
    }

    pub fn passthrough_output(&self, field: &str) -> Option<&str> {
        self.passthrough
            .iter()
            .find(|f| f.field == field)
            .map(|f| f.output.as_str())
    }

    pub fn is_summed(&self, field: &str) -> bool {
        self.summed.iter().any(|f| f.field == field)
    }

    /// Mongo-style `$match` / `$project` / `$group` pipeline
    pub fn to_pipeline_json(&self) -> Value {
        let mut pipeline = Vec::new();

        if let Some(constraint) = &self.match_constraint {
            let mut stage = Map::new();
            stage.insert(constraint.field.clone(), constraint.value.to_json());
            pipeline.push(json!({ "$match": stage }));
        }

        let mut projection = Map::new();
        for field in self.projected_fields() {
            projection.insert(field, json!(1));
        }
        pipeline.push(json!({ "$project": projection }));

        let mut id = Map::new();
        for key in [&self.group_key.valuation, &self.group_key.account] {
            id.insert(key.clone(), json!(format!("${}", key)));
        }
        let mut group = Map::new();
        group.insert("_id".to_string(), Value::Object(id));
        for f in &self.passthrough {
            group.insert(f.output.clone(), json!({ "$first": format!("${}", f.field) }));
        }
        for f in &self.summed {
            group.insert(f.output.clone(), json!({ "$sum": format!("${}", f.field) }));
        }
        pipeline.push(json!({ "$group": group }));

        Value::Array(pipeline)
    }
}

/// Build the aggregation plan for one rule.
///
/// `formula_fields` become summed measures; `account_fields` and the entity
/// id are carried through as first values. Group key fields are never summed.
pub fn build_plan(
    source_table: &str,
    filter: &str,
    formula_fields: &[String],
    account_fields: &[String],
    options: &PlanOptions,
) -> AggregationPlan {
    let base = &options.base_fields;
    let is_group_field = |f: &str| f == base.valuation || f == base.account;

    let mut passthrough = vec![PlanField::same(&base.entity)];
    let mut summed: Vec<PlanField> = Vec::new();

    for field in account_fields {
        if is_group_field(field) || *field == base.entity {
            continue;
        }
        if passthrough.iter().any(|p| p.field == *field) {
            continue;
        }
        let in_formula = formula_fields.contains(field);
        match (in_formula, options.overlap) {
            (true, OverlapPolicy::Summed) => {}
            (true, OverlapPolicy::Both) => passthrough.push(PlanField {
                field: field.clone(),
                output: format!("{}{}", field, FIRST_SUFFIX),
            }),
            _ => passthrough.push(PlanField::same(field)),
        }
    }

    for field in formula_fields {
        if is_group_field(field) || *field == base.entity {
            debug!("Field '{}' is part of the group identity, not summed", field);
            continue;
        }
        if account_fields.contains(field) && options.overlap == OverlapPolicy::Passthrough {
            continue;
        }
        if !summed.iter().any(|s| s.field == *field) {
            summed.push(PlanField::same(field));
        }
    }

    AggregationPlan {
        source_table: source_table.to_string(),
        match_constraint: parse_filter(filter),
        group_key: GroupKey {
            valuation: base.valuation.clone(),
            account: base.account.clone(),
        },
        passthrough,
        summed,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn names(fields: &[PlanField]) -> Vec<&str> {
        fields.iter().map(|f| f.output.as_str()).collect()
    }

    #[test]
    fn test_filter_with_quotes() {
        let plan = build_plan(
            "dataNAV",
            "shareClass='A'",
            &["netAssets".to_string()],
            &[],
            &PlanOptions::default(),
        );

        let constraint = plan.match_constraint.clone().unwrap();
        assert_eq!(constraint.field, "shareClass");
        assert_eq!(constraint.value, MatchValue::Text("A".to_string()));
        assert_eq!(names(&plan.summed), vec!["netAssets"]);
        assert!(plan.passthrough_output("netAssets").is_none());
    }

    #[test]
    fn test_filter_value_types() {
        assert_eq!(
            parse_filter("isComposite=TRUE").unwrap().value,
            MatchValue::Bool(true)
        );
        assert_eq!(
            parse_filter("isSleeve = false").unwrap().value,
            MatchValue::Bool(false)
        );
        assert_eq!(parse_filter("units=42").unwrap().value, MatchValue::Integer(42));
        assert_eq!(parse_filter("nav=10.5").unwrap().value, MatchValue::Float(10.5));
        assert_eq!(parse_filter("code=\"7\"").unwrap().value, MatchValue::Integer(7));
        assert_eq!(
            parse_filter("big=99999999999999999999").unwrap().value,
            MatchValue::Float(1e20)
        );
        let wide: Value = serde_json::from_str("99999999999999999999").unwrap();
        assert!(parse_filter("big=99999999999999999999").unwrap().value.matches(&wide));
        assert_eq!(
            parse_filter("version=1.2.3").unwrap().value,
            MatchValue::Text("1.2.3".to_string())
        );
    }

    #[test]
    fn test_filter_lenient_shapes() {
        assert!(parse_filter("").is_none());
        assert!(parse_filter("none").is_none());
        assert!(parse_filter("NONE").is_none());
        assert!(parse_filter("shareClass").is_none());
        assert!(parse_filter("a=b=c").is_none());
        assert!(parse_filter("=A").is_none());
    }

    #[test]
    fn test_base_fields() {
        let plan = build_plan("dataNAV", "", &[], &[], &PlanOptions::default());
        assert!(plan.match_constraint.is_none());
        assert_eq!(plan.group_key.valuation, "valuationDt");
        assert_eq!(plan.group_key.account, "account");
        assert_eq!(names(&plan.passthrough), vec!["eagleEntityId"]);
        assert_eq!(
            plan.projected_fields(),
            vec!["valuationDt", "account", "eagleEntityId"]
        );
    }

    #[test]
    fn test_account_field_is_passthrough() {
        let plan = build_plan(
            "dataNAV",
            "none",
            &["subscriptionBalance".to_string()],
            &["categoryCode".to_string()],
            &PlanOptions::default(),
        );
        assert_eq!(names(&plan.passthrough), vec!["eagleEntityId", "categoryCode"]);
        assert_eq!(names(&plan.summed), vec!["subscriptionBalance"]);
    }

    #[test]
    fn test_overlap_policies() {
        let formula = vec!["code".to_string(), "amount".to_string()];
        let account = vec!["code".to_string()];

        let plan = build_plan("t", "", &formula, &account, &PlanOptions::default());
        assert_eq!(names(&plan.passthrough), vec!["eagleEntityId", "code"]);
        assert_eq!(names(&plan.summed), vec!["amount"]);

        let summed = PlanOptions {
            overlap: OverlapPolicy::Summed,
            ..PlanOptions::default()
        };
        let plan = build_plan("t", "", &formula, &account, &summed);
        assert_eq!(names(&plan.passthrough), vec!["eagleEntityId"]);
        assert_eq!(names(&plan.summed), vec!["code", "amount"]);

        let both = PlanOptions {
            overlap: OverlapPolicy::Both,
            ..PlanOptions::default()
        };
        let plan = build_plan("t", "", &formula, &account, &both);
        assert_eq!(names(&plan.passthrough), vec!["eagleEntityId", "code__first"]);
        assert_eq!(names(&plan.summed), vec!["code", "amount"]);
        assert_eq!(plan.passthrough_output("code"), Some("code__first"));
    }

    #[test]
    fn test_summed_and_passthrough_outputs_are_disjoint() {
        for overlap in [OverlapPolicy::Passthrough, OverlapPolicy::Summed, OverlapPolicy::Both] {
            let options = PlanOptions {
                overlap,
                ..PlanOptions::default()
            };
            let plan = build_plan(
                "t",
                "",
                &["a".to_string(), "eagleEntityId".to_string(), "b".to_string()],
                &["b".to_string(), "c".to_string()],
                &options,
            );
            for s in &plan.summed {
                assert!(plan.passthrough.iter().all(|p| p.output != s.output));
            }
            assert!(!plan.is_summed("eagleEntityId"));
        }
    }

    #[test]
    fn test_group_fields_never_summed() {
        let plan = build_plan(
            "t",
            "",
            &["account".to_string(), "valuationDt".to_string(), "x".to_string()],
            &["account".to_string()],
            &PlanOptions::default(),
        );
        assert_eq!(names(&plan.summed), vec!["x"]);
        assert_eq!(names(&plan.passthrough), vec!["eagleEntityId"]);
    }

    #[test]
    fn test_pipeline_json() {
        let plan = build_plan(
            "dataNAV",
            "shareClass='A'",
            &["netAssets".to_string()],
            &["accountCode".to_string()],
            &PlanOptions::default(),
        );
        let pipeline = plan.to_pipeline_json();
        let stages = pipeline.as_array().unwrap();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0]["$match"]["shareClass"], json!("A"));
        assert_eq!(stages[1]["$project"]["netAssets"], json!(1));
        assert_eq!(stages[2]["$group"]["_id"]["account"], json!("$account"));
        assert_eq!(stages[2]["$group"]["netAssets"]["$sum"], json!("$netAssets"));
        assert_eq!(
            stages[2]["$group"]["accountCode"]["$first"],
            json!("$accountCode")
        );
    }
}
