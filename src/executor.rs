// 🔎 Query Execution - Run an aggregation plan against a data store
//
// The processor only sees `QueryExecutor`. Two implementations ship:
//   - MemoryExecutor:  groups JSON records in Rust (tests, demos, small files)
//   - SqliteExecutor:  one GROUP BY statement per plan (see `db`)

use crate::error::RowError;
use crate::fields::{value_text, FieldSource};
use crate::plan::AggregationPlan;
use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Key under which grouped rows may nest their group identity
pub const GROUP_ID_KEY: &str = "_id";

// ============================================================================
// RESULT ROW
// ============================================================================

/// One aggregated row: group key, passthrough values and sums.
///
/// Group key fields may sit at the top level or nested under `_id`;
/// lookups check both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultRow {
    values: Map<String, Value>,
}

impl ResultRow {
    pub fn new(values: Map<String, Value>) -> Self {
        ResultRow { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).or_else(|| {
            self.values
                .get(GROUP_ID_KEY)
                .and_then(|id| id.get(name))
        })
    }

    /// Group key value; missing or null is a row-shape error
    pub fn group_value(&self, name: &str) -> Result<&Value, RowError> {
        match self.get(name) {
            Some(value) if !value.is_null() => Ok(value),
            _ => Err(RowError::MissingGroupKey(name.to_string())),
        }
    }

    pub fn group_text(&self, name: &str) -> Result<String, RowError> {
        self.group_value(name)
            .map(|v| value_text(v).unwrap_or_default())
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Snapshot with `_id` contents lifted to the top level
    pub fn flattened(&self) -> Map<String, Value> {
        let mut flat = Map::new();
        for (key, value) in &self.values {
            if key == GROUP_ID_KEY {
                if let Value::Object(id) = value {
                    for (k, v) in id {
                        flat.insert(k.clone(), v.clone());
                    }
                    continue;
                }
            }
            flat.insert(key.clone(), value.clone());
        }
        flat
    }
}

impl FieldSource for ResultRow {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl From<Map<String, Value>> for ResultRow {
    fn from(values: Map<String, Value>) -> Self {
        ResultRow::new(values)
    }
}

// ============================================================================
// EXECUTOR TRAIT
// ============================================================================

/// Anything that can turn a plan into grouped rows
pub trait QueryExecutor {
    fn execute(&self, plan: &AggregationPlan) -> Result<Vec<ResultRow>>;
}

impl<T: QueryExecutor + ?Sized> QueryExecutor for &T {
    fn execute(&self, plan: &AggregationPlan) -> Result<Vec<ResultRow>> {
        (**self).execute(plan)
    }
}

// ============================================================================
// IN-MEMORY EXECUTOR
// ============================================================================

/// Running `$sum`: integers stay integers until a float or overflow shows up
#[derive(Debug, Clone)]
struct Sum {
    int_total: i64,
    float_total: f64,
    all_int: bool,
}

impl Default for Sum {
    fn default() -> Self {
        Sum {
            int_total: 0,
            float_total: 0.0,
            all_int: true,
        }
    }
}

impl Sum {
    fn add(&mut self, value: Option<&Value>) {
        // Non-numeric values are ignored, as the aggregation store does
        let Some(Value::Number(n)) = value else {
            return;
        };
        self.float_total += n.as_f64().unwrap_or(0.0);
        if self.all_int {
            match n.as_i64().and_then(|i| self.int_total.checked_add(i)) {
                Some(total) => self.int_total = total,
                None => self.all_int = false,
            }
        }
    }

    fn to_json(&self) -> Value {
        if self.all_int {
            json!(self.int_total)
        } else {
            json!(self.float_total)
        }
    }
}

struct Group {
    valuation: Value,
    account: Value,
    first: Vec<Value>,
    sums: Vec<Sum>,
}

/// Groups JSON records held in memory, keyed by dataset name
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    datasets: HashMap<String, Vec<Map<String, Value>>>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a dataset
    pub fn with_dataset(mut self, name: &str, records: Vec<Map<String, Value>>) -> Self {
        self.insert_dataset(name, records);
        self
    }

    /// Append records to a dataset, creating it if needed
    pub fn insert_dataset(&mut self, name: &str, records: Vec<Map<String, Value>>) {
        self.datasets
            .entry(name.to_string())
            .or_default()
            .extend(records);
    }
}

impl QueryExecutor for MemoryExecutor {
    fn execute(&self, plan: &AggregationPlan) -> Result<Vec<ResultRow>> {
        let Some(records) = self.datasets.get(&plan.source_table) else {
            debug!("Dataset '{}' not loaded, no rows", plan.source_table);
            return Ok(Vec::new());
        };

        let valuation_field = &plan.group_key.valuation;
        let account_field = &plan.group_key.account;

        // Ordered like the SQL executor: valuation text, then account text, nulls first
        let mut groups: BTreeMap<(Option<String>, Option<String>), Group> = BTreeMap::new();

        for record in records {
            if let Some(constraint) = &plan.match_constraint {
                let value = record.get(&constraint.field).unwrap_or(&Value::Null);
                if !constraint.value.matches(value) {
                    continue;
                }
            }

            let valuation = record.get(valuation_field).cloned().unwrap_or(Value::Null);
            let account = record.get(account_field).cloned().unwrap_or(Value::Null);
            let key = (value_text(&valuation), value_text(&account));

            let group = groups.entry(key).or_insert_with(|| Group {
                valuation,
                account,
                first: plan
                    .passthrough
                    .iter()
                    .map(|p| record.get(&p.field).cloned().unwrap_or(Value::Null))
                    .collect(),
                sums: vec![Sum::default(); plan.summed.len()],
            });

            for (sum, field) in group.sums.iter_mut().zip(&plan.summed) {
                sum.add(record.get(&field.field));
            }
        }

        let rows = groups
            .into_values()
            .map(|group| {
                let mut id = Map::new();
                id.insert(valuation_field.clone(), group.valuation);
                id.insert(account_field.clone(), group.account);

                let mut values = Map::new();
                values.insert(GROUP_ID_KEY.to_string(), Value::Object(id));
                for (field, value) in plan.passthrough.iter().zip(group.first) {
                    values.insert(field.output.clone(), value);
                }
                for (field, sum) in plan.summed.iter().zip(&group.sums) {
                    values.insert(field.output.clone(), sum.to_json());
                }
                ResultRow::new(values)
            })
            .collect();

        Ok(rows)
    }
}

// ============================================================================
// TESTS
// ============================================================================
