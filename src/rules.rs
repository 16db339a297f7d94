// 🏷️ Ledger Rules - Rules as Data
// Each rule maps a source dataset + filter to a formula and a target account template

use crate::error::RuleError;
use crate::fields::value_text;
use anyhow::{bail, Context as AnyhowContext, Result};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// RULE STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Active,
    Inactive,
    Draft,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleStatus::Active => "active",
            RuleStatus::Inactive => "inactive",
            RuleStatus::Draft => "draft",
        }
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuleStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            // Rule stores leave the column blank for live rules
            "" | "active" => Ok(RuleStatus::Active),
            "inactive" => Ok(RuleStatus::Inactive),
            "draft" => Ok(RuleStatus::Draft),
            other => Err(format!("Invalid rule status: {}", other)),
        }
    }
}

impl<'de> Deserialize<'de> for RuleStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.unwrap_or_default()
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

/// One externally authored ledger rule.
///
/// Field names follow the rule store (`ruleName`, `ledgerDefinition`,
/// `dataDefinition`, ...). Missing text fields deserialize as empty so that
/// an incomplete rule is reported by `validate` instead of failing the load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    /// Store identifier, kept for traceability only
    #[serde(
        default,
        alias = "_id",
        deserialize_with = "id_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,

    /// Display key
    #[serde(default, deserialize_with = "text_or_empty")]
    pub rule_name: String,

    /// Dataset the aggregation runs against
    #[serde(default, deserialize_with = "text_or_empty")]
    pub source_table: String,

    /// Literal account, `[field]`, or a mix such as `300[categoryCode]001`
    #[serde(default, alias = "ledgerDefinition", deserialize_with = "text_or_empty")]
    pub account_template: String,

    /// Arithmetic over `[field]` references
    #[serde(default, alias = "dataDefinition", deserialize_with = "text_or_empty")]
    pub formula: String,

    /// `field=value`, `none`, or empty
    #[serde(default, deserialize_with = "text_or_empty")]
    pub filter: String,

    #[serde(default)]
    pub status: RuleStatus,

    /// Set when the stored record could not be read as a rule
    #[serde(skip)]
    pub load_error: Option<String>,
}

/// Any identifier shape as text: strings as-is, `{"$oid": ..}` unwrapped, others rendered
fn id_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let id = match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Object(map)) => match map.get("$oid") {
            Some(Value::String(oid)) => Some(oid.clone()),
            _ => Some(Value::Object(map).to_string()),
        },
        Some(other) => Some(other.to_string()),
    };
    Ok(id)
}

fn text_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .map(|s| s.trim().to_string())
        .unwrap_or_default())
}

impl RuleDefinition {
    pub fn new(
        rule_name: &str,
        source_table: &str,
        account_template: &str,
        formula: &str,
        filter: &str,
    ) -> Self {
        RuleDefinition {
            id: None,
            rule_name: rule_name.to_string(),
            source_table: source_table.to_string(),
            account_template: account_template.to_string(),
            formula: formula.to_string(),
            filter: filter.to_string(),
            status: RuleStatus::Active,
            load_error: None,
        }
    }

    /// Read one stored record. A record that is not a valid rule comes back
    /// carrying its error, so the run skips it instead of failing the load.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value::<RuleDefinition>(value.clone()) {
            Ok(rule) => rule,
            Err(e) => {
                let name = value
                    .get("ruleName")
                    .and_then(value_text)
                    .unwrap_or_default();
                warn!("⚠️  Unreadable rule '{}': {}", name, e);
                let mut rule = RuleDefinition::new(&name, "", "", "", "");
                rule.load_error = Some(e.to_string());
                rule
            }
        }
    }

    /// Builder: set status
    pub fn with_status(mut self, status: RuleStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    /// Name for logs, even when the rule has none
    pub fn display_name(&self) -> &str {
        if self.rule_name.trim().is_empty() {
            "<unnamed>"
        } else {
            &self.rule_name
        }
    }

    /// Check the fields the engine cannot run without
    pub fn validate(&self) -> Result<(), RuleError> {
        if let Some(error) = &self.load_error {
            return Err(RuleError::Malformed(error.clone()));
        }
        if self.rule_name.trim().is_empty() {
            return Err(RuleError::MissingField("ruleName"));
        }
        if self.source_table.trim().is_empty() {
            return Err(RuleError::MissingField("sourceTable"));
        }
        if self.formula.trim().is_empty() {
            return Err(RuleError::MissingField("formula"));
        }
        if !self.is_active() {
            return Err(RuleError::NotActive {
                name: self.rule_name.clone(),
                status: self.status.to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// RULE SOURCES
// ============================================================================

/// Where rule definitions come from
pub trait RuleSource {
    /// Every rule the store holds, whatever its status
    fn all_rules(&self) -> Result<Vec<RuleDefinition>>;

    /// Only rules with `status = active`
    fn active_rules(&self) -> Result<Vec<RuleDefinition>> {
        Ok(self
            .all_rules()?
            .into_iter()
            .filter(RuleDefinition::is_active)
            .collect())
    }
}

impl RuleSource for Vec<RuleDefinition> {
    fn all_rules(&self) -> Result<Vec<RuleDefinition>> {
        Ok(self.clone())
    }
}

/// Rules kept in a JSON (array of objects) or CSV (header row) file
#[derive(Debug, Clone)]
pub struct RuleFile {
    path: PathBuf,
}

impl RuleFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        RuleFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuleSource for RuleFile {
    fn all_rules(&self) -> Result<Vec<RuleDefinition>> {
        let extension = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());

        match extension.as_deref() {
            Some("json") => load_rules_json(&self.path),
            Some("csv") => load_rules_csv(&self.path),
            _ => bail!("Unsupported rules file (expected .json or .csv): {:?}", self.path),
        }
    }
}

/// Load rules from a JSON array; each element is read on its own
pub fn load_rules_json<P: AsRef<Path>>(path: P) -> Result<Vec<RuleDefinition>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read rules file: {:?}", path.as_ref()))?;

    let value: Value = serde_json::from_str(&content).context("Failed to parse rules JSON")?;
    let Value::Array(items) = value else {
        bail!("Rules JSON must be an array of rule objects: {:?}", path.as_ref());
    };

    Ok(items.into_iter().map(RuleDefinition::from_value).collect())
}

/// Load rules from a CSV file with a header row; short rows read as missing fields
pub fn load_rules_csv<P: AsRef<Path>>(path: P) -> Result<Vec<RuleDefinition>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path.as_ref())
        .with_context(|| format!("Failed to open rules CSV: {:?}", path.as_ref()))?;
    let headers = rdr.headers().context("Failed to read rules CSV header")?.clone();

    let mut rules = Vec::new();
    for result in rdr.records() {
        let record = result.context("Failed to read rules CSV record")?;
        let row: Map<String, Value> = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.trim().to_string(), Value::String(v.to_string())))
            .collect();
        rules.push(RuleDefinition::from_value(Value::Object(row)));
    }

    Ok(rules)
}

// ============================================================================
// TESTS
// ============================================================================
