// ⚙️ Rule Processor - Rules in, ledger entries out
//
// Per rule: Validate → ExtractFields → BuildPlan → Execute → ForEachRow{Resolve, Evaluate, Emit}
//
// Nothing in one rule can stop another rule. Everything that went wrong is
// recorded as a RunIssue next to the entries that were produced.

use crate::account::{AccountKind, AccountTemplate};
use crate::executor::{QueryExecutor, ResultRow};
use crate::fields::{extract_fields, value_text};
use crate::formula::Formula;
use crate::plan::{build_plan, AggregationPlan, PlanOptions};
use crate::rules::{RuleDefinition, RuleSource};
use crate::summary::{summarize, AccountSummary};
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

// ============================================================================
// LEDGER ENTRY
// ============================================================================

/// One derived sub-ledger line, created per result row and never mutated.
///
/// Serialized with the names downstream ledger consumers read
/// (`eagleLedgerAcct`, `calculatedValue`, `dataDefinition`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub entry_id: String,
    pub run_id: String,
    pub rule_name: String,
    pub valuation_dt: String,
    pub account: String,
    #[serde(rename = "eagleEntityId")]
    pub entity_id: Option<String>,
    #[serde(rename = "eagleLedgerAcct")]
    pub ledger_account: String,
    pub account_kind: AccountKind,
    pub calculated_value: f64,
    #[serde(rename = "dataDefinition")]
    pub formula: String,
    #[serde(rename = "ledgerDefinition")]
    pub account_template: String,
    pub source_data: Map<String, Value>,
    pub processed_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Deterministic key for persistent sinks.
    /// Independent of run id and timestamps, so re-running a rule set is a no-op.
    pub fn idempotency_hash(&self) -> String {
        let value = self.calculated_value.to_string();
        let parts = [
            self.rule_name.as_str(),
            self.valuation_dt.as_str(),
            self.account.as_str(),
            self.ledger_account.as_str(),
            self.entity_id.as_deref().unwrap_or(""),
            value.as_str(),
        ];

        // Length-prefixed, so no separator inside a name can shift a boundary
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// RUN REPORT
// ============================================================================

/// Something a run skipped, zeroed or failed on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunIssue {
    /// Definition error or non-active status
    RuleSkipped { rule: String, reason: String },
    /// Executor failure; no entries for this rule
    RuleFailed { rule: String, error: String },
    /// Result row without a usable group key
    RowSkipped {
        rule: String,
        row_index: usize,
        reason: String,
    },
    /// Formula failed for this row; entry emitted with 0.0
    ValueZeroed {
        rule: String,
        row_index: usize,
        ledger_account: String,
        error: String,
    },
}

impl fmt::Display for RunIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunIssue::RuleSkipped { rule, reason } => write!(f, "rule '{}' skipped: {}", rule, reason),
            RunIssue::RuleFailed { rule, error } => write!(f, "rule '{}' failed: {}", rule, error),
            RunIssue::RowSkipped { rule, row_index, reason } => {
                write!(f, "rule '{}' row {} skipped: {}", rule, row_index, reason)
            }
            RunIssue::ValueZeroed { rule, row_index, ledger_account, error } => write!(
                f,
                "rule '{}' row {} ({}) zeroed: {}",
                rule, row_index, ledger_account, error
            ),
        }
    }
}

impl RunIssue {
    pub fn rule(&self) -> &str {
        match self {
            RunIssue::RuleSkipped { rule, .. }
            | RunIssue::RuleFailed { rule, .. }
            | RunIssue::RowSkipped { rule, .. }
            | RunIssue::ValueZeroed { rule, .. } => rule,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleOutcome {
    pub rule_name: String,
    pub rows_read: usize,
    pub entries: Vec<LedgerEntry>,
    pub issues: Vec<RunIssue>,
}

impl RuleOutcome {
    fn new(rule_name: &str) -> Self {
        RuleOutcome {
            rule_name: rule_name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.issues
            .iter()
            .any(|i| matches!(i, RunIssue::RuleSkipped { .. }))
    }

    pub fn is_failed(&self) -> bool {
        self.issues
            .iter()
            .any(|i| matches!(i, RunIssue::RuleFailed { .. }))
    }
}

/// Everything one run produced, entries in rule submission order
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rules_total: usize,
    pub rules_processed: usize,
    pub rules_skipped: usize,
    pub rules_failed: usize,
    pub entries: Vec<LedgerEntry>,
    pub issues: Vec<RunIssue>,
}

impl RunOutcome {
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn summary(&self) -> Vec<AccountSummary> {
        summarize(&self.entries)
    }

    pub fn zeroed_count(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| matches!(i, RunIssue::ValueZeroed { .. }))
            .count()
    }

    pub fn skipped_rows(&self) -> usize {
        self.issues
            .iter()
            .filter(|i| matches!(i, RunIssue::RowSkipped { .. }))
            .count()
    }
}

// ============================================================================
// RUN CONTEXT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    pub plan: PlanOptions,
    /// 1 = sequential
    pub workers: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            plan: PlanOptions::default(),
            workers: 1,
        }
    }
}

/// Per-run state, passed explicitly through the pipeline
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub options: RunOptions,
}

impl RunContext {
    pub fn new(options: RunOptions) -> Self {
        RunContext {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            options,
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        RunContext::new(RunOptions::default())
    }
}

// ============================================================================
// PROCESSOR
// ============================================================================

pub struct RuleProcessor<E> {
    executor: E,
}

impl<E: QueryExecutor> RuleProcessor<E> {
    pub fn new(executor: E) -> Self {
        RuleProcessor { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Process one rule end to end
    pub fn process_rule(&self, rule: &RuleDefinition, ctx: &RunContext) -> RuleOutcome {
        let mut outcome = RuleOutcome::new(rule.display_name());

        if let Err(e) = rule.validate() {
            warn!("⚠️  Skipping rule '{}': {}", rule.display_name(), e);
            outcome.issues.push(RunIssue::RuleSkipped {
                rule: rule.display_name().to_string(),
                reason: e.to_string(),
            });
            return outcome;
        }

        let formula = Formula::new(&rule.formula);
        if !formula.is_valid() {
            warn!(
                "⚠️  Rule '{}' has an unusable formula '{}', every value will be 0.0",
                rule.rule_name, rule.formula
            );
        }
        let template = AccountTemplate::parse(&rule.account_template);
        let plan = build_plan(
            &rule.source_table,
            &rule.filter,
            &extract_fields(&rule.formula),
            &template.fields(),
            &ctx.options.plan,
        );
        debug!("Plan for '{}': {}", rule.rule_name, plan.to_pipeline_json());

        let rows = match self.executor.execute(&plan) {
            Ok(rows) => rows,
            Err(e) => {
                error!("❌ Rule '{}' failed: {:#}", rule.rule_name, e);
                outcome.issues.push(RunIssue::RuleFailed {
                    rule: rule.rule_name.clone(),
                    error: format!("{:#}", e),
                });
                return outcome;
            }
        };
        outcome.rows_read = rows.len();

        for (row_index, row) in rows.iter().enumerate() {
            if let Some(entry) =
                self.emit_entry(rule, &plan, &template, &formula, row, row_index, ctx, &mut outcome.issues)
            {
                outcome.entries.push(entry);
            }
        }

        info!(
            "✓ Rule '{}': {} rows → {} entries",
            rule.rule_name,
            outcome.rows_read,
            outcome.entries.len()
        );
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_entry(
        &self,
        rule: &RuleDefinition,
        plan: &AggregationPlan,
        template: &AccountTemplate,
        formula: &Formula,
        row: &ResultRow,
        row_index: usize,
        ctx: &RunContext,
        issues: &mut Vec<RunIssue>,
    ) -> Option<LedgerEntry> {
        let group_key = row
            .group_text(&plan.group_key.valuation)
            .and_then(|valuation| {
                row.group_text(&plan.group_key.account)
                    .map(|account| (valuation, account))
            });

        let (valuation_dt, account) = match group_key {
            Ok(key) => key,
            Err(e) => {
                warn!("⚠️  Rule '{}' row {} skipped: {}", rule.rule_name, row_index, e);
                issues.push(RunIssue::RowSkipped {
                    rule: rule.rule_name.clone(),
                    row_index,
                    reason: e.to_string(),
                });
                return None;
            }
        };

        // Under the `both` overlap policy the first value lives under an alias
        let resolved =
            template.resolve_with(|name| row.get(plan.passthrough_output(name).unwrap_or(name)));

        let calculated_value = match formula.try_evaluate(row) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "⚠️  Rule '{}' row {}: formula '{}' zeroed: {}",
                    rule.rule_name, row_index, rule.formula, e
                );
                issues.push(RunIssue::ValueZeroed {
                    rule: rule.rule_name.clone(),
                    row_index,
                    ledger_account: resolved.account.clone(),
                    error: e.to_string(),
                });
                0.0
            }
        };

        let entity_id = row
            .get(&ctx.options.plan.base_fields.entity)
            .and_then(value_text);

        Some(LedgerEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            run_id: ctx.run_id.clone(),
            rule_name: rule.rule_name.clone(),
            valuation_dt,
            account,
            entity_id,
            ledger_account: resolved.account,
            account_kind: resolved.kind,
            calculated_value,
            formula: rule.formula.clone(),
            account_template: rule.account_template.clone(),
            source_data: row.flattened(),
            processed_at: Utc::now(),
        })
    }

    /// Process every rule; entries come back in submission order.
    ///
    /// With `workers > 1` rules run on a bounded rayon pool.
    pub fn run(&self, rules: &[RuleDefinition], ctx: &RunContext) -> RunOutcome
    where
        E: Sync,
    {
        info!(
            "🚀 Run {} started: {} rules, {} worker(s)",
            ctx.run_id,
            rules.len(),
            ctx.options.workers
        );

        let outcomes: Vec<RuleOutcome> = if ctx.options.workers > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(ctx.options.workers)
                .build()
            {
                Ok(pool) => pool.install(|| {
                    rules
                        .par_iter()
                        .map(|rule| self.process_rule(rule, ctx))
                        .collect()
                }),
                Err(e) => {
                    warn!("⚠️  Worker pool unavailable ({}), running sequentially", e);
                    self.run_sequential(rules, ctx)
                }
            }
        } else {
            self.run_sequential(rules, ctx)
        };

        let mut result = RunOutcome {
            run_id: ctx.run_id.clone(),
            started_at: ctx.started_at,
            finished_at: ctx.started_at,
            rules_total: rules.len(),
            rules_processed: 0,
            rules_skipped: 0,
            rules_failed: 0,
            entries: Vec::new(),
            issues: Vec::new(),
        };

        for outcome in outcomes {
            if outcome.is_skipped() {
                result.rules_skipped += 1;
            } else if outcome.is_failed() {
                result.rules_failed += 1;
            } else {
                result.rules_processed += 1;
            }
            result.entries.extend(outcome.entries);
            result.issues.extend(outcome.issues);
        }
        result.finished_at = Utc::now();

        info!(
            "🏁 Run {} finished: {} entries, {} processed, {} skipped, {} failed",
            result.run_id,
            result.entries.len(),
            result.rules_processed,
            result.rules_skipped,
            result.rules_failed
        );
        result
    }

    fn run_sequential(&self, rules: &[RuleDefinition], ctx: &RunContext) -> Vec<RuleOutcome> {
        rules
            .iter()
            .map(|rule| self.process_rule(rule, ctx))
            .collect()
    }

    /// Load every rule from a source and run it; non-active rules are reported as skipped
    pub fn run_from_source<S: RuleSource + ?Sized>(
        &self,
        source: &S,
        ctx: &RunContext,
    ) -> Result<RunOutcome>
    where
        E: Sync,
    {
        let rules = source.all_rules()?;
        Ok(self.run(&rules, ctx))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MemoryExecutor;
    use crate::plan::OverlapPolicy;
    use crate::rules::RuleStatus;
    use anyhow::bail;
    use serde_json::json;

    fn records(value: Value) -> Vec<Map<String, Value>> {
        value
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn create_test_executor() -> MemoryExecutor {
        MemoryExecutor::new().with_dataset(
            "dataNAV",
            records(json!([
                {"valuationDt": "2024-01-31", "account": "FUND1", "eagleEntityId": "E1",
                 "shareClass": "A", "categoryCode": "200", "accountCode": "3002000120",
                 "subscriptionBalance": 1000000, "capstock": 100, "settleCapstock": 50, "distribution": 25},
                {"valuationDt": "2024-01-31", "account": "FUND2", "eagleEntityId": "E2",
                 "shareClass": "B", "categoryCode": "300", "accountCode": "3002000130",
                 "subscriptionBalance": 500, "capstock": 10, "settleCapstock": 5, "distribution": 1}
            ])),
        )
    }

    struct FailingExecutor;

    impl QueryExecutor for FailingExecutor {
        fn execute(&self, plan: &AggregationPlan) -> Result<Vec<ResultRow>> {
            if plan.source_table == "down" {
                bail!("connection refused");
            }
            Ok(vec![ResultRow::new(
                json!({"valuationDt": "2024-01-31", "account": "F", "x": 4})
                    .as_object()
                    .cloned()
                    .unwrap(),
            )])
        }
    }

    #[test]
    fn test_static_account_rule() {
        let processor = RuleProcessor::new(create_test_executor());
        let rule = RuleDefinition::new(
            "Subscriptions",
            "dataNAV",
            "3002000110",
            "[subscriptionBalance] * -1",
            "none",
        );

        let outcome = processor.process_rule(&rule, &RunContext::default());
        assert_eq!(outcome.entries.len(), 2);
        assert!(outcome.issues.is_empty());

        let first = &outcome.entries[0];
        assert_eq!(first.ledger_account, "3002000110");
        assert_eq!(first.account_kind, AccountKind::Static);
        assert_eq!(first.calculated_value, -1000000.0);
        assert_eq!(first.valuation_dt, "2024-01-31");
        assert_eq!(first.account, "FUND1");
        assert_eq!(first.entity_id.as_deref(), Some("E1"));
        assert_eq!(first.source_data.get("subscriptionBalance"), Some(&json!(1000000)));
    }

    #[test]
    fn test_dynamic_account_with_filter() {
        let processor = RuleProcessor::new(create_test_executor());
        let rule = RuleDefinition::new(
            "Capstock",
            "dataNAV",
            "300[categoryCode]001",
            "[capstock] + [settleCapstock] - [distribution]",
            "shareClass='A'",
        );

        let outcome = processor.process_rule(&rule, &RunContext::default());
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].ledger_account, "300200001");
        assert_eq!(outcome.entries[0].account_kind, AccountKind::Dynamic);
        assert_eq!(outcome.entries[0].calculated_value, 125.0);
    }

    #[test]
    fn test_invalid_rules_are_skipped() {
        let processor = RuleProcessor::new(create_test_executor());
        let rules = vec![
            RuleDefinition::new("", "dataNAV", "1", "[capstock]", ""),
            RuleDefinition::new("Draft", "dataNAV", "1", "[capstock]", "")
                .with_status(RuleStatus::Draft),
            RuleDefinition::new("Good", "dataNAV", "1", "[capstock]", ""),
        ];

        let outcome = processor.run(&rules, &RunContext::default());
        assert_eq!(outcome.rules_total, 3);
        assert_eq!(outcome.rules_skipped, 2);
        assert_eq!(outcome.rules_processed, 1);
        assert_eq!(outcome.entry_count(), 2);
        assert!(outcome
            .issues
            .iter()
            .all(|i| matches!(i, RunIssue::RuleSkipped { .. })));
    }

    #[test]
    fn test_executor_failure_is_rule_level() {
        let processor = RuleProcessor::new(FailingExecutor);
        let rules = vec![
            RuleDefinition::new("Down", "down", "1", "[x]", ""),
            RuleDefinition::new("Up", "up", "1", "[x] * 2", ""),
        ];

        let outcome = processor.run(&rules, &RunContext::default());
        assert_eq!(outcome.rules_failed, 1);
        assert_eq!(outcome.rules_processed, 1);
        assert_eq!(outcome.entry_count(), 1);
        assert_eq!(outcome.entries[0].calculated_value, 8.0);
        assert!(matches!(&outcome.issues[0], RunIssue::RuleFailed { rule, .. } if rule == "Down"));
    }

    #[test]
    fn test_evaluation_error_zeroes_value() {
        let processor = RuleProcessor::new(create_test_executor());
        let rule = RuleDefinition::new("Bad", "dataNAV", "[accountCode]", "[capstock] / 0", "");

        let outcome = processor.process_rule(&rule, &RunContext::default());
        assert_eq!(outcome.entries.len(), 2);
        assert!(outcome.entries.iter().all(|e| e.calculated_value == 0.0));
        assert_eq!(outcome.issues.len(), 2);
        assert!(matches!(
            &outcome.issues[0],
            RunIssue::ValueZeroed { ledger_account, .. } if ledger_account == "3002000120"
        ));
    }

    #[test]
    fn test_text_field_in_formula_is_zeroed() {
        let executor = MemoryExecutor::new().with_dataset(
            "t",
            records(json!([{"valuationDt": "d", "account": "A", "code": "X7"}])),
        );
        let processor = RuleProcessor::new(executor);
        let rule = RuleDefinition::new("R", "t", "ACC[code]", "[code] + 5", "");

        let outcome = processor.process_rule(&rule, &RunContext::default());
        assert_eq!(outcome.entries[0].ledger_account, "ACCX7");
        assert_eq!(outcome.entries[0].calculated_value, 0.0);
        assert!(matches!(
            &outcome.issues[0],
            RunIssue::ValueZeroed { error, .. } if error.contains("'code'")
        ));
    }

    #[test]
    fn test_missing_group_key_skips_row() {
        let executor = MemoryExecutor::new().with_dataset(
            "t",
            records(json!([
                {"valuationDt": "2024-01-31", "amount": 5},
                {"valuationDt": "2024-01-31", "account": "A", "amount": 1}
            ])),
        );
        let processor = RuleProcessor::new(executor);
        let rule = RuleDefinition::new("R", "t", "100", "[amount]", "");

        let outcome = processor.process_rule(&rule, &RunContext::default());
        assert_eq!(outcome.rows_read, 2);
        assert_eq!(outcome.entries.len(), 1);
        assert!(matches!(
            &outcome.issues[0],
            RunIssue::RowSkipped { row_index: 0, .. }
        ));
    }

    #[test]
    fn test_overlap_both_reads_alias() {
        let executor = MemoryExecutor::new().with_dataset(
            "t",
            records(json!([
                {"valuationDt": "d", "account": "A", "code": 7},
                {"valuationDt": "d", "account": "A", "code": 3}
            ])),
        );
        let processor = RuleProcessor::new(executor);
        let rule = RuleDefinition::new("R", "t", "ACC[code]", "[code]", "");

        let passthrough = processor.process_rule(&rule, &RunContext::default());
        assert_eq!(passthrough.entries[0].ledger_account, "ACC7");
        assert_eq!(passthrough.entries[0].calculated_value, 7.0);

        let both = RunContext::new(RunOptions {
            plan: PlanOptions {
                overlap: OverlapPolicy::Both,
                ..PlanOptions::default()
            },
            workers: 1,
        });
        let outcome = processor.process_rule(&rule, &both);
        assert_eq!(outcome.entries[0].ledger_account, "ACC7");
        assert_eq!(outcome.entries[0].calculated_value, 10.0);
    }

    #[test]
    fn test_parallel_run_keeps_submission_order() {
        let processor = RuleProcessor::new(create_test_executor());
        let rules: Vec<RuleDefinition> = (0..8)
            .map(|i| {
                RuleDefinition::new(
                    &format!("Rule{}", i),
                    "dataNAV",
                    &format!("ACC{}", i),
                    &format!("[capstock] * {}", i),
                    "",
                )
            })
            .collect();

        let sequential = processor.run(&rules, &RunContext::default());
        let parallel = processor.run(
            &rules,
            &RunContext::new(RunOptions {
                workers: 4,
                ..RunOptions::default()
            }),
        );

        let names = |o: &RunOutcome| -> Vec<(String, String)> {
            o.entries
                .iter()
                .map(|e| (e.rule_name.clone(), e.account.clone()))
                .collect()
        };
        assert_eq!(names(&sequential), names(&parallel));
        assert_eq!(parallel.entry_count(), 16);
    }

    #[test]
    fn test_entry_count_matches_summary() {
        let processor = RuleProcessor::new(create_test_executor());
        let rules = vec![
            RuleDefinition::new("Subs", "dataNAV", "3002000110", "[subscriptionBalance]", ""),
            RuleDefinition::new("ByCode", "dataNAV", "[accountCode]", "[capstock]", ""),
        ];
        let outcome = processor.run(&rules, &RunContext::default());
        let total: usize = outcome.summary().iter().map(|s| s.count).sum();
        assert_eq!(total, outcome.entry_count());
    }

    #[test]
    fn test_idempotency_hash_ignores_run() {
        let processor = RuleProcessor::new(create_test_executor());
        let rule = RuleDefinition::new("Subs", "dataNAV", "3002000110", "[subscriptionBalance]", "");
        let a = processor.process_rule(&rule, &RunContext::default());
        let b = processor.process_rule(&rule, &RunContext::default());
        assert_ne!(a.entries[0].entry_id, b.entries[0].entry_id);
        assert_eq!(
            a.entries[0].idempotency_hash(),
            b.entries[0].idempotency_hash()
        );
        assert_ne!(
            a.entries[0].idempotency_hash(),
            a.entries[1].idempotency_hash()
        );
    }

    #[test]
    fn test_idempotency_hash_field_boundaries() {
        let processor = RuleProcessor::new(create_test_executor());
        let rule = RuleDefinition::new("Subs", "dataNAV", "3002000110", "[subscriptionBalance]", "");
        let entry = processor.process_rule(&rule, &RunContext::default()).entries[0].clone();

        // "a|b" + "c" and "a" + "b|c" must not collide
        let mut left = entry.clone();
        left.rule_name = "a|b".to_string();
        left.valuation_dt = "c".to_string();
        let mut right = entry;
        right.rule_name = "a".to_string();
        right.valuation_dt = "b|c".to_string();
        assert_ne!(left.idempotency_hash(), right.idempotency_hash());
    }

    #[test]
    fn test_unreadable_rule_is_skipped_with_the_rest_running() {
        let processor = RuleProcessor::new(create_test_executor());
        let rules = vec![
            RuleDefinition::new("Good", "dataNAV", "1", "[capstock]", ""),
            RuleDefinition::from_value(json!({"ruleName": "Bad", "status": "archived"})),
        ];

        let outcome = processor.run_from_source(&rules, &RunContext::default()).unwrap();
        assert_eq!(outcome.rules_processed, 1);
        assert_eq!(outcome.rules_skipped, 1);
        assert_eq!(outcome.entry_count(), 2);
        assert!(matches!(
            &outcome.issues[0],
            RunIssue::RuleSkipped { rule, reason } if rule == "Bad" && reason.contains("could not be read")
        ));
    }

    #[test]
    fn test_entry_serializes_ledger_names() {
        let processor = RuleProcessor::new(create_test_executor());
        let rule = RuleDefinition::new("Subs", "dataNAV", "3002000110", "[subscriptionBalance]", "");
        let outcome = processor.process_rule(&rule, &RunContext::default());
        let value = serde_json::to_value(&outcome.entries[0]).unwrap();
        assert_eq!(value["eagleLedgerAcct"], json!("3002000110"));
        assert_eq!(value["ruleName"], json!("Subs"));
        assert_eq!(value["dataDefinition"], json!("[subscriptionBalance]"));
        assert_eq!(value["accountKind"], json!("static"));
    }
}
