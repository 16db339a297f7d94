// 📊 Summary - Per-account totals over ledger entries
// Pure fold, recomputable from the entry list at any time

use crate::account::AccountKind;
use crate::processor::LedgerEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub ledger_account: String,
    pub kind: AccountKind,
    /// Rule of the first entry booked to this account
    pub rule_name: String,
    pub count: usize,
    pub total: f64,
    /// Account template, for dynamic accounts only
    pub source_template: Option<String>,
}

/// Group entries by resolved ledger account, in order of first appearance
pub fn summarize(entries: &[LedgerEntry]) -> Vec<AccountSummary> {
    let mut summaries: Vec<AccountSummary> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();

    for entry in entries {
        let slot = *index.entry(entry.ledger_account.as_str()).or_insert_with(|| {
            summaries.push(AccountSummary {
                ledger_account: entry.ledger_account.clone(),
                kind: entry.account_kind,
                rule_name: entry.rule_name.clone(),
                count: 0,
                total: 0.0,
                source_template: match entry.account_kind {
                    AccountKind::Dynamic => Some(entry.account_template.clone()),
                    AccountKind::Static => None,
                },
            });
            summaries.len() - 1
        });

        summaries[slot].count += 1;
        summaries[slot].total += entry.calculated_value;
    }

    summaries
}

/// Fixed-width processing report
pub fn render_summary(entries: &[LedgerEntry], generated_at: DateTime<Utc>) -> String {
    if entries.is_empty() {
        return "No results to summarize".to_string();
    }

    let rule = "=".repeat(60);
    let mut report = String::new();
    report.push_str(&format!("\n{}\n", rule));
    report.push_str("DYNAMIC SUB-LEDGER PROCESSING SUMMARY\n");
    report.push_str(&format!("{}\n", rule));
    report.push_str(&format!("Total Entries Generated: {}\n", entries.len()));
    report.push_str(&format!(
        "Processing Date: {}\n\n",
        generated_at.format("%Y-%m-%d %H:%M:%S")
    ));
    report.push_str(&format!(
        "{:<15} {:<20} {:<8} {:<15}\n",
        "Ledger Account", "Rule Name", "Count", "Total Value"
    ));
    report.push_str(&format!("{}\n", "-".repeat(60)));

    for summary in summarize(entries) {
        report.push_str(&format!(
            "{:<15} {:<20} {:<8} {:<15}\n",
            summary.ledger_account,
            summary.rule_name,
            summary.count,
            format_amount(summary.total)
        ));
    }

    report
}

/// Two decimals with thousands separators: 1234567.891 -> "1,234,567.89"
pub fn format_amount(value: f64) -> String {
    let fixed = format!("{:.2}", value.abs());
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if value < 0.0 { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, frac_part)
}

// ============================================================================
// TESTS
// ============================================================================
