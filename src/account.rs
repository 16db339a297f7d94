// 🏦 Account Templates - Static or row-dependent ledger accounts
//
//   "3002000110"                    -> static, returned unchanged
//   "[accountCode]"                 -> dynamic, the field's value
//   "300[categoryCode]001"          -> dynamic, literal text kept around the value
//   "[accountType]_[categoryCode]_LEDGER"

use crate::fields::{bracket_spans, value_text, FieldSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Placeholder used when a referenced field is missing or null
pub const UNKNOWN_FIELD: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    Static,
    Dynamic,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Static => "static",
            AccountKind::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    FieldRef(String),
}

/// Parsed once per rule, resolved once per row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountTemplate {
    Static(String),
    Dynamic(Vec<Segment>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAccount {
    pub account: String,
    pub kind: AccountKind,
}

impl AccountTemplate {
    pub fn parse(template: &str) -> Self {
        let spans = bracket_spans(template);
        if spans.is_empty() {
            return AccountTemplate::Static(template.to_string());
        }

        let mut segments = Vec::new();
        let mut cursor = 0;
        for span in spans {
            let outer = span.outer();
            if outer.start > cursor {
                segments.push(Segment::Literal(template[cursor..outer.start].to_string()));
            }
            segments.push(Segment::FieldRef(template[span.start..span.end].to_string()));
            cursor = outer.end;
        }
        if cursor < template.len() {
            segments.push(Segment::Literal(template[cursor..].to_string()));
        }

        AccountTemplate::Dynamic(segments)
    }

    pub fn kind(&self) -> AccountKind {
        match self {
            AccountTemplate::Static(_) => AccountKind::Static,
            AccountTemplate::Dynamic(_) => AccountKind::Dynamic,
        }
    }

    /// Fields the query must carry through for this template, first appearance order
    pub fn fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = Vec::new();
        if let AccountTemplate::Dynamic(segments) = self {
            for segment in segments {
                if let Segment::FieldRef(name) = segment {
                    if !fields.contains(name) {
                        fields.push(name.clone());
                    }
                }
            }
        }
        fields
    }

    pub fn resolve<S: FieldSource + ?Sized>(&self, row: &S) -> ResolvedAccount {
        self.resolve_with(|name| row.field(name))
    }

    /// Resolve with a custom lookup, used when a field is read under an alias
    pub fn resolve_with<'a, F>(&self, lookup: F) -> ResolvedAccount
    where
        F: Fn(&str) -> Option<&'a Value>,
    {
        match self {
            AccountTemplate::Static(account) => ResolvedAccount {
                account: account.clone(),
                kind: AccountKind::Static,
            },
            AccountTemplate::Dynamic(segments) => {
                let mut account = String::new();
                for segment in segments {
                    match segment {
                        Segment::Literal(text) => account.push_str(text),
                        Segment::FieldRef(name) => match lookup(name) {
                            Some(value) => account.push_str(&value_to_account_text(value)),
                            None => account.push_str(UNKNOWN_FIELD),
                        },
                    }
                }
                ResolvedAccount {
                    account,
                    kind: AccountKind::Dynamic,
                }
            }
        }
    }
}

/// Text form of a row value inside an account identifier
pub fn value_to_account_text(value: &Value) -> String {
    value_text(value).unwrap_or_else(|| UNKNOWN_FIELD.to_string())
}

/// Resolve a template string directly
pub fn resolve<S: FieldSource + ?Sized>(template: &str, row: &S) -> ResolvedAccount {
    AccountTemplate::parse(template).resolve(row)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_static_account() {
        let data = row(json!({"accountCode": "3002000120"}));
        let resolved = resolve("3002000110", &data);
        assert_eq!(resolved.account, "3002000110");
        assert_eq!(resolved.kind, AccountKind::Static);

        let empty = resolve("3002000110", &Map::new());
        assert_eq!(empty.account, "3002000110");
    }

    #[test]
    fn test_pure_field_reference() {
        let data = row(json!({"accountCode": "3002000120"}));
        let resolved = resolve("[accountCode]", &data);
        assert_eq!(resolved.account, "3002000120");
        assert_eq!(resolved.kind, AccountKind::Dynamic);
    }

    #[test]
    fn test_prefix_and_suffix() {
        let data = row(json!({"categoryCode": "200"}));
        assert_eq!(resolve("300[categoryCode]001", &data).account, "300200001");
    }

    #[test]
    fn test_multiple_fields() {
        let data = row(json!({"accountType": "ASSET", "categoryCode": "200"}));
        assert_eq!(
            resolve("[accountType]_[categoryCode]_LEDGER", &data).account,
            "ASSET_200_LEDGER"
        );
    }

    #[test]
    fn test_missing_and_null_fields() {
        let data = row(json!({"accountType": null}));
        assert_eq!(
            resolve("[accountType]_[categoryCode]", &data).account,
            "UNKNOWN_UNKNOWN"
        );
    }

    #[test]
    fn test_numeric_values() {
        let data = row(json!({"code": 200, "ratio": 1.5, "whole": 300.0}));
        assert_eq!(resolve("A[code]", &data).account, "A200");
        assert_eq!(resolve("[ratio]", &data).account, "1.5");
        assert_eq!(resolve("[whole]", &data).account, "300");
    }

    #[test]
    fn test_parse_segments() {
        let template = AccountTemplate::parse("300[categoryCode]001");
        assert_eq!(
            template,
            AccountTemplate::Dynamic(vec![
                Segment::Literal("300".to_string()),
                Segment::FieldRef("categoryCode".to_string()),
                Segment::Literal("001".to_string()),
            ])
        );
        assert_eq!(template.fields(), vec!["categoryCode"]);
        assert!(AccountTemplate::parse("3002000110").fields().is_empty());
    }

    #[test]
    fn test_unterminated_bracket_is_literal() {
        let data = row(json!({"a": "X"}));
        let resolved = resolve("CASH_[a", &data);
        assert_eq!(resolved.account, "CASH_[a");
        assert_eq!(resolved.kind, AccountKind::Static);
    }
}
