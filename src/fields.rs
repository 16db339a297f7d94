// 🔖 Field References - Bracket-delimited names inside templates
// Shared by the formula evaluator, the account resolver and the plan builder

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// Anything that can answer "what is the value of field X" for one data row
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<&Value>;
}

impl FieldSource for Map<String, Value> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl FieldSource for HashMap<String, Value> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl FieldSource for BTreeMap<String, Value> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Text form of a scalar row value; `None` for null.
///
/// Integral numbers print without a fractional part so that account codes
/// stored as numbers (`200.0`) still compose as `200`.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else if let Some(u) = n.as_u64() {
                Some(u.to_string())
            } else {
                let f = n.as_f64().unwrap_or(0.0);
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    Some(format!("{}", f as i64))
                } else {
                    Some(f.to_string())
                }
            }
        }
        other => Some(other.to_string()),
    }
}

/// Extract field names from a template such as `"[subscriptionBalance] * -1"`.
///
/// Names are returned in order of first appearance, without duplicates.
/// Brackets never nest: the name runs from `[` to the next `]`. An opening
/// bracket with no closing bracket matches nothing, and `[]` is ignored.
pub fn extract_fields(template: &str) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();

    for span in bracket_spans(template) {
        let name = &template[span.start..span.end];
        if !fields.iter().any(|f| f == name) {
            fields.push(name.to_string());
        }
    }

    fields
}

/// True when the template contains at least one well-formed `[name]`.
pub fn has_field_refs(template: &str) -> bool {
    !bracket_spans(template).is_empty()
}

/// Byte range of a name between brackets (brackets excluded)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FieldSpan {
    pub start: usize,
    pub end: usize,
}

impl FieldSpan {
    /// Range including the surrounding brackets
    pub fn outer(&self) -> std::ops::Range<usize> {
        (self.start - 1)..(self.end + 1)
    }
}

/// Locate every well-formed, non-empty `[...]` span, left to right.
pub(crate) fn bracket_spans(template: &str) -> Vec<FieldSpan> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(open) = template[cursor..].find('[') {
        let start = cursor + open + 1;
        match template[start..].find(']') {
            Some(close) => {
                let end = start + close;
                let name = &template[start..end];
                // "[a[b]" matches "a[b" in the naive reading; we restart at the inner '['
                if let Some(inner) = name.rfind('[') {
                    cursor = start + inner;
                    continue;
                }
                if !name.is_empty() {
                    spans.push(FieldSpan { start, end });
                }
                cursor = end + 1;
            }
            None => break,
        }
    }

    spans
}

// ============================================================================
// TESTS
// ============================================================================
