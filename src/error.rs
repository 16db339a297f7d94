// ⚠️ Error types for the sub-ledger engine
//
// Typed errors for the pure components; I/O boundaries use anyhow.

use thiserror::Error;

/// Why a formula could not be turned into a number
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("empty formula")]
    Empty,

    #[error("unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),

    #[error("identifier '{0}' is not an allowed function")]
    UnknownIdentifier(String),

    #[error("unexpected token '{found}' at {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("unexpected end of formula")]
    UnexpectedEnd,

    #[error("expression nested too deeply")]
    TooDeep,

    #[error("{function} does not take {found} argument(s)")]
    Arity { function: &'static str, found: usize },

    #[error("field '{0}' does not hold a number")]
    NonNumericField(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("{function} is undefined for {value}")]
    Domain { function: &'static str, value: f64 },

    #[error("result is not a finite number")]
    NonFinite,
}

/// Problems with a rule definition itself
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule could not be read: {0}")]
    Malformed(String),

    #[error("rule is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("rule '{name}' is {status}, only active rules are processed")]
    NotActive { name: String, status: String },
}

/// A result row that cannot be turned into a ledger entry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    #[error("result row is missing group key field '{0}'")]
    MissingGroupKey(String),
}

/// Configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in config file")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}
