//! Boundary to the external sync-rules evaluator.
//!
//! The evaluator itself (sync-rule compilation and row evaluation) is out of
//! scope for this crate; it is assumed to exist and is consumed only
//! through the two pure operations below, grounded in the teacher's
//! `EngineHandler` trait boundary pattern (`engines/handler.rs`) that keeps
//! storage decoupled from the thing producing rows.

use crate::lookup::LookupBytes;
use crate::source_table::SourceTable;
use crate::types::Bucket;
use serde_json::Value as JsonValue;

/// A CDC record passed to the evaluator: either the new row image (INSERT/
/// UPDATE) or `None` for a DELETE, where only `before` is meaningful.
#[derive(Debug, Clone)]
pub struct EvaluationInput<'a> {
    pub source_table: &'a SourceTable,
    pub record: &'a JsonValue,
}

/// One row the evaluator routed to a bucket as sync data.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedRow {
    pub bucket: Bucket,
    pub output_table: String,
    pub id: String,
    pub data: JsonValue,
}

/// One parameter-lookup row the evaluator produced for a source row.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatedParameters {
    pub lookup: LookupBytes,
    pub bucket_parameters: Vec<JsonValue>,
}

/// A single source row failed sync-rule evaluation. Carried as a value
/// alongside successful evaluations rather than aborting the whole row;
/// the core logs it and moves on (§4.3, §7).
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationError {
    pub message: String,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        EvaluationError {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EvaluationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// One evaluator output: a routed row, or an error for that one row.
pub type RowResult = Result<EvaluatedRow, EvaluationError>;
/// One parameter-evaluation output: a lookup row, or an error for that row.
pub type ParameterResult = Result<EvaluatedParameters, EvaluationError>;

/// Pure boundary to the external sync-rules evaluator. Implementations are
/// expected to be deterministic for a fixed sync-rule parse: the same
/// `(source_table, record)` always yields the same output set.
pub trait Evaluator: Send + Sync {
    /// Evaluate a data row against the sync rules, producing zero or more
    /// `(bucket, output_row)` pairs (or per-row errors).
    fn evaluate_row(&self, input: EvaluationInput<'_>) -> Vec<RowResult>;

    /// Evaluate a parameter row, producing zero or more lookup tuples (or
    /// per-row errors).
    fn evaluate_parameter_row(&self, input: EvaluationInput<'_>) -> Vec<ParameterResult>;
}

/// An evaluator with no sync rules: every row is dropped. Useful as a
/// default/no-op implementation in tests and for source tables that sync
/// neither data nor parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvaluator;

impl Evaluator for NullEvaluator {
    fn evaluate_row(&self, _input: EvaluationInput<'_>) -> Vec<RowResult> {
        Vec::new()
    }

    fn evaluate_parameter_row(&self, _input: EvaluationInput<'_>) -> Vec<ParameterResult> {
        Vec::new()
    }
}
