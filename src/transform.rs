//! Pairwise operation-transform rules.
//!
//! Strokes are independent, uniquely identified objects, so most operation
//! pairs simply do not interact; only same-target updates and deletes need
//! arbitration. The rule table is deliberately total: any pair it does not
//! name passes through unchanged.
//!
//! | incoming        | applied        | rule                                   |
//! |-----------------|----------------|----------------------------------------|
//! | stroke_create   | stroke_create  | no interaction                         |
//! | stroke_update   | stroke_update  | same target: newer timestamp wins      |
//! | stroke_delete   | stroke_update  | delete wins, incoming unchanged        |
//! | stroke_update   | stroke_delete  | same target: incoming becomes noop     |
//! | selection       | stroke_delete  | deleted id pruned from the selection   |
//! | cursor_move     | any            | cursors never conflict with content    |
//! | clear_all       | any non-clear  | clear dominates, incoming unchanged    |
//! | anything else   |                | pass-through                           |
//!
//! This module is pure and stateless so clients can mirror the exact same
//! table for optimistic local application. [`TRANSFORM_RULES_VERSION`] is
//! bumped on any semantic change so client and server tables never drift
//! silently.

use serde_json::Value;
use uuid::Uuid;

use crate::protocol::{OpKind, Operation};

/// Version of the rule table. Clients applying optimistic local transforms
/// must advertise the version they implement.
pub const TRANSFORM_RULES_VERSION: u32 = 1;

/// Transformation failures. These abort the incoming operation only; the
/// room's version counter and other clients are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// An update/delete arbitration needed a stroke id that was absent.
    MissingStrokeId { op: Uuid, kind: OpKind },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingStrokeId { op, kind } => {
                write!(f, "{kind} operation {op} is missing data.stroke_id")
            }
        }
    }
}

impl std::error::Error for TransformError {}

/// Transform `incoming` against one already-admitted operation.
///
/// `applied` holds a version; `incoming` does not yet. The result is the
/// incoming operation adjusted so that applying it after `applied` preserves
/// the submitting client's intent.
pub fn transform_pair(
    mut incoming: Operation,
    applied: &Operation,
) -> Result<Operation, TransformError> {
    match (incoming.kind, applied.kind) {
        // Once discarded, stays discarded.
        (OpKind::Noop, _) => Ok(incoming),

        // Distinct strokes by construction.
        (OpKind::StrokeCreate, OpKind::StrokeCreate) => Ok(incoming),

        (OpKind::StrokeUpdate, OpKind::StrokeUpdate) => {
            if !same_target(&incoming, applied)? {
                return Ok(incoming);
            }
            // Last-write-wins on the client edit timestamp. A missing
            // timestamp loses to a present one; two absent timestamps keep
            // the already-admitted operation.
            let incoming_ts = incoming.timestamp_ms();
            let applied_ts = applied.timestamp_ms();
            let applied_not_older = match (incoming_ts, applied_ts) {
                (Some(a), Some(b)) => b >= a,
                (None, _) => true,
                (Some(_), None) => false,
            };
            if applied_not_older {
                incoming.kind = OpKind::Noop;
            }
            Ok(incoming)
        }

        // Delete wins regardless of order.
        (OpKind::StrokeDelete, OpKind::StrokeUpdate) => Ok(incoming),
        (OpKind::StrokeUpdate, OpKind::StrokeDelete) => {
            if same_target(&incoming, applied)? {
                incoming.kind = OpKind::Noop;
            }
            Ok(incoming)
        }

        // A selection of a stroke deleted concurrently would dangle on every
        // client; prune the dead id. A selection emptied this way is dropped.
        (OpKind::Selection, OpKind::StrokeDelete) => {
            let deleted = applied.stroke_id().ok_or(TransformError::MissingStrokeId {
                op: applied.id,
                kind: applied.kind,
            })?;
            let ids = incoming.selected_stroke_ids();
            if !ids.is_empty() && ids.iter().any(|id| id == deleted) {
                let kept: Vec<Value> = ids
                    .into_iter()
                    .filter(|id| id != deleted)
                    .map(Value::String)
                    .collect();
                if kept.is_empty() {
                    incoming.kind = OpKind::Noop;
                } else {
                    incoming.data.insert("stroke_ids".into(), Value::Array(kept));
                }
            }
            Ok(incoming)
        }

        // Cursors never conflict with content operations.
        (OpKind::CursorMove, _) => Ok(incoming),

        // Clear dominates; clients must treat clear_all as overriding any
        // concurrent content operation they applied optimistically.
        (OpKind::ClearAll, applied_kind) if applied_kind != OpKind::ClearAll => Ok(incoming),

        // Includes concurrent clear_all pairs: idempotent, last one wins.
        _ => Ok(incoming),
    }
}

/// Fold `incoming` through every concurrent operation in version order,
/// recording the ids it was transformed against.
pub fn transform_chain<'a>(
    mut incoming: Operation,
    concurrent: impl IntoIterator<Item = &'a Operation>,
) -> Result<Operation, TransformError> {
    for applied in concurrent {
        incoming = transform_pair(incoming, applied)?;
        incoming.transformed_from.push(applied.id);
    }
    Ok(incoming)
}

fn same_target(a: &Operation, b: &Operation) -> Result<bool, TransformError> {
    let id_a = a.stroke_id().ok_or(TransformError::MissingStrokeId {
        op: a.id,
        kind: a.kind,
    })?;
    let id_b = b.stroke_id().ok_or(TransformError::MissingStrokeId {
        op: b.id,
        kind: b.kind,
    })?;
    Ok(id_a == id_b)
}
