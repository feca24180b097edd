//! Operation model and wire shapes for canvas synchronization.
//!
//! Every edit travels as an [`Operation`]: a typed, attributable intent with a
//! schemaless JSON payload whose shape depends on the kind (`stroke_id`,
//! `points`, `color`, `x`/`y`, `client_version`, ...). The transport decodes
//! client frames into `Operation` values and hands them to the engine; the
//! engine hands back a [`TransformResult`] for broadcast.
//!
//! Wire format is JSON throughout — payloads are open maps, and clients in
//! other languages must be able to read every field without a schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::SystemTime;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

// ───────────────────────────────────────────────────────────────────
// Geometry
// ───────────────────────────────────────────────────────────────────

/// 2D position in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle, `x1 <= x2` and `y1 <= y2` after [`normalized`].
///
/// Degenerate (zero-area) boxes are legal — a single-point stroke still
/// occupies a position and must be indexable.
///
/// [`normalized`]: BoundingBox::normalized
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    /// Create a box, normalizing corner order.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }.normalized()
    }

    /// Reorder corners so `x1 <= x2` and `y1 <= y2`.
    pub fn normalized(self) -> Self {
        Self {
            x1: self.x1.min(self.x2),
            y1: self.y1.min(self.y2),
            x2: self.x1.max(self.x2),
            y2: self.y1.max(self.y2),
        }
    }

    /// Tight bounds of a point set. `None` for an empty set.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = Self {
            x1: first.x,
            y1: first.y,
            x2: first.x,
            y2: first.y,
        };
        for p in &points[1..] {
            bbox.x1 = bbox.x1.min(p.x);
            bbox.y1 = bbox.y1.min(p.y);
            bbox.x2 = bbox.x2.max(p.x);
            bbox.y2 = bbox.y2.max(p.y);
        }
        Some(bbox)
    }

    /// Axis-aligned intersection test. Touching edges count as intersecting.
    /// False when any coordinate is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        // NaN compares false everywhere, which would make a non-finite box
        // match every viewport; it matches nothing instead.
        if !self.is_finite() || !other.is_finite() {
            return false;
        }
        !(self.x2 < other.x1 || self.x1 > other.x2 || self.y2 < other.y1 || self.y1 > other.y2)
    }

    pub fn width(&self) -> f64 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f64 {
        self.y2 - self.y1
    }
}

// ───────────────────────────────────────────────────────────────────
// Operation
// ───────────────────────────────────────────────────────────────────

/// Kinds of operation a client can submit, plus [`Noop`](OpKind::Noop) which
/// only ever appears as transform output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    StrokeCreate,
    StrokeUpdate,
    StrokeDelete,
    CursorMove,
    Selection,
    ClearAll,
    Noop,
}

impl OpKind {
    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::StrokeCreate => "stroke_create",
            OpKind::StrokeUpdate => "stroke_update",
            OpKind::StrokeDelete => "stroke_delete",
            OpKind::CursorMove => "cursor_move",
            OpKind::Selection => "selection",
            OpKind::ClearAll => "clear_all",
            OpKind::Noop => "noop",
        }
    }

    /// Whether clients may submit this kind directly.
    pub fn client_submittable(&self) -> bool {
        !matches!(self, OpKind::Noop)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single versioned, attributable edit intent.
///
/// `version == 0` means "pending": the operation has not been admitted by the
/// engine yet. Once admitted, `version` is the room-scoped sequence number all
/// clients converge on and `applied_at` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Globally unique id; also used for duplicate-delivery detection and for
    /// "is this my own echoed operation" checks on clients.
    #[serde(default)]
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub room_id: String,
    pub user_id: String,
    /// Per-room sequence number, assigned at admission. 0 until then.
    #[serde(default)]
    pub version: i64,
    /// Kind-dependent payload.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Creation time, ms since epoch. Re-stamped with the server clock at
    /// admission; retention and result ordering depend on it, so a client
    /// value is never trusted.
    #[serde(default)]
    pub created_at: i64,
    /// Server wall clock at durable admission, ms since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<i64>,
    /// Ids of admitted operations this one was transformed against, in
    /// application order. Audit trail, not needed for correctness.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformed_from: Vec<Uuid>,
}

impl Operation {
    /// Build a pending operation with the given payload.
    pub fn new(
        kind: OpKind,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            room_id: room_id.into(),
            user_id: user_id.into(),
            version: 0,
            data,
            created_at: now_ms(),
            applied_at: None,
            transformed_from: Vec::new(),
        }
    }

    /// Target stroke id, for kinds that carry one.
    pub fn stroke_id(&self) -> Option<&str> {
        self.data.get("stroke_id").and_then(Value::as_str)
    }

    /// Highest version the submitting client had seen. Defaults to 0, which
    /// makes the whole recent window concurrent with this operation.
    pub fn client_version(&self) -> i64 {
        match self.data.get("client_version") {
            Some(v) => v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)).unwrap_or(0),
            None => 0,
        }
    }

    /// Client-embedded edit timestamp (ms), used for same-target arbitration.
    pub fn timestamp_ms(&self) -> Option<f64> {
        self.data.get("timestamp").and_then(Value::as_f64)
    }

    /// Cursor position for `cursor_move` payloads.
    pub fn cursor_point(&self) -> Option<Point> {
        let x = self.data.get("x").and_then(Value::as_f64)?;
        let y = self.data.get("y").and_then(Value::as_f64)?;
        Some(Point::new(x, y))
    }

    /// Selected stroke ids for `selection` payloads.
    pub fn selected_stroke_ids(&self) -> Vec<String> {
        match self.data.get("stroke_ids").and_then(Value::as_array) {
            Some(ids) => ids
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Viewport bounds a client reports alongside its edits, if any.
    pub fn viewport_bounds(&self) -> Option<BoundingBox> {
        parse_bbox(self.data.get("viewport")?)
    }

    /// Geometric extent of the stroke this operation describes.
    ///
    /// Prefers an explicit `bbox` object, otherwise derives tight bounds from
    /// the `points` array (`[x, y]` pairs or `{x, y}` objects).
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        if let Some(bbox) = self.data.get("bbox").and_then(parse_bbox) {
            return Some(bbox);
        }
        let points: Vec<Point> = self
            .data
            .get("points")?
            .as_array()?
            .iter()
            .filter_map(parse_point)
            .collect();
        BoundingBox::from_points(&points)
    }

    /// Reject malformed operations before they reach the engine.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.kind.client_submittable() {
            return Err(ValidationError::NotClientSubmittable(self.kind));
        }
        if self.room_id.is_empty() {
            return Err(ValidationError::MissingField("room_id"));
        }
        if self.user_id.is_empty() {
            return Err(ValidationError::MissingField("user_id"));
        }
        match self.kind {
            OpKind::StrokeCreate => {
                if self.stroke_id().is_none() {
                    return Err(ValidationError::MissingData(self.kind, "stroke_id"));
                }
                match self.bounding_box() {
                    None => return Err(ValidationError::MissingData(self.kind, "points")),
                    Some(bbox) if !bbox.is_finite() => {
                        return Err(ValidationError::InvalidData(self.kind, "points"))
                    }
                    Some(_) => {}
                }
            }
            OpKind::StrokeUpdate => {
                if self.stroke_id().is_none() {
                    return Err(ValidationError::MissingData(self.kind, "stroke_id"));
                }
                if let Some(bbox) = self.bounding_box() {
                    if !bbox.is_finite() {
                        return Err(ValidationError::InvalidData(self.kind, "points"));
                    }
                }
            }
            OpKind::StrokeDelete => {
                if self.stroke_id().is_none() {
                    return Err(ValidationError::MissingData(self.kind, "stroke_id"));
                }
            }
            OpKind::CursorMove => match self.cursor_point() {
                None => return Err(ValidationError::MissingData(self.kind, "x/y")),
                Some(p) if !(p.x.is_finite() && p.y.is_finite()) => {
                    return Err(ValidationError::InvalidData(self.kind, "x/y"))
                }
                Some(_) => {}
            },
            OpKind::Selection => {
                if let Some(ids) = self.data.get("stroke_ids") {
                    if !ids.is_array() {
                        return Err(ValidationError::InvalidData(self.kind, "stroke_ids"));
                    }
                }
            }
            OpKind::ClearAll | OpKind::Noop => {}
        }
        Ok(())
    }
}

fn parse_point(v: &Value) -> Option<Point> {
    if let Some(pair) = v.as_array() {
        let x = pair.first()?.as_f64()?;
        let y = pair.get(1)?.as_f64()?;
        return Some(Point::new(x, y));
    }
    let x = v.get("x")?.as_f64()?;
    let y = v.get("y")?.as_f64()?;
    Some(Point::new(x, y))
}

fn parse_bbox(v: &Value) -> Option<BoundingBox> {
    Some(
        BoundingBox {
            x1: v.get("x1")?.as_f64()?,
            y1: v.get("y1")?.as_f64()?,
            x2: v.get("x2")?.as_f64()?,
            y2: v.get("y2")?.as_f64()?,
        }
        .normalized(),
    )
}

/// Engine → caller result, serialized as-is for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformResult {
    pub operation: Operation,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransformResult {
    pub fn ok(operation: Operation) -> Self {
        Self {
            operation,
            success: true,
            error: None,
        }
    }

    pub fn failed(operation: Operation, error: impl Into<String>) -> Self {
        Self {
            operation,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Validation errors, reported to the submitting client only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Kind is server-internal (`noop`).
    NotClientSubmittable(OpKind),
    /// A required top-level field is empty or absent.
    MissingField(&'static str),
    /// The payload lacks a field this kind requires.
    MissingData(OpKind, &'static str),
    /// A payload field has the wrong shape.
    InvalidData(OpKind, &'static str),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotClientSubmittable(kind) => {
                write!(f, "operation kind {kind} cannot be submitted by clients")
            }
            Self::MissingField(field) => write!(f, "missing required field: {field}"),
            Self::MissingData(kind, field) => {
                write!(f, "{kind} operation requires data.{field}")
            }
            Self::InvalidData(kind, field) => {
                write!(f, "{kind} operation has malformed data.{field}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}
