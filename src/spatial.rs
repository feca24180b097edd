//! Per-room spatial index for viewport-scoped stroke retrieval.
//!
//! A uniform grid keyed by room: each stroke's bounding box is registered in
//! every grid cell it overlaps, and a viewport query unions the candidate
//! sets of the cells the viewport covers before exact intersection testing.
//! Sublinear for the common case (local viewport over a large canvas); a
//! viewport covering more cells than the room has strokes falls back to a
//! linear scan, so pathological viewports degrade to O(strokes), never worse.
//!
//! Results are ordered by `(created_at, stroke_id)` so every client renders
//! query results in the same order, and capped (default 1000 rows).
//!
//! The index has its own lock, independent of the rooms' engine locks, so
//! viewport queries never block operation ingestion. The engine updates the
//! index inside its per-room critical section: once version V is broadcast, a
//! query observes V's effect.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tokio::sync::RwLock;

use crate::protocol::BoundingBox;

/// Maximum strokes returned by a single viewport query.
pub const DEFAULT_RESULT_CAP: usize = 1000;

const DEFAULT_CELL_SIZE: f64 = 256.0;

/// Index tuning.
#[derive(Debug, Clone)]
pub struct SpatialConfig {
    /// Grid cell edge length in canvas units
    pub cell_size: f64,
    /// Viewport query row cap
    pub result_cap: usize,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
            result_cap: DEFAULT_RESULT_CAP,
        }
    }
}

/// A stroke as the index sees it: identity, extent, provenance.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedStroke {
    pub stroke_id: String,
    pub user_id: String,
    pub bbox: BoundingBox,
    /// Version of the operation that last touched this stroke
    pub version: i64,
    /// ms since epoch; drives the stable result ordering
    pub created_at: i64,
}

/// Viewport query result with timing metadata, serialized as-is for the
/// query response body.
#[derive(Debug, Clone, Serialize)]
pub struct ViewportResult {
    pub strokes: Vec<IndexedStroke>,
    /// Index traversal time in nanoseconds
    pub query_time: u64,
    pub result_count: usize,
    pub viewport: BoundingBox,
}

/// Index health counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpatialStats {
    pub total_strokes: usize,
    pub room_counts: HashMap<String, usize>,
}

#[derive(Default)]
struct RoomGrid {
    /// cell coordinate → stroke ids overlapping that cell
    cells: HashMap<(i64, i64), HashSet<String>>,
    strokes: HashMap<String, IndexedStroke>,
}

/// Room-partitioned uniform-grid index.
pub struct SpatialIndex {
    rooms: RwLock<HashMap<String, RoomGrid>>,
    config: SpatialConfig,
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(SpatialConfig::default())
    }
}

impl SpatialIndex {
    pub fn new(config: SpatialConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    fn cell_span(&self, bbox: &BoundingBox) -> (i64, i64, i64, i64) {
        let cs = self.config.cell_size;
        (
            (bbox.x1 / cs).floor() as i64,
            (bbox.y1 / cs).floor() as i64,
            (bbox.x2 / cs).floor() as i64,
            (bbox.y2 / cs).floor() as i64,
        )
    }

    /// Insert a stroke, or move it if already indexed (stroke_update).
    pub async fn upsert(&self, room_id: &str, stroke: IndexedStroke) {
        let mut rooms = self.rooms.write().await;
        let grid = rooms.entry(room_id.to_string()).or_default();

        if let Some(old) = grid.strokes.get(&stroke.stroke_id) {
            let old_bbox = old.bbox;
            self.unlink_cells(grid, &stroke.stroke_id, &old_bbox);
        }

        let (cx1, cy1, cx2, cy2) = self.cell_span(&stroke.bbox);
        for cx in cx1..=cx2 {
            for cy in cy1..=cy2 {
                grid.cells
                    .entry((cx, cy))
                    .or_default()
                    .insert(stroke.stroke_id.clone());
            }
        }
        grid.strokes.insert(stroke.stroke_id.clone(), stroke);
    }

    fn unlink_cells(&self, grid: &mut RoomGrid, stroke_id: &str, bbox: &BoundingBox) {
        let (cx1, cy1, cx2, cy2) = self.cell_span(bbox);
        for cx in cx1..=cx2 {
            for cy in cy1..=cy2 {
                if let Some(ids) = grid.cells.get_mut(&(cx, cy)) {
                    ids.remove(stroke_id);
                    if ids.is_empty() {
                        grid.cells.remove(&(cx, cy));
                    }
                }
            }
        }
    }

    /// Remove a stroke (stroke_delete). Returns whether it was indexed.
    pub async fn remove(&self, room_id: &str, stroke_id: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(grid) = rooms.get_mut(room_id) else {
            return false;
        };
        let Some(stroke) = grid.strokes.remove(stroke_id) else {
            return false;
        };
        let bbox = stroke.bbox;
        self.unlink_cells(grid, stroke_id, &bbox);
        true
    }

    /// Drop every stroke in a room (clear_all). Returns the count removed.
    pub async fn clear_room(&self, room_id: &str) -> usize {
        let mut rooms = self.rooms.write().await;
        let removed = rooms.remove(room_id).map_or(0, |grid| grid.strokes.len());
        if removed > 0 {
            log::info!("cleared {removed} strokes from room {room_id}");
        }
        removed
    }

    /// All strokes intersecting `viewport`, ordered by `(created_at,
    /// stroke_id)`, capped at the configured result limit.
    pub async fn query_viewport(&self, room_id: &str, viewport: BoundingBox) -> ViewportResult {
        let viewport = viewport.normalized();
        let start = Instant::now();
        let rooms = self.rooms.read().await;

        let mut strokes: Vec<IndexedStroke> = match rooms.get(room_id) {
            Some(grid) => {
                let (cx1, cy1, cx2, cy2) = self.cell_span(&viewport);
                let cell_count = (cx2 - cx1 + 1).saturating_mul(cy2 - cy1 + 1);

                if cell_count as usize > grid.strokes.len() {
                    // Viewport wider than the populated grid: scan strokes
                    grid.strokes
                        .values()
                        .filter(|s| s.bbox.intersects(&viewport))
                        .cloned()
                        .collect()
                } else {
                    let mut candidates: HashSet<&String> = HashSet::new();
                    for cx in cx1..=cx2 {
                        for cy in cy1..=cy2 {
                            if let Some(ids) = grid.cells.get(&(cx, cy)) {
                                candidates.extend(ids);
                            }
                        }
                    }
                    candidates
                        .into_iter()
                        .filter_map(|id| grid.strokes.get(id))
                        .filter(|s| s.bbox.intersects(&viewport))
                        .cloned()
                        .collect()
                }
            }
            None => Vec::new(),
        };
        drop(rooms);

        strokes.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.stroke_id.cmp(&b.stroke_id))
        });
        strokes.truncate(self.config.result_cap);

        ViewportResult {
            result_count: strokes.len(),
            strokes,
            query_time: start.elapsed().as_nanos() as u64,
            viewport,
        }
    }

    /// All strokes whose bounding box touches the circle (selection tools).
    pub async fn query_circle(
        &self,
        room_id: &str,
        center_x: f64,
        center_y: f64,
        radius: f64,
    ) -> Vec<IndexedStroke> {
        let enclosing = BoundingBox::new(
            center_x - radius,
            center_y - radius,
            center_x + radius,
            center_y + radius,
        );
        let coarse = self.query_viewport(room_id, enclosing).await;

        let radius_sq = radius * radius;
        coarse
            .strokes
            .into_iter()
            .filter(|s| {
                // Distance from circle center to the closest point of the box
                let cx = center_x.clamp(s.bbox.x1, s.bbox.x2);
                let cy = center_y.clamp(s.bbox.y1, s.bbox.y2);
                let dx = center_x - cx;
                let dy = center_y - cy;
                dx * dx + dy * dy <= radius_sq
            })
            .collect()
    }

    /// Per-room stroke counts for health endpoints. Observability only.
    pub async fn stats(&self) -> SpatialStats {
        let rooms = self.rooms.read().await;
        let mut stats = SpatialStats::default();
        for (room_id, grid) in rooms.iter() {
            stats.total_strokes += grid.strokes.len();
            stats.room_counts.insert(room_id.clone(), grid.strokes.len());
        }
        stats
    }
}
