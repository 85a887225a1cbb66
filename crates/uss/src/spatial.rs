//! In-memory R-tree indexes over bounded airspace entities.
//!
//! Envelopes are axis-aligned WGS84 rectangles stored as
//! `(x = lng, y = lat)`; geo-fence source bounds already arrive in
//! `(lng, lat)` order and are inserted unchanged. Indexes are purely
//! in-memory: `clear` replaces the tree wholesale, and nothing is ever
//! persisted to disk, so no state can leak across workers.

use chrono::{Duration, Utc};
use rstar::{AABB, RTree, RTreeObject};
use tracing::warn;

/// An indexed bounding box with an activity window and a caller payload.
#[derive(Debug, Clone)]
pub struct IndexedBox<M> {
    pub id: u64,
    pub bounds: [f64; 4],
    pub meta: M,
}

impl<M> RTreeObject for IndexedBox<M> {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds[0], self.bounds[1]],
            [self.bounds[2], self.bounds[3]],
        )
    }
}

impl<M> PartialEq for IndexedBox<M> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.bounds == other.bounds
    }
}

/// A source entity whose bounds are serialized as a comma-separated string.
#[derive(Debug, Clone)]
pub struct SpatialEntity {
    pub id: String,
    pub bounds: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Generic in-memory box index. One component owns each instance and
/// serializes operations on it.
pub struct BoxIndex<M> {
    tree: RTree<IndexedBox<M>>,
}

impl<M: Clone> BoxIndex<M> {
    #[must_use]
    pub fn new() -> Self {
        Self { tree: RTree::new() }
    }

    pub fn insert(&mut self, id: u64, bounds: [f64; 4], meta: M) {
        self.tree.insert(IndexedBox { id, bounds, meta });
    }

    /// Remove the entry with this `(id, bounds)` pair. Returns whether an
    /// entry was removed.
    pub fn delete(&mut self, id: u64, bounds: [f64; 4]) -> bool {
        let envelope = AABB::from_corners([bounds[0], bounds[1]], [bounds[2], bounds[3]]);
        let found = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .find(|entry| entry.id == id && entry.bounds == bounds)
            .cloned();
        match found {
            Some(entry) => self.tree.remove(&entry).is_some(),
            None => false,
        }
    }

    /// Discard the current tree and index `entities` from scratch. Bounds
    /// are parsed from the comma-separated string on each entity; malformed
    /// entries are skipped with a warning. Entities without an explicit
    /// window get a synthetic `(now - 1 day, now + 1 day)` one.
    pub fn rebuild<I, F>(&mut self, entities: I, to_meta: F)
    where
        I: IntoIterator<Item = SpatialEntity>,
        F: Fn(&SpatialEntity, &str, &str) -> M,
    {
        self.clear();
        let present = Utc::now();
        let synthetic_start = (present - Duration::days(1)).to_rfc3339();
        let synthetic_end = (present + Duration::days(1)).to_rfc3339();

        for (enumerated_id, entity) in entities.into_iter().enumerate() {
            let Some(bounds) = parse_bounds(&entity.bounds) else {
                warn!(id = %entity.id, bounds = %entity.bounds, "skipping entity with malformed bounds");
                continue;
            };
            let start = entity.start_date.clone().unwrap_or_else(|| synthetic_start.clone());
            let end = entity.end_date.clone().unwrap_or_else(|| synthetic_end.clone());
            let meta = to_meta(&entity, &start, &end);
            self.insert(enumerated_id as u64, bounds, meta);
        }
    }

    /// Replace the tree with a fresh empty one.
    pub fn clear(&mut self) {
        self.tree = RTree::new();
    }

    /// Payloads of every entry whose bounds intersect the query rectangle.
    #[must_use]
    pub fn intersect(&self, bounds: [f64; 4]) -> Vec<M> {
        let envelope = AABB::from_corners([bounds[0], bounds[1]], [bounds[2], bounds[3]]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| entry.meta.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

impl<M: Clone> Default for BoxIndex<M> {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bounds(raw: &str) -> Option<[f64; 4]> {
    let mut out = [0.0; 4];
    let mut count = 0;
    for (i, part) in raw.split(',').enumerate() {
        if i >= 4 {
            return None;
        }
        out[i] = part.trim().parse().ok()?;
        count += 1;
    }
    (count == 4).then_some(out)
}

/// Payload for flight declaration entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclarationDetail {
    pub flight_declaration_id: String,
    pub start_date: String,
    pub end_date: String,
}

/// Payload for geo-fence entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoFenceDetail {
    pub geo_fence_id: String,
    pub start_date: String,
    pub end_date: String,
}

/// Payload for active operational intent entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationalIntentDetail {
    pub flight_id: String,
    pub start_time: String,
    pub end_time: String,
}

pub type FlightDeclarationIndex = BoxIndex<DeclarationDetail>;
pub type GeoFenceIndex = BoxIndex<GeoFenceDetail>;
pub type OperationalIntentIndex = BoxIndex<OperationalIntentDetail>;

impl FlightDeclarationIndex {
    /// Index active flight declarations from their stored bounds.
    pub fn rebuild_declarations(&mut self, declarations: impl IntoIterator<Item = SpatialEntity>) {
        self.rebuild(declarations, |entity, start, end| DeclarationDetail {
            flight_declaration_id: entity.id.clone(),
            start_date: start.to_string(),
            end_date: end.to_string(),
        });
    }
}

impl GeoFenceIndex {
    /// Index active geo-fences from their stored bounds.
    pub fn rebuild_fences(&mut self, fences: impl IntoIterator<Item = SpatialEntity>) {
        self.rebuild(fences, |entity, start, end| GeoFenceDetail {
            geo_fence_id: entity.id.clone(),
            start_date: start.to_string(),
            end_date: end.to_string(),
        });
    }
}

impl OperationalIntentIndex {
    /// Index currently active operational intents.
    pub fn rebuild_operational_intents(
        &mut self,
        intents: impl IntoIterator<Item = SpatialEntity>,
    ) {
        self.rebuild(intents, |entity, start, end| OperationalIntentDetail {
            flight_id: entity.id.clone(),
            start_time: start.to_string(),
            end_time: end.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, bounds: &str) -> SpatialEntity {
        SpatialEntity {
            id: id.to_string(),
            bounds: bounds.to_string(),
            start_date: None,
            end_date: None,
        }
    }

    #[test]
    fn geofence_index_clears_without_leaving_stale_entries() {
        let mut index = GeoFenceIndex::new();
        index.rebuild_fences(vec![
            entity("1", "-117.9,33.6,-117.8,33.7"),
            entity("2", "-118.0,33.5,-117.95,33.55"),
        ]);

        let hits = index.intersect([-118.5, 33.0, -117.0, 34.0]);
        assert_eq!(hits.len(), 2);

        index.clear();
        assert!(index.intersect([-118.5, 33.0, -117.0, 34.0]).is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn declaration_index_rebuild_attaches_synthetic_window() {
        let mut index = FlightDeclarationIndex::new();
        index.rebuild_declarations(vec![entity("decl-1", "-117.9,33.6,-117.8,33.7")]);

        let hits = index.intersect([-118.0, 33.0, -117.0, 34.0]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].flight_declaration_id, "decl-1");
        assert!(!hits[0].start_date.is_empty());
        assert!(!hits[0].end_date.is_empty());
    }

    #[test]
    fn rebuild_skips_malformed_bounds() {
        let mut index = FlightDeclarationIndex::new();
        index.rebuild_declarations(vec![
            entity("good", "-117.9,33.6,-117.8,33.7"),
            entity("bad", "not,numbers,at,all"),
            entity("short", "1,2,3"),
        ]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn delete_removes_only_the_matching_entry() {
        let mut index = OperationalIntentIndex::new();
        index.insert(
            0,
            [-117.9, 33.6, -117.8, 33.7],
            OperationalIntentDetail {
                flight_id: "f1".into(),
                start_time: String::new(),
                end_time: String::new(),
            },
        );
        index.insert(
            1,
            [-117.9, 33.6, -117.8, 33.7],
            OperationalIntentDetail {
                flight_id: "f2".into(),
                start_time: String::new(),
                end_time: String::new(),
            },
        );

        assert!(index.delete(0, [-117.9, 33.6, -117.8, 33.7]));
        assert!(!index.delete(0, [-117.9, 33.6, -117.8, 33.7]));

        let hits = index.intersect([-118.0, 33.0, -117.0, 34.0]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].flight_id, "f2");
    }

    #[test]
    fn non_intersecting_query_returns_empty() {
        let mut index = GeoFenceIndex::new();
        index.rebuild_fences(vec![entity("1", "-117.9,33.6,-117.8,33.7")]);
        assert!(index.intersect([10.0, 10.0, 11.0, 11.0]).is_empty());
    }
}
