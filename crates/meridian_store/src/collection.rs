//! A named collection of geospatial objects.
//!
//! Items are kept in id order; spatial queries filter linearly over the
//! geometry items with a bounding-rect prefilter. Every iterating operation
//! polls the transaction status between items so a long scan can be
//! interrupted at an item boundary, and delivers items in a deterministic
//! order so an interrupted scan resumed from a cursor sees exactly the
//! remaining items.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use meridian_common::error::StoreError;
use meridian_txn::TxnStatus;

use crate::geo::{GeoObject, Point};

#[derive(Debug, Clone)]
pub struct Item {
    pub obj: GeoObject,
    /// Values indexed by the collection's field registry. May be shorter
    /// than the registry; missing entries read as 0.
    pub fields: Vec<f64>,
    pub expires_at: Option<SystemTime>,
}

impl Item {
    pub fn expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    pub fn field(&self, index: usize) -> f64 {
        self.fields.get(index).copied().unwrap_or(0.0)
    }
}

/// How an iterating operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every candidate item was delivered.
    Completed,
    /// The callback asked to stop.
    Stopped,
    /// The transaction status aborted (deadline or interruption); the
    /// caller decides whether to retry or surface the error.
    Aborted,
}

#[derive(Default)]
pub struct Collection {
    items: BTreeMap<String, Item>,
    field_names: Vec<String>,
    weight: usize,
    points: usize,
    objects: usize,
    strings: usize,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Mutation ─────────────────────────────────────────────────────────

    /// Insert or replace an item. Named fields extend the registry; on
    /// replace, old field values persist unless overwritten (matching fset
    /// semantics for partial updates).
    pub fn set(
        &mut self,
        id: &str,
        obj: GeoObject,
        fields: &[(String, f64)],
        expires_at: Option<SystemTime>,
    ) {
        let mut values = match self.items.remove(id) {
            Some(old) => {
                self.remove_accounting(id, &old);
                old.fields
            }
            None => Vec::new(),
        };
        for (name, value) in fields {
            let idx = self.field_index_or_insert(name);
            if values.len() <= idx {
                values.resize(idx + 1, 0.0);
            }
            values[idx] = *value;
        }
        let item = Item {
            obj,
            fields: values,
            expires_at,
        };
        self.add_accounting(id, &item);
        self.items.insert(id.to_string(), item);
    }

    pub fn delete(&mut self, id: &str) -> Option<Item> {
        let item = self.items.remove(id)?;
        self.remove_accounting(id, &item);
        Some(item)
    }

    /// Set one field on an existing item. Returns whether the value changed.
    pub fn set_field(&mut self, id: &str, name: &str, value: f64) -> Result<bool, StoreError> {
        if !self.items.contains_key(id) {
            return Err(StoreError::IdNotFound);
        }
        let idx = self.field_index_or_insert(name);
        let item = self.items.get_mut(id).expect("checked above");
        if item.fields.len() <= idx {
            item.fields.resize(idx + 1, 0.0);
        }
        let changed = item.fields[idx] != value;
        item.fields[idx] = value;
        Ok(changed)
    }

    pub fn set_expires(&mut self, id: &str, expires_at: Option<SystemTime>) -> bool {
        match self.items.get_mut(id) {
            Some(item) => {
                item.expires_at = expires_at;
                true
            }
            None => false,
        }
    }

    // ── Lookup ───────────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn field_map(&self) -> &[String] {
        &self.field_names
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_names.iter().position(|n| n == name)
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn point_count(&self) -> usize {
        self.points
    }

    pub fn object_count(&self) -> usize {
        self.objects
    }

    pub fn string_count(&self) -> usize {
        self.strings
    }

    pub fn total_weight(&self) -> usize {
        self.weight
    }

    /// Bounding rect over all geometry items.
    pub fn bounds(&self) -> Option<crate::geo::Rect> {
        let mut acc: Option<crate::geo::Rect> = None;
        for item in self.items.values() {
            if let Some(r) = item.obj.rect() {
                acc = Some(match acc {
                    None => r,
                    Some(mut a) => {
                        a.min.x = a.min.x.min(r.min.x);
                        a.min.y = a.min.y.min(r.min.y);
                        a.max.x = a.max.x.max(r.max.x);
                        a.max.y = a.max.y.max(r.max.y);
                        a
                    }
                });
            }
        }
        acc
    }

    // ── Iteration ────────────────────────────────────────────────────────

    /// All items in id order (descending when `desc`).
    pub fn scan(
        &self,
        desc: bool,
        status: &TxnStatus,
        mut f: impl FnMut(&str, &Item) -> bool,
    ) -> ScanOutcome {
        if desc {
            self.drive(self.items.iter().rev(), status, &mut f)
        } else {
            self.drive(self.items.iter(), status, &mut f)
        }
    }

    /// Geometry items fully inside `target`, in id order.
    pub fn within(
        &self,
        target: &GeoObject,
        status: &TxnStatus,
        mut f: impl FnMut(&str, &Item) -> bool,
    ) -> ScanOutcome {
        let iter = self
            .items
            .iter()
            .filter(|(_, item)| item.obj.is_geometry() && item.obj.within(target));
        self.drive(iter, status, &mut f)
    }

    /// Geometry items overlapping `target`, in id order.
    pub fn intersects(
        &self,
        target: &GeoObject,
        status: &TxnStatus,
        mut f: impl FnMut(&str, &Item) -> bool,
    ) -> ScanOutcome {
        let iter = self
            .items
            .iter()
            .filter(|(_, item)| item.obj.is_geometry() && item.obj.intersects(target));
        self.drive(iter, status, &mut f)
    }

    /// Geometry items ordered by distance from `origin` (ties broken by id).
    /// The callback also receives the distance in meters.
    pub fn nearby(
        &self,
        origin: Point,
        status: &TxnStatus,
        mut f: impl FnMut(&str, &Item, f64) -> bool,
    ) -> ScanOutcome {
        let origin_obj = GeoObject::Point(origin);
        let mut ordered: Vec<(&String, &Item, f64)> = self
            .items
            .iter()
            .filter(|(_, item)| item.obj.is_geometry())
            .map(|(id, item)| (id, item, origin_obj.distance(&item.obj)))
            .collect();
        ordered.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        for (id, item, dist) in ordered {
            if status.is_aborted() {
                return ScanOutcome::Aborted;
            }
            if !f(id, item, dist) {
                return ScanOutcome::Stopped;
            }
        }
        ScanOutcome::Completed
    }

    /// String-valued items ordered by value (then id).
    pub fn search_values(
        &self,
        desc: bool,
        status: &TxnStatus,
        mut f: impl FnMut(&str, &Item) -> bool,
    ) -> ScanOutcome {
        let mut ordered: Vec<(&String, &Item)> = self
            .items
            .iter()
            .filter(|(_, item)| matches!(item.obj, GeoObject::Str(_)))
            .collect();
        ordered.sort_by(|a, b| {
            let (GeoObject::Str(va), GeoObject::Str(vb)) = (&a.1.obj, &b.1.obj) else {
                return std::cmp::Ordering::Equal;
            };
            va.cmp(vb).then_with(|| a.0.cmp(b.0))
        });
        if desc {
            ordered.reverse();
        }
        for (id, item) in ordered {
            if status.is_aborted() {
                return ScanOutcome::Aborted;
            }
            if !f(id, item) {
                return ScanOutcome::Stopped;
            }
        }
        ScanOutcome::Completed
    }

    fn drive<'a>(
        &self,
        iter: impl Iterator<Item = (&'a String, &'a Item)>,
        status: &TxnStatus,
        f: &mut impl FnMut(&str, &Item) -> bool,
    ) -> ScanOutcome {
        for (id, item) in iter {
            if status.is_aborted() {
                return ScanOutcome::Aborted;
            }
            if !f(id, item) {
                return ScanOutcome::Stopped;
            }
        }
        ScanOutcome::Completed
    }

    // ── Snapshots ────────────────────────────────────────────────────────

    pub fn to_snapshot(&self) -> CollectionSnapshot {
        CollectionSnapshot {
            field_names: self.field_names.clone(),
            items: self
                .items
                .iter()
                .map(|(id, item)| ItemSnapshot {
                    id: id.clone(),
                    object: match &item.obj {
                        GeoObject::Str(s) => ObjectSnapshot::Str(s.clone()),
                        geo => ObjectSnapshot::GeoJson(geo.to_geojson()),
                    },
                    fields: item.fields.clone(),
                    expires_unix_ms: item.expires_at.and_then(|at| {
                        at.duration_since(SystemTime::UNIX_EPOCH)
                            .ok()
                            .map(|d| d.as_millis() as u64)
                    }),
                })
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: CollectionSnapshot) -> Result<Self, StoreError> {
        let mut col = Collection {
            field_names: snapshot.field_names,
            ..Default::default()
        };
        for entry in snapshot.items {
            let obj = match entry.object {
                ObjectSnapshot::Str(s) => GeoObject::Str(s),
                ObjectSnapshot::GeoJson(text) => GeoObject::parse_geojson(&text)?,
            };
            let item = Item {
                obj,
                fields: entry.fields,
                expires_at: entry
                    .expires_unix_ms
                    .map(|ms| SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(ms)),
            };
            col.add_accounting(&entry.id, &item);
            col.items.insert(entry.id, item);
        }
        Ok(col)
    }

    // ── Accounting ───────────────────────────────────────────────────────

    fn field_index_or_insert(&mut self, name: &str) -> usize {
        match self.field_index(name) {
            Some(idx) => idx,
            None => {
                self.field_names.push(name.to_string());
                self.field_names.len() - 1
            }
        }
    }

    fn add_accounting(&mut self, id: &str, item: &Item) {
        self.weight += Self::item_weight(id, item);
        match &item.obj {
            GeoObject::Point(_) => self.points += 1,
            GeoObject::Polygon(_) => self.objects += 1,
            GeoObject::Str(_) => self.strings += 1,
        }
    }

    fn remove_accounting(&mut self, id: &str, item: &Item) {
        self.weight = self.weight.saturating_sub(Self::item_weight(id, item));
        match &item.obj {
            GeoObject::Point(_) => self.points -= 1,
            GeoObject::Polygon(_) => self.objects -= 1,
            GeoObject::Str(_) => self.strings -= 1,
        }
    }

    fn item_weight(id: &str, item: &Item) -> usize {
        let obj_weight = match &item.obj {
            GeoObject::Point(_) => 16,
            GeoObject::Polygon(_) => item.obj.num_points() * 16,
            GeoObject::Str(s) => s.len(),
        };
        id.len() + obj_weight + item.fields.len() * 8
    }
}

/// Serialized form of one collection inside a snapshot directory.
#[derive(Debug, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub field_names: Vec<String>,
    pub items: Vec<ItemSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: String,
    pub object: ObjectSnapshot,
    pub fields: Vec<f64>,
    pub expires_unix_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ObjectSnapshot {
    GeoJson(String),
    Str(String),
}
