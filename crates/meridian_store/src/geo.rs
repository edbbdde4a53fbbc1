//! Geospatial objects and the predicates the query surface needs.
//!
//! Coordinates are WGS84 degrees, `x` = longitude, `y` = latitude. Polygon
//! rings follow GeoJSON conventions (exterior ring plus optional holes; the
//! closing vertex may or may not repeat the first). Predicates use planar
//! math in degree space — fine at collection extents — while distances are
//! reported in haversine meters.

use meridian_common::error::StoreError;

/// Mean earth radius in meters, shared with the scripting `distance_to`
/// helper.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub min: Point,
    pub max: Point,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    pub exterior: Vec<Point>,
    pub holes: Vec<Vec<Point>>,
}

/// A stored object: a point, a polygon, or a bare string. Strings carry no
/// geometry and are skipped by spatial queries.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoObject {
    Point(Point),
    Polygon(Polygon),
    Str(String),
}

impl Rect {
    fn intersects(&self, other: &Rect) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    pub fn center(&self) -> Point {
        Point {
            x: (self.min.x + self.max.x) / 2.0,
            y: (self.min.y + self.max.y) / 2.0,
        }
    }
}

impl GeoObject {
    pub fn is_geometry(&self) -> bool {
        !matches!(self, GeoObject::Str(_))
    }

    pub fn rect(&self) -> Option<Rect> {
        match self {
            GeoObject::Point(p) => Some(Rect { min: *p, max: *p }),
            GeoObject::Polygon(poly) => bounds(&poly.exterior),
            GeoObject::Str(_) => None,
        }
    }

    pub fn center(&self) -> Option<Point> {
        self.rect().map(|r| r.center())
    }

    pub fn num_points(&self) -> usize {
        match self {
            GeoObject::Point(_) => 1,
            GeoObject::Polygon(poly) => {
                poly.exterior.len() + poly.holes.iter().map(Vec::len).sum::<usize>()
            }
            GeoObject::Str(_) => 0,
        }
    }

    pub fn empty(&self) -> bool {
        match self {
            GeoObject::Point(_) => false,
            GeoObject::Polygon(poly) => poly.exterior.is_empty(),
            GeoObject::Str(s) => s.is_empty(),
        }
    }

    pub fn valid(&self) -> bool {
        match self {
            GeoObject::Point(p) => p.x.is_finite() && p.y.is_finite(),
            GeoObject::Polygon(poly) => poly.exterior.len() >= 3,
            GeoObject::Str(_) => true,
        }
    }

    /// True when `self` lies entirely inside `other`.
    pub fn within(&self, other: &GeoObject) -> bool {
        match (self, other) {
            (GeoObject::Point(p), GeoObject::Point(q)) => p == q,
            (GeoObject::Point(p), GeoObject::Polygon(poly)) => poly.contains_point(*p),
            (GeoObject::Polygon(a), GeoObject::Polygon(b)) => b.contains_polygon(a),
            (GeoObject::Polygon(_), GeoObject::Point(_)) => false,
            _ => false,
        }
    }

    /// True when `self` contains `other` entirely.
    pub fn contains(&self, other: &GeoObject) -> bool {
        other.within(self)
    }

    pub fn intersects(&self, other: &GeoObject) -> bool {
        match (self, other) {
            (GeoObject::Point(p), GeoObject::Point(q)) => p == q,
            (GeoObject::Point(p), GeoObject::Polygon(poly))
            | (GeoObject::Polygon(poly), GeoObject::Point(p)) => poly.contains_point(*p),
            (GeoObject::Polygon(a), GeoObject::Polygon(b)) => a.intersects_polygon(b),
            _ => false,
        }
    }

    /// Distance in meters between this object and `other`: zero when they
    /// touch, otherwise the gap at closest approach.
    pub fn distance(&self, other: &GeoObject) -> f64 {
        match (self, other) {
            (GeoObject::Point(p), GeoObject::Point(q)) => haversine(p.y, p.x, q.y, q.x),
            (GeoObject::Point(p), GeoObject::Polygon(poly))
            | (GeoObject::Polygon(poly), GeoObject::Point(p)) => poly.distance_to_point(*p),
            (GeoObject::Polygon(a), GeoObject::Polygon(b)) => {
                if a.intersects_polygon(b) {
                    return 0.0;
                }
                let mut best = f64::INFINITY;
                for v in &a.exterior {
                    best = best.min(b.distance_to_point(*v));
                }
                for v in &b.exterior {
                    best = best.min(a.distance_to_point(*v));
                }
                best
            }
            _ => f64::INFINITY,
        }
    }

    // ── GeoJSON ──────────────────────────────────────────────────────────

    pub fn parse_geojson(text: &str) -> Result<GeoObject, StoreError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| StoreError::InvalidGeoJson(e.to_string()))?;
        let kind = value["type"]
            .as_str()
            .ok_or_else(|| StoreError::InvalidGeoJson("missing type".into()))?;
        match kind {
            "Point" => {
                let coords = coord_pair(&value["coordinates"])?;
                Ok(GeoObject::Point(coords))
            }
            "Polygon" => {
                let rings = value["coordinates"]
                    .as_array()
                    .ok_or_else(|| StoreError::InvalidGeoJson("bad polygon coordinates".into()))?;
                if rings.is_empty() {
                    return Err(StoreError::InvalidGeoJson("polygon has no rings".into()));
                }
                let mut parsed = Vec::with_capacity(rings.len());
                for ring in rings {
                    let pts = ring
                        .as_array()
                        .ok_or_else(|| StoreError::InvalidGeoJson("bad ring".into()))?
                        .iter()
                        .map(coord_pair)
                        .collect::<Result<Vec<_>, _>>()?;
                    if pts.len() < 3 {
                        return Err(StoreError::InvalidGeoJson("ring too short".into()));
                    }
                    parsed.push(pts);
                }
                let exterior = parsed.remove(0);
                Ok(GeoObject::Polygon(Polygon {
                    exterior,
                    holes: parsed,
                }))
            }
            other => Err(StoreError::InvalidGeoJson(format!(
                "unsupported type '{}'",
                other
            ))),
        }
    }

    pub fn to_geojson(&self) -> String {
        match self {
            GeoObject::Point(p) => {
                format!(r#"{{"type":"Point","coordinates":[{},{}]}}"#, p.x, p.y)
            }
            GeoObject::Polygon(poly) => {
                let mut rings = vec![ring_json(&poly.exterior)];
                rings.extend(poly.holes.iter().map(|h| ring_json(h)));
                format!(
                    r#"{{"type":"Polygon","coordinates":[{}]}}"#,
                    rings.join(",")
                )
            }
            GeoObject::Str(s) => serde_json::Value::String(s.clone()).to_string(),
        }
    }
}

fn ring_json(ring: &[Point]) -> String {
    let pts: Vec<String> = ring.iter().map(|p| format!("[{},{}]", p.x, p.y)).collect();
    format!("[{}]", pts.join(","))
}

fn coord_pair(value: &serde_json::Value) -> Result<Point, StoreError> {
    let arr = value
        .as_array()
        .ok_or_else(|| StoreError::InvalidGeoJson("bad coordinate pair".into()))?;
    if arr.len() < 2 {
        return Err(StoreError::InvalidGeoJson("bad coordinate pair".into()));
    }
    let x = arr[0]
        .as_f64()
        .ok_or_else(|| StoreError::InvalidGeoJson("bad coordinate".into()))?;
    let y = arr[1]
        .as_f64()
        .ok_or_else(|| StoreError::InvalidGeoJson("bad coordinate".into()))?;
    Ok(Point { x, y })
}

fn bounds(ring: &[Point]) -> Option<Rect> {
    let first = ring.first()?;
    let mut rect = Rect {
        min: *first,
        max: *first,
    };
    for p in ring {
        rect.min.x = rect.min.x.min(p.x);
        rect.min.y = rect.min.y.min(p.y);
        rect.max.x = rect.max.x.max(p.x);
        rect.max.y = rect.max.y.max(p.y);
    }
    Some(rect)
}

impl Polygon {
    /// Point-in-polygon with holes: inside the exterior ring and outside
    /// every hole.
    pub fn contains_point(&self, p: Point) -> bool {
        if !point_in_ring(p, &self.exterior) {
            return false;
        }
        !self.holes.iter().any(|hole| point_in_ring(p, hole))
    }

    /// True when `inner` lies entirely inside this polygon: every vertex of
    /// the inner exterior is inside, no edges cross, and none of this
    /// polygon's holes sit inside the inner polygon.
    pub fn contains_polygon(&self, inner: &Polygon) -> bool {
        match (self.rect_of(), inner.rect_of()) {
            (Some(a), Some(b)) => {
                if !a.intersects(&b) {
                    return false;
                }
            }
            _ => return false,
        }
        if !inner.exterior.iter().all(|&v| self.contains_point(v)) {
            return false;
        }
        for ring in self.rings() {
            if rings_cross(&inner.exterior, ring) {
                return false;
            }
        }
        for hole in &self.holes {
            if let Some(&v) = hole.first() {
                if point_in_ring(v, &inner.exterior) {
                    return false;
                }
            }
        }
        true
    }

    pub fn intersects_polygon(&self, other: &Polygon) -> bool {
        match (self.rect_of(), other.rect_of()) {
            (Some(a), Some(b)) => {
                if !a.intersects(&b) {
                    return false;
                }
            }
            _ => return false,
        }
        if self.exterior.iter().any(|&v| other.contains_point(v)) {
            return true;
        }
        if other.exterior.iter().any(|&v| self.contains_point(v)) {
            return true;
        }
        rings_cross(&self.exterior, &other.exterior)
    }

    /// Meters from `p` to the polygon: zero when inside, otherwise the
    /// haversine distance to the closest boundary point.
    pub fn distance_to_point(&self, p: Point) -> f64 {
        if self.contains_point(p) {
            return 0.0;
        }
        let mut best = f64::INFINITY;
        for (a, b) in ring_edges(&self.exterior) {
            let closest = closest_on_segment(p, a, b);
            best = best.min(haversine(p.y, p.x, closest.y, closest.x));
        }
        best
    }

    fn rect_of(&self) -> Option<Rect> {
        bounds(&self.exterior)
    }

    fn rings(&self) -> impl Iterator<Item = &Vec<Point>> {
        std::iter::once(&self.exterior).chain(self.holes.iter())
    }
}

fn point_in_ring(p: Point, ring: &[Point]) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (pi, pj) = (ring[i], ring[j]);
        if (pi.y > p.y) != (pj.y > p.y) {
            let x_cross = (pj.x - pi.x) * (p.y - pi.y) / (pj.y - pi.y) + pi.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn ring_edges(ring: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    let n = ring.len();
    (0..n).map(move |i| (ring[i], ring[(i + 1) % n]))
}

fn rings_cross(a: &[Point], b: &[Point]) -> bool {
    for (a1, a2) in ring_edges(a) {
        for (b1, b2) in ring_edges(b) {
            if segments_cross(a1, a2, b1, b2) {
                return true;
            }
        }
    }
    false
}

fn orient(a: Point, b: Point, c: Point) -> f64 {
    (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x)
}

fn segments_cross(p1: Point, p2: Point, p3: Point, p4: Point) -> bool {
    let d1 = orient(p3, p4, p1);
    let d2 = orient(p3, p4, p2);
    let d3 = orient(p1, p2, p3);
    let d4 = orient(p1, p2, p4);
    ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
}

fn closest_on_segment(p: Point, a: Point, b: Point) -> Point {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len2 = dx * dx + dy * dy;
    if len2 == 0.0 {
        return a;
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0);
    Point {
        x: a.x + t * dx,
        y: a.y + t * dy,
    }
}

/// Great-circle distance in meters between two lat/lon pairs.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dphi = (lat2 - lat1).to_radians();
    let dlambda = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().atan2((1.0 - a).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Polygon {
        Polygon {
            exterior: vec![
                Point { x: x0, y: y0 },
                Point { x: x1, y: y0 },
                Point { x: x1, y: y1 },
                Point { x: x0, y: y1 },
                Point { x: x0, y: y0 },
            ],
            holes: vec![],
        }
    }

    #[test]
    fn test_haversine_known_distance() {
        let d = haversine(37.7341129, -122.4408378, 37.733, -122.43);
        assert!((d - 961.0).abs() < 1.0, "got {}", d);
    }

    #[test]
    fn test_point_in_polygon_with_hole() {
        let mut poly = square(0.0, 0.0, 10.0, 10.0);
        poly.holes.push(vec![
            Point { x: 4.0, y: 4.0 },
            Point { x: 6.0, y: 4.0 },
            Point { x: 6.0, y: 6.0 },
            Point { x: 4.0, y: 6.0 },
        ]);
        assert!(poly.contains_point(Point { x: 1.0, y: 1.0 }));
        assert!(!poly.contains_point(Point { x: 5.0, y: 5.0 }));
        assert!(!poly.contains_point(Point { x: 11.0, y: 5.0 }));
    }

    #[test]
    fn test_polygon_within_respects_holes() {
        let mut outer = square(0.0, 0.0, 10.0, 10.0);
        outer.holes.push(vec![
            Point { x: 4.0, y: 4.0 },
            Point { x: 6.0, y: 4.0 },
            Point { x: 6.0, y: 6.0 },
            Point { x: 4.0, y: 6.0 },
        ]);
        let clear = square(1.0, 1.0, 3.0, 3.0);
        let over_hole = square(3.5, 3.5, 5.0, 5.0);
        assert!(outer.contains_polygon(&clear));
        assert!(!outer.contains_polygon(&over_hole));
    }

    #[test]
    fn test_polygon_not_within_when_hole_inside_inner() {
        let mut outer = square(0.0, 0.0, 10.0, 10.0);
        outer.holes.push(vec![
            Point { x: 4.0, y: 4.0 },
            Point { x: 6.0, y: 4.0 },
            Point { x: 6.0, y: 6.0 },
            Point { x: 4.0, y: 6.0 },
        ]);
        // The inner square swallows the hole whole: vertices are inside and
        // no edges cross, but the hole area is not part of the outer polygon.
        let swallowing = square(3.0, 3.0, 7.0, 7.0);
        assert!(!outer.contains_polygon(&swallowing));
    }

    #[test]
    fn test_intersects_overlapping_and_disjoint() {
        let a = square(0.0, 0.0, 4.0, 4.0);
        let b = square(2.0, 2.0, 6.0, 6.0);
        let c = square(10.0, 10.0, 12.0, 12.0);
        assert!(a.intersects_polygon(&b));
        assert!(!a.intersects_polygon(&c));
        // Containment without edge crossings still intersects.
        let inner = square(1.0, 1.0, 2.0, 2.0);
        assert!(a.intersects_polygon(&inner));
    }

    #[test]
    fn test_distance_to_point_outside() {
        let poly = square(0.0, 0.0, 1.0, 1.0);
        assert_eq!(poly.distance_to_point(Point { x: 0.5, y: 0.5 }), 0.0);
        let d = poly.distance_to_point(Point { x: 0.5, y: 1.1 });
        // ~0.1 degrees of latitude.
        assert!((d - 11_119.0).abs() < 100.0, "got {}", d);
    }

    #[test]
    fn test_geojson_roundtrip() {
        let text = r#"{"type":"Polygon","coordinates":[[[-122.44,37.73],[-122.43,37.73],[-122.43,37.74],[-122.44,37.74],[-122.44,37.73]]]}"#;
        let obj = GeoObject::parse_geojson(text).unwrap();
        let back = GeoObject::parse_geojson(&obj.to_geojson()).unwrap();
        assert_eq!(obj, back);
    }

    #[test]
    fn test_geojson_rejects_garbage() {
        assert!(GeoObject::parse_geojson("{}").is_err());
        assert!(GeoObject::parse_geojson(r#"{"type":"Polygon","coordinates":[]}"#).is_err());
        assert!(GeoObject::parse_geojson("not json").is_err());
    }
}
