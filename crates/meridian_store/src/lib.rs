pub mod collection;
pub mod geo;

pub use collection::{Collection, Item, ScanOutcome};
pub use geo::{GeoObject, Point, Polygon, Rect};
