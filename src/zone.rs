//! Stop-zone filtering of detections.
//!
//! The default mode counts a detection when its box centre lies inside the
//! axis-aligned rectangle spanning the zone vertices, edges inclusive. Polygon
//! mode uses true point-in-polygon containment for non-rectangular zones.

use serde::{Deserialize, Serialize};

use crate::detect::DetectedObject;
use crate::model::{BoundingBox, Point};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneMode {
    #[default]
    BoundingBox,
    Polygon,
}

impl ZoneMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bounding_box" | "bbox" | "rect" => Some(ZoneMode::BoundingBox),
            "polygon" => Some(ZoneMode::Polygon),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Region {
    Everything,
    Rect(BoundingBox),
    Polygon(Vec<Point>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ZoneFilter {
    region: Region,
}

impl ZoneFilter {
    /// Fewer than two vertices means the whole frame counts. Polygon mode
    /// needs three vertices; with exactly two it behaves as the rectangle.
    pub fn new(zone: &[Point], mode: ZoneMode) -> Self {
        let region = if zone.len() < 2 {
            Region::Everything
        } else if mode == ZoneMode::Polygon && zone.len() >= 3 {
            Region::Polygon(zone.to_vec())
        } else {
            Region::Rect(bounding_rect(zone))
        };
        Self { region }
    }

    pub fn is_identity(&self) -> bool {
        self.region == Region::Everything
    }

    /// Rectangle used for counting, if any. In polygon mode this is the
    /// polygon's bounding rectangle, used for drawing.
    pub fn rect(&self) -> Option<BoundingBox> {
        match &self.region {
            Region::Everything => None,
            Region::Rect(rect) => Some(*rect),
            Region::Polygon(points) => Some(bounding_rect(points)),
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        match &self.region {
            Region::Everything => true,
            Region::Rect(rect) => {
                point.x >= rect.x1 && point.x <= rect.x2 && point.y >= rect.y1 && point.y <= rect.y2
            }
            Region::Polygon(points) => polygon_contains(points, point),
        }
    }

    pub fn filter(&self, detections: &[DetectedObject]) -> Vec<DetectedObject> {
        detections
            .iter()
            .filter(|d| self.contains(d.bbox.center()))
            .cloned()
            .collect()
    }

    pub fn count(&self, detections: &[DetectedObject]) -> u32 {
        detections
            .iter()
            .filter(|d| self.contains(d.bbox.center()))
            .count() as u32
    }
}

fn bounding_rect(points: &[Point]) -> BoundingBox {
    let mut rect = BoundingBox::new(f32::MAX, f32::MAX, f32::MIN, f32::MIN);
    for p in points {
        rect.x1 = rect.x1.min(p.x);
        rect.y1 = rect.y1.min(p.y);
        rect.x2 = rect.x2.max(p.x);
        rect.y2 = rect.y2.max(p.y);
    }
    rect
}

/// Ray casting; points on an edge count as inside.
fn polygon_contains(points: &[Point], p: Point) -> bool {
    let n = points.len();
    let mut inside = false;
    for i in 0..n {
        let a = points[i];
        let b = points[(i + 1) % n];
        if on_segment(a, b, p) {
            return true;
        }
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > 1e-3 {
        return false;
    }
    p.x >= a.x.min(b.x) && p.x <= a.x.max(b.x) && p.y >= a.y.min(b.y) && p.y <= a.y.max(b.y)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ObjectClass;

    fn zone() -> Vec<Point> {
        vec![
            Point::new(100.0, 200.0),
            Point::new(500.0, 200.0),
            Point::new(500.0, 600.0),
            Point::new(100.0, 600.0),
        ]
    }

    fn person_at(x: f32, y: f32) -> DetectedObject {
        DetectedObject::new(ObjectClass::Person, 0.9, BoundingBox::centered(x, y, 20.0, 40.0))
    }

    #[test]
    fn corner_is_inside_and_one_unit_out_is_not() {
        let filter = ZoneFilter::new(&zone(), ZoneMode::BoundingBox);
        assert!(filter.contains(Point::new(100.0, 200.0)));
        assert!(filter.contains(Point::new(500.0, 600.0)));
        assert!(!filter.contains(Point::new(99.0, 300.0)));
        assert!(!filter.contains(Point::new(501.0, 300.0)));
        assert!(!filter.contains(Point::new(300.0, 199.0)));
        assert!(!filter.contains(Point::new(300.0, 601.0)));
    }

    #[test]
    fn counts_centres_inside_rectangle() {
        let filter = ZoneFilter::new(&zone(), ZoneMode::BoundingBox);
        let people = vec![
            person_at(150.0, 250.0),
            person_at(550.0, 650.0),
            person_at(300.0, 400.0),
        ];
        assert_eq!(filter.count(&people), 2);
        assert_eq!(filter.filter(&people).len(), 2);
    }

    #[test]
    fn degenerate_zone_is_identity() {
        let filter = ZoneFilter::new(&[Point::new(5.0, 5.0)], ZoneMode::BoundingBox);
        assert!(filter.is_identity());
        assert!(filter.contains(Point::new(-1000.0, 1e6)));
        assert!(ZoneFilter::new(&[], ZoneMode::Polygon).is_identity());
    }

    #[test]
    fn polygon_mode_excludes_corner_of_triangle_rect() {
        let triangle = vec![
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(0.0, 100.0),
        ];
        let rect = ZoneFilter::new(&triangle, ZoneMode::BoundingBox);
        let poly = ZoneFilter::new(&triangle, ZoneMode::Polygon);
        let far_corner = Point::new(90.0, 90.0);
        assert!(rect.contains(far_corner));
        assert!(!poly.contains(far_corner));
        assert!(poly.contains(Point::new(10.0, 10.0)));
        assert!(poly.contains(Point::new(50.0, 50.0)));
    }
}
