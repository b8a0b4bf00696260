use serde::{Deserialize, Serialize};

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

/// Axis-aligned rectangle. Construction normalizes the corners.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Rect {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            xmin: x1.min(x2),
            ymin: y1.min(y2),
            xmax: x1.max(x2),
            ymax: y1.max(y2),
        }
    }

    pub fn contains_point(&self, p: &Point) -> bool {
        p.x >= self.xmin && p.x <= self.xmax && p.y >= self.ymin && p.y <= self.ymax
    }

    /// Touching edges count as intersecting.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }

    fn from_points<'a>(points: impl IntoIterator<Item = &'a Point>) -> Option<Rect> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut rect = Rect::new(first.x, first.y, first.x, first.y);
        for p in iter {
            rect.xmin = rect.xmin.min(p.x);
            rect.ymin = rect.ymin.min(p.y);
            rect.xmax = rect.xmax.max(p.x);
            rect.ymax = rect.ymax.max(p.y);
        }
        Some(rect)
    }
}

/// Planar feature geometry. Coordinates are opaque to the edit engine;
/// it only needs bounding boxes for rectangle filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point(Point),
    LineString(Vec<Point>),
    Polygon(Vec<Vec<Point>>),
}

impl Geometry {
    pub fn point(x: f64, y: f64) -> Self {
        Geometry::Point(Point::new(x, y))
    }

    pub fn as_point(&self) -> Option<Point> {
        match self {
            Geometry::Point(p) => Some(*p),
            _ => None,
        }
    }

    pub fn bounding_box(&self) -> Option<Rect> {
        match self {
            Geometry::Point(p) => Rect::from_points([p]),
            Geometry::LineString(points) => Rect::from_points(points),
            Geometry::Polygon(rings) => Rect::from_points(rings.iter().flatten()),
        }
    }

    /// Bounding-box intersection test.
    pub fn intersects_rect(&self, rect: &Rect) -> bool {
        match self {
            Geometry::Point(p) => rect.contains_point(p),
            _ => self.bounding_box().is_some_and(|bbox| bbox.intersects(rect)),
        }
    }
}
