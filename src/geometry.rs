use geo::{
    Contains, EuclideanDistance, Geometry, GeometryCollection, LineString, MultiLineString, Point,
    Polygon,
};

/// Whether `outer` contains `inner`.
pub fn contains(outer: &Geometry<f64>, inner: &Geometry<f64>) -> bool {
    outer.contains(inner)
}

/// Minimum euclidean distance between any parts of the two geometries.
///
/// Multi-geometries and collections are decomposed into points, line strings
/// and polygons; the result is the smallest pairwise distance, or infinity
/// when either side has no parts.
pub fn distance(a: &Geometry<f64>, b: &Geometry<f64>) -> f64 {
    let left = primitives(a);
    let right = primitives(b);
    let mut best = f64::INFINITY;
    for l in &left {
        for r in &right {
            best = best.min(primitive_distance(l, r));
            if best == 0.0 {
                return best;
            }
        }
    }
    best
}

enum Primitive {
    Point(Point<f64>),
    Line(LineString<f64>),
    Area(Polygon<f64>),
}

fn primitives(geometry: &Geometry<f64>) -> Vec<Primitive> {
    let mut out = Vec::new();
    push_primitives(geometry, &mut out);
    out
}

fn push_primitives(geometry: &Geometry<f64>, out: &mut Vec<Primitive>) {
    match geometry {
        Geometry::Point(p) => out.push(Primitive::Point(*p)),
        Geometry::Line(l) => out.push(Primitive::Line(LineString::from(vec![l.start, l.end]))),
        Geometry::LineString(ls) => out.push(Primitive::Line(ls.clone())),
        Geometry::Polygon(p) => out.push(Primitive::Area(p.clone())),
        Geometry::MultiPoint(mp) => out.extend(mp.iter().map(|p| Primitive::Point(*p))),
        Geometry::MultiLineString(mls) => out.extend(mls.iter().cloned().map(Primitive::Line)),
        Geometry::MultiPolygon(mp) => out.extend(mp.iter().cloned().map(Primitive::Area)),
        Geometry::Rect(r) => out.push(Primitive::Area(r.to_polygon())),
        Geometry::Triangle(t) => out.push(Primitive::Area(t.to_polygon())),
        Geometry::GeometryCollection(gc) => {
            for member in gc.iter() {
                push_primitives(member, out);
            }
        }
    }
}

fn primitive_distance(a: &Primitive, b: &Primitive) -> f64 {
    match (a, b) {
        (Primitive::Point(p), Primitive::Point(q)) => p.euclidean_distance(q),
        (Primitive::Point(p), Primitive::Line(l)) | (Primitive::Line(l), Primitive::Point(p)) => {
            p.euclidean_distance(l)
        }
        (Primitive::Point(p), Primitive::Area(poly))
        | (Primitive::Area(poly), Primitive::Point(p)) => p.euclidean_distance(poly),
        (Primitive::Line(l), Primitive::Line(m)) => l.euclidean_distance(m),
        (Primitive::Line(l), Primitive::Area(poly))
        | (Primitive::Area(poly), Primitive::Line(l)) => l.euclidean_distance(poly),
        (Primitive::Area(p), Primitive::Area(q)) => p.euclidean_distance(q),
    }
}

/// Wraps both geometries into one collection, flattening existing collections.
pub fn collect(survivor: &Geometry<f64>, loser: &Geometry<f64>) -> Geometry<f64> {
    let mut members = match survivor {
        Geometry::GeometryCollection(gc) => gc.0.clone(),
        other => vec![other.clone()],
    };
    match loser {
        Geometry::GeometryCollection(gc) => members.extend(gc.0.iter().cloned()),
        other => members.push(other.clone()),
    }
    Geometry::GeometryCollection(GeometryCollection(members))
}

fn is_point_like(geometry: &Geometry<f64>) -> bool {
    matches!(geometry, Geometry::Point(_) | Geometry::MultiPoint(_))
}

fn is_line_like(geometry: &Geometry<f64>) -> bool {
    matches!(
        geometry,
        Geometry::Line(_) | Geometry::LineString(_) | Geometry::MultiLineString(_)
    )
}

/// Collapses a geometry collection into a single geometry.
///
/// - only lines (points aside): one multi-line with every line, points dropped
/// - any other non-point member: the first non-point member
/// - only points: the first point
///
/// Anything that is not a collection is returned untouched.
pub fn simplify_collection(geometry: Geometry<f64>) -> Geometry<f64> {
    let Geometry::GeometryCollection(collection) = geometry else {
        return geometry;
    };
    let members = collection.0;
    if members.is_empty() {
        return Geometry::GeometryCollection(GeometryCollection(members));
    }

    let non_points: Vec<&Geometry<f64>> = members.iter().filter(|g| !is_point_like(g)).collect();
    if !non_points.is_empty() && non_points.iter().all(|g| is_line_like(g)) {
        let mut lines = Vec::new();
        for member in non_points {
            match member {
                Geometry::Line(l) => lines.push(LineString::from(vec![l.start, l.end])),
                Geometry::LineString(ls) => lines.push(ls.clone()),
                Geometry::MultiLineString(mls) => lines.extend(mls.0.iter().cloned()),
                _ => {}
            }
        }
        return Geometry::MultiLineString(MultiLineString(lines));
    }

    let index = members.iter().position(|g| !is_point_like(g)).unwrap_or(0);
    members.into_iter().nth(index).unwrap_or_else(|| {
        Geometry::GeometryCollection(GeometryCollection(Vec::new()))
    })
}
