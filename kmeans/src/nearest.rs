use lrcpd_common::{PointSet, Real};
use nalgebra::Point3;

#[inline]
fn distance_squared<T: Real>(columns: [&[T]; 3], index: usize, query: &Point3<T>) -> T {
    let d0 = columns[0][index] - query.x;
    let d1 = columns[1][index] - query.y;
    let d2 = columns[2][index] - query.z;
    d0 * d0 + d1 * d1 + d2 * d2
}

/// Index and squared distance of the point of `points` closest to `query`.
/// Ties resolve to the lowest index.
pub fn nearest<T: Real>(points: &PointSet<T>, query: &Point3<T>) -> Option<(usize, T)> {
    nearest_where(points, query, |_| true)
}

/// Like [`nearest`], restricted to the indices accepted by `filter`.
pub fn nearest_where<T, F>(points: &PointSet<T>, query: &Point3<T>, filter: F) -> Option<(usize, T)>
where
    T: Real,
    F: Fn(usize) -> bool,
{
    let columns = points.columns();
    let mut best: Option<(usize, T)> = None;
    for index in (0..points.len()).filter(|&index| filter(index)) {
        let distance = distance_squared(columns, index, query);
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((index, distance));
        }
    }
    best
}

pub fn nearest_center<T: Real>(centers: &[Point3<T>], point: &Point3<T>) -> usize {
    let mut best = 0;
    let mut best_distance = None;
    for (index, center) in centers.iter().enumerate() {
        let distance = (center - point).norm_squared();
        if best_distance.map_or(true, |d| distance < d) {
            best = index;
            best_distance = Some(distance);
        }
    }
    best
}
