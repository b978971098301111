mod bounds;

use std::cmp::Ordering;

use nalgebra::{DMatrix, Point3, Vector3};

pub use self::bounds::Bounds;
use crate::Real;

/// An ordered set of 3D points, stored column-major as an `len × 3` matrix so
/// that every coordinate axis is a contiguous slice.
#[derive(Debug, Clone, PartialEq)]
pub struct PointSet<T: Real> {
    coords: DMatrix<T>,
}

impl<T: Real> PointSet<T> {
    #[inline]
    pub fn new() -> Self {
        PointSet {
            coords: DMatrix::zeros(0, 3),
        }
    }

    #[inline]
    pub fn zeros(len: usize) -> Self {
        PointSet {
            coords: DMatrix::zeros(len, 3),
        }
    }

    /// Wraps an `len × 3` matrix, giving it back if it has another shape.
    pub fn try_from_matrix(coords: DMatrix<T>) -> Result<Self, DMatrix<T>> {
        if coords.ncols() == 3 {
            Ok(PointSet { coords })
        } else {
            Err(coords)
        }
    }

    /// Builds a point set from interleaved `[x0, y0, z0, x1, ...]` data with
    /// `dim` values per point. Only `dim == 3` is accepted.
    pub fn try_from_interleaved(data: &[T], dim: usize) -> Option<Self> {
        if dim != 3 || data.len() % 3 != 0 {
            return None;
        }
        let len = data.len() / 3;
        Some(PointSet {
            coords: DMatrix::from_fn(len, 3, |row, axis| data[row * 3 + axis]),
        })
    }

    /// Builds a point set from structure-of-arrays data: all x, then all y,
    /// then all z.
    pub fn try_from_soa(data: &[T]) -> Option<Self> {
        (data.len() % 3 == 0).then(|| PointSet {
            coords: DMatrix::from_column_slice(data.len() / 3, 3, data),
        })
    }

    pub fn from_points<I>(points: I) -> Self
    where
        I: IntoIterator<Item = Point3<T>>,
    {
        let points = points.into_iter().collect::<Vec<_>>();
        PointSet {
            coords: DMatrix::from_fn(points.len(), 3, |row, axis| points[row][axis]),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.coords.nrows()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.coords.nrows() == 0
    }

    #[inline]
    pub fn point(&self, index: usize) -> Point3<T> {
        Point3::new(
            self.coords[(index, 0)],
            self.coords[(index, 1)],
            self.coords[(index, 2)],
        )
    }

    #[inline]
    pub fn set_point(&mut self, index: usize, point: &Point3<T>) {
        for axis in 0..3 {
            self.coords[(index, axis)] = point[axis];
        }
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = Point3<T>> + '_ {
        (0..self.len()).map(|index| self.point(index))
    }

    #[inline]
    pub fn column(&self, axis: usize) -> &[T] {
        let len = self.len();
        &self.coords.as_slice()[axis * len..][..len]
    }

    #[inline]
    pub fn columns(&self) -> [&[T]; 3] {
        [self.column(0), self.column(1), self.column(2)]
    }

    pub fn columns_mut(&mut self) -> [&mut [T]; 3] {
        let len = self.len();
        let (x, rest) = self.coords.as_mut_slice().split_at_mut(len);
        let (y, z) = rest.split_at_mut(len);
        [x, y, z]
    }

    #[inline]
    pub fn as_matrix(&self) -> &DMatrix<T> {
        &self.coords
    }

    /// Mutable access to the coordinate matrix. Resizing it breaks the
    /// accessors that slice by axis.
    #[inline]
    pub fn as_matrix_mut(&mut self) -> &mut DMatrix<T> {
        &mut self.coords
    }

    /// Copies the coordinates of `other`, which must have the same length.
    #[inline]
    pub fn copy_from(&mut self, other: &Self) {
        self.coords.copy_from(&other.coords)
    }

    /// Interleaved `[x0, y0, z0, x1, ...]` copy of the coordinates.
    pub fn to_interleaved(&self) -> Vec<T> {
        self.iter().flat_map(|p| [p.x, p.y, p.z]).collect()
    }

    pub fn is_bounded(&self) -> bool {
        self.coords.iter().all(|x| x.is_finite())
    }

    pub fn bounds(&self) -> Option<Bounds<T>> {
        Bounds::of(self)
    }

    /// The axis with the largest extent of the bounding box; ties pick the
    /// lower axis.
    pub fn spread_axis(&self) -> usize {
        self.bounds().map_or(0, |bounds| bounds.longest_axis())
    }

    pub fn centroid(&self) -> Option<Point3<T>> {
        let mut builder = crate::CentroidBuilder::new();
        self.iter().for_each(|point| builder.accumulate(&point));
        builder.compute()
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        PointSet {
            coords: DMatrix::from_fn(indices.len(), 3, |row, axis| {
                self.coords[(indices[row], axis)]
            }),
        }
    }

    /// Returns a copy sorted ascending along `axis` together with the
    /// original index of every sorted row.
    pub fn sorted_along(&self, axis: usize) -> (Self, Vec<usize>) {
        let column = self.column(axis);
        let mut order = (0..self.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| {
            { column[a].partial_cmp(&column[b]) }.unwrap_or(Ordering::Equal)
        });
        (self.select(&order), order)
    }

    pub fn map<F>(&self, mut f: F) -> Self
    where
        F: FnMut(&Point3<T>) -> Point3<T>,
    {
        Self::from_points(self.iter().map(|point| f(&point)))
    }

    pub fn translate(&self, offset: &Vector3<T>) -> Self {
        self.map(|point| point + offset)
    }

    /// Root mean square distance between corresponding points.
    pub fn rms_distance(&self, other: &Self) -> Option<T> {
        if self.len() != other.len() || self.is_empty() {
            return None;
        }
        let sum = { self.iter().zip(other.iter()) }
            .map(|(a, b)| (a - b).norm_squared())
            .fold(T::zero(), |acc, d| acc + d);
        Some((sum / nalgebra::convert(self.len() as f64)).sqrt())
    }

    /// Largest distance between corresponding points.
    pub fn max_distance(&self, other: &Self) -> Option<T> {
        if self.len() != other.len() || self.is_empty() {
            return None;
        }
        let iter = { self.iter().zip(other.iter()) }.map(|(a, b)| (a - b).norm());
        Some(iter.fold(T::zero(), |acc, d| acc.max(d)))
    }
}

impl<T: Real> Default for PointSet<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Real> FromIterator<Point3<T>> for PointSet<T> {
    fn from_iter<I: IntoIterator<Item = Point3<T>>>(iter: I) -> Self {
        Self::from_points(iter)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::point;

    use super::*;

    #[test]
    fn test_layout() {
        let set = PointSet::from_points([point![1., 2., 3.], point![4., 5., 6.]]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.column(0), &[1., 4.]);
        assert_eq!(set.column(2), &[3., 6.]);
        assert_eq!(set.to_interleaved(), vec![1., 2., 3., 4., 5., 6.]);

        let soa = PointSet::try_from_soa(&[1., 4., 2., 5., 3., 6.]).unwrap();
        assert_eq!(soa, set);

        let inter = PointSet::try_from_interleaved(&[1., 2., 3., 4., 5., 6.], 3).unwrap();
        assert_eq!(inter, set);
        assert!(PointSet::try_from_interleaved(&[1., 2., 3., 4.], 2).is_none());
        assert!(PointSet::<f64>::try_from_matrix(DMatrix::zeros(4, 2)).is_err());
    }

    #[test]
    fn test_sorted_along() {
        let set = PointSet::from_points([
            point![0., 3., 0.],
            point![1., -1., 0.],
            point![2., 7., 0.5],
        ]);
        assert_eq!(set.spread_axis(), 1);

        let (sorted, order) = set.sorted_along(1);
        assert_eq!(order, vec![1, 0, 2]);
        assert_eq!(sorted.column(1), &[-1., 3., 7.]);
        assert_eq!(sorted.point(2), set.point(2));
    }

    #[test]
    fn test_distances() {
        let set = PointSet::from_points([point![0., 0., 0.], point![1., 1., 1.]]);
        let moved = set.translate(&Vector3::new(0., 0., 2.));
        assert_relative_eq!(set.rms_distance(&moved).unwrap(), 2.);
        assert_relative_eq!(set.max_distance(&moved).unwrap(), 2.);
        assert_relative_eq!(set.centroid().unwrap(), point![0.5, 0.5, 0.5]);
        assert!(set.rms_distance(&PointSet::new()).is_none());
    }
}
