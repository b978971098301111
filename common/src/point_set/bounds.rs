use nalgebra::{Point3, Vector3};

use super::PointSet;
use crate::Real;

/// Axis-aligned bounding box of a point set.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Bounds<T: Real> {
    pub min: Point3<T>,
    pub max: Point3<T>,
}

impl<T: Real> Bounds<T> {
    /// Bounds of the finite points of `set`, `None` if there are none.
    pub fn of(set: &PointSet<T>) -> Option<Self> {
        let mut iter = set.iter().filter(|p| p.iter().all(|x| x.is_finite()));
        let first = iter.next()?;
        Some(iter.fold(Bounds { min: first, max: first }, |acc, p| Bounds {
            min: acc.min.inf(&p),
            max: acc.max.sup(&p),
        }))
    }

    #[inline]
    pub fn extent(&self) -> Vector3<T> {
        self.max - self.min
    }

    pub fn longest_axis(&self) -> usize {
        let extent = self.extent();
        let mut axis = 0;
        for a in 1..3 {
            if extent[a] > extent[axis] {
                axis = a;
            }
        }
        axis
    }
}
