use nalgebra::{Point3, Vector3};

use crate::Real;

/// Running mean of 3D points.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CentroidBuilder<T: Real> {
    accum: Vector3<T>,
    num: usize,
}

impl<T: Real> Default for CentroidBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Real> CentroidBuilder<T> {
    pub fn new() -> Self {
        CentroidBuilder {
            accum: Vector3::zeros(),
            num: 0,
        }
    }

    #[inline]
    pub fn accumulate(&mut self, point: &Point3<T>) {
        self.accum += point.coords;
        self.num += 1;
    }

    pub fn merge(&mut self, other: &Self) {
        self.accum += other.accum;
        self.num += other.num;
    }

    #[inline]
    pub fn num(&self) -> usize {
        self.num
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }

    pub fn compute(&self) -> Option<Point3<T>> {
        (self.num > 0).then(|| Point3::from(self.accum / nalgebra::convert::<f64, T>(self.num as f64)))
    }
}
