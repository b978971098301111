mod centroid;
pub mod point_set;

use nalgebra::RealField;

pub use self::{
    centroid::CentroidBuilder,
    point_set::{Bounds, PointSet},
};

/// Scalar type of every point set and numeric routine in the workspace.
pub trait Real: RealField + Copy {
    /// Width of the native-endian encoding.
    const BYTES: usize;

    /// Writes the native-endian bytes to `out`, which holds exactly
    /// [`Real::BYTES`] bytes.
    fn write_ne(self, out: &mut [u8]);

    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_real {
    ($($ty:ty),*) => {$(
        impl Real for $ty {
            const BYTES: usize = std::mem::size_of::<$ty>();

            #[inline]
            fn write_ne(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_ne_bytes())
            }

            #[inline]
            fn read_ne(bytes: &[u8]) -> Self {
                let mut buf = [0; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_ne_bytes(buf)
            }
        }
    )*};
}
impl_real!(f32, f64);

/// Squared Euclidean distance between rows `a` of `x` and `b` of `y`, both
/// given as coordinate columns.
#[inline]
pub fn distance_squared<T: Real>(x: [&[T]; 3], a: usize, y: [&[T]; 3], b: usize) -> T {
    let d0 = x[0][a] - y[0][b];
    let d1 = x[1][a] - y[1][b];
    let d2 = x[2][a] - y[2][b];
    d0 * d0 + d1 * d1 + d2 * d2
}
