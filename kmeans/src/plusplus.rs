use lrcpd_common::{distance_squared, PointSet, Real};
use rand::Rng;
use rayon::prelude::*;

/// k-means++ seeding: the first seed is uniform, every following seed is
/// drawn with probability proportional to its squared distance from the
/// closest seed chosen so far.
pub fn seed<T: Real, R: Rng>(points: &PointSet<T>, k: usize, rng: &mut R) -> Vec<usize> {
    let n = points.len();
    let mut seeds = Vec::with_capacity(k);
    if n == 0 || k == 0 {
        return seeds;
    }

    let columns = points.columns();
    let first = rng.gen_range(0..n);
    seeds.push(first);

    let mut distance = (0..n)
        .into_par_iter()
        .map(|index| distance_squared(columns, index, columns, first))
        .collect::<Vec<_>>();
    let mut cumulative = vec![T::zero(); n];

    while seeds.len() < k {
        let mut sum = T::zero();
        for (c, &d) in cumulative.iter_mut().zip(&distance) {
            sum += d;
            *c = sum;
        }

        let r = nalgebra::convert::<f64, T>(rng.gen::<f64>()) * sum;
        let next = cumulative.partition_point(|&c| c < r).min(n - 1);
        seeds.push(next);

        distance.par_iter_mut().enumerate().for_each(|(index, d)| {
            let dd = distance_squared(columns, index, columns, next);
            if dd < *d {
                *d = dd;
            }
        });
    }
    seeds
}
