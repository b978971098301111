mod nearest;
pub mod plusplus;

use lrcpd_common::{CentroidBuilder, PointSet, Real};
use nalgebra::Point3;
use rand::{rngs::StdRng, SeedableRng};
use rayon::prelude::*;

pub use self::nearest::{nearest, nearest_center, nearest_where};

pub const DEFAULT_SEED: u64 = 0x1234_5678_9abc_def;

/// Lloyd's k-means with k-means++ seeding.
///
/// The generator is re-seeded from `seed` on every call to [`KMeans::fit`],
/// so a given input always yields the same clustering. Labels are computed
/// point by point and centers are accumulated serially, which keeps the
/// result independent of the size of the rayon pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KMeans {
    pub k: usize,
    pub max_iterations: usize,
    /// Stop once no more than this many labels change in an iteration.
    /// Defaults to `n / 1000`.
    pub min_changed: Option<usize>,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clustering<T: Real> {
    pub centers: Vec<Point3<T>>,
    pub labels: Vec<usize>,
    pub iterations: usize,
}

impl KMeans {
    pub fn new(k: usize) -> Self {
        KMeans {
            k,
            max_iterations: 100,
            min_changed: None,
            seed: DEFAULT_SEED,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Returns `None` if `k` is zero or larger than the number of points.
    pub fn fit<T: Real>(&self, points: &PointSet<T>) -> Option<Clustering<T>> {
        let n = points.len();
        if self.k == 0 || self.k > n {
            return None;
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let seeds = plusplus::seed(points, self.k, &mut rng);
        let mut centers = seeds.iter().map(|&index| points.point(index)).collect::<Vec<_>>();

        let mut labels = vec![0; n];
        relabel(points, &centers, &mut labels);

        let min_changed = self.min_changed.unwrap_or(n / 1000);
        let mut builders = vec![CentroidBuilder::new(); self.k];
        let mut iterations = 0;
        loop {
            builders.iter_mut().for_each(CentroidBuilder::clear);
            for (index, &label) in labels.iter().enumerate() {
                builders[label].accumulate(&points.point(index));
            }
            // An emptied cluster keeps its previous center.
            for (center, builder) in centers.iter_mut().zip(&builders) {
                if let Some(centroid) = builder.compute() {
                    *center = centroid;
                }
            }

            let changed = relabel(points, &centers, &mut labels);
            iterations += 1;
            log::trace!("k-means iteration {iterations}: {changed} labels changed");

            if iterations >= self.max_iterations || changed <= min_changed {
                break;
            }
        }

        Some(Clustering {
            centers,
            labels,
            iterations,
        })
    }
}

/// Assigns every point to its nearest center and returns how many labels
/// changed.
fn relabel<T: Real>(points: &PointSet<T>, centers: &[Point3<T>], labels: &mut [usize]) -> usize {
    { labels.par_iter_mut().enumerate() }
        .map(|(index, label)| {
            let nearest = nearest_center(centers, &points.point(index));
            let changed = nearest != *label;
            *label = nearest;
            changed as usize
        })
        .sum()
}

impl<T: Real> Clustering<T> {
    #[inline]
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// Picks for every cluster the member nearest to its center. No index is
    /// picked twice; a cluster with no free member falls back to the nearest
    /// free point overall.
    pub fn representatives(&self, points: &PointSet<T>) -> Vec<usize> {
        let mut used = vec![false; points.len()];
        let mut result = Vec::with_capacity(self.len());
        for (cluster, center) in self.centers.iter().enumerate() {
            let picked = nearest_where(points, center, |i| self.labels[i] == cluster && !used[i])
                .or_else(|| nearest_where(points, center, |i| !used[i]));
            if let Some((index, _)) = picked {
                used[index] = true;
                result.push(index);
            }
        }
        result
    }
}
