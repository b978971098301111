use std::array;

use lrcpd_common::{distance_squared, PointSet, Real};
use nalgebra::convert;
use rayon::prelude::*;

use super::{window, EStep, EStepInput, Responsibilities};
use crate::{
    caps::{Capabilities, KernelPath, LANES},
    config::Windowing,
    error::{Error, Result},
};

/// The rayon-parallel E-step.
///
/// Every output value is reduced by a single task in a fixed order, and
/// terms outside the cutoff are skipped rather than added as zero, so all
/// kernel paths and windowing modes produce identical bits.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CpuBackend {
    path: KernelPath,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    /// Uses the widest kernel path the host supports.
    pub fn new() -> Self {
        CpuBackend {
            path: Capabilities::get().kernel_path(),
        }
    }

    pub fn with_path(path: KernelPath) -> Self {
        CpuBackend { path }
    }

    #[inline]
    pub fn path(&self) -> KernelPath {
        self.path
    }
}

impl<T: Real> EStep<T> for CpuBackend {
    fn name(&self) -> &'static str {
        match self.path {
            KernelPath::Scalar => "cpu-scalar",
            KernelPath::Lanes => "cpu-lanes",
        }
    }

    fn estimate_sigma2(&self, data: &PointSet<T>, model: &PointSet<T>) -> Result<T> {
        let (n, m) = (data.len(), model.len());
        if n == 0 || m == 0 {
            return Err(Error::InvalidArgument("point sets must not be empty"));
        }
        let (x, y) = (data.columns(), model.columns());
        let rows = { (0..n).into_par_iter() }
            .map(|i| (0..m).fold(T::zero(), |acc, j| acc + distance_squared(x, i, y, j)))
            .collect::<Vec<_>>();
        let total = rows.iter().fold(T::zero(), |acc, &row| acc + row);
        Ok(total / convert(3. * m as f64 * n as f64))
    }

    fn e_step(&self, input: &EStepInput<'_, T>, out: &mut Responsibilities<T>) -> Result<()> {
        if out.data_len() != input.data.len() || out.model_len() != input.model.len() {
            return Err(Error::InvalidArgument("responsibility buffers do not fit the point sets"));
        }
        let Responsibilities {
            psum,
            pt1,
            p1,
            px,
            model_order,
            model_keys,
        } = out;

        sort_model(input, model_order, model_keys);
        match self.path {
            KernelPath::Scalar => data_pass(input, model_order, model_keys, psum, pt1),
            KernelPath::Lanes => data_pass_lanes(input, model_order, model_keys, psum, pt1),
        }
        model_pass(input, psum, p1, px);
        Ok(())
    }
}

/// Orders the model along the data's sort axis.
fn sort_model<T: Real>(input: &EStepInput<'_, T>, order: &mut Vec<usize>, keys: &mut Vec<T>) {
    let column = input.model.column(input.data.axis());
    order.clear();
    order.extend(0..column.len());
    order.sort_unstable_by(|&a, &b| {
        { column[a].partial_cmp(&column[b]) }
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    keys.clear();
    keys.extend(order.iter().map(|&j| column[j]));
}

#[inline]
fn normalize<T: Real>(accum: T, outlier: T) -> (T, T) {
    let total = accum + outlier;
    if total > T::zero() {
        let psum = total.recip();
        (psum, accum * psum)
    } else {
        (T::zero(), T::zero())
    }
}

fn data_pass<T: Real>(
    input: &EStepInput<'_, T>,
    model_order: &[usize],
    model_keys: &[T],
    psum: &mut [T],
    pt1: &mut [T],
) {
    let (x, t) = (input.data.points().columns(), input.model.columns());
    let keys = input.data.keys();
    let (factor, cutoff) = (input.factor(), input.cutoff);

    { psum.par_iter_mut().zip(pt1.par_iter_mut()).enumerate() }.for_each(|(i, (psum, pt1))| {
        let range = match input.windowing {
            Windowing::Sorted => window(model_keys, keys[i], input.half_width(keys[i])),
            Windowing::Dense => 0..model_order.len(),
        };
        let mut accum = T::zero();
        for &j in &model_order[range] {
            let d2 = distance_squared(x, i, t, j);
            if d2 < cutoff {
                accum += (factor * d2).exp();
            }
        }
        (*psum, *pt1) = normalize(accum, input.outlier);
    });
}

/// [`data_pass`] over blocks of [`LANES`] consecutive data points. A short
/// last block repeats its final point in the unused lanes.
fn data_pass_lanes<T: Real>(
    input: &EStepInput<'_, T>,
    model_order: &[usize],
    model_keys: &[T],
    psum: &mut [T],
    pt1: &mut [T],
) {
    let (x, t) = (input.data.points().columns(), input.model.columns());
    let keys = input.data.keys();
    let (factor, cutoff) = (input.factor(), input.cutoff);

    let blocks = psum.par_chunks_mut(LANES).zip(pt1.par_chunks_mut(LANES));
    blocks.enumerate().for_each(|(block, (psum, pt1))| {
        let first = block * LANES;
        let last = first + psum.len() - 1;
        let lanes: [[T; LANES]; 3] = array::from_fn(|axis| {
            array::from_fn(|lane| x[axis][(first + lane).min(last)])
        });

        let range = match input.windowing {
            Windowing::Sorted => {
                let (low, high) = (keys[first], keys[last]);
                let start = window(model_keys, low, input.half_width(low)).start;
                let end = window(model_keys, high, input.half_width(high)).end;
                start..end.max(start)
            }
            Windowing::Dense => 0..model_order.len(),
        };

        let mut accum = [T::zero(); LANES];
        for &j in &model_order[range] {
            let (t0, t1, t2) = (t[0][j], t[1][j], t[2][j]);
            for lane in 0..LANES {
                let d0 = lanes[0][lane] - t0;
                let d1 = lanes[1][lane] - t1;
                let d2 = lanes[2][lane] - t2;
                let d2 = d0 * d0 + d1 * d1 + d2 * d2;
                if d2 < cutoff {
                    accum[lane] += (factor * d2).exp();
                }
            }
        }
        for (lane, (psum, pt1)) in psum.iter_mut().zip(pt1.iter_mut()).enumerate() {
            (*psum, *pt1) = normalize(accum[lane], input.outlier);
        }
    });
}

fn model_pass<T: Real>(input: &EStepInput<'_, T>, psum: &[T], p1: &mut [T], px: &mut PointSet<T>) {
    let (x, t) = (input.data.points().columns(), input.model.columns());
    let keys = input.data.keys();
    let centers = t[input.data.axis()];
    let (factor, cutoff) = (input.factor(), input.cutoff);

    let [px0, px1, px2] = px.columns_mut();
    let outputs = { p1.par_iter_mut().zip(px0.par_iter_mut()) }
        .zip(px1.par_iter_mut())
        .zip(px2.par_iter_mut());
    outputs.enumerate().for_each(|(j, (((p1, px0), px1), px2))| {
        let range = match input.windowing {
            Windowing::Sorted => window(keys, centers[j], input.half_width(centers[j])),
            Windowing::Dense => 0..keys.len(),
        };
        let mut mass = T::zero();
        let mut sum = [T::zero(); 3];
        for i in range {
            let d2 = distance_squared(x, i, t, j);
            if d2 < cutoff {
                let p = (factor * d2).exp() * psum[i];
                mass += p;
                for (axis, s) in sum.iter_mut().enumerate() {
                    *s += p * x[axis][i];
                }
            }
        }
        *p1 = mass;
        (*px0, *px1, *px2) = (sum[0], sum[1], sum[2]);
    });
}
