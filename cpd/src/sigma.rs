use lrcpd_common::{PointSet, Real};
use nalgebra::convert;

use crate::{driver::Guard, estep::Responsibilities};

/// Re-estimates σ² from the responsibilities and the candidate positions:
///
/// `(Σ pt1ᵢ ‖xᵢ‖² + Σ p1ⱼ ‖tⱼ‖² - 2 Σ pxⱼ · tⱼ) / (3 Σ p1)`
///
/// `data` must be in the order `resp` was computed in. Cancellation may leave
/// a tiny negative value, which is reported as zero.
pub fn update_sigma2<T: Real>(
    data: &PointSet<T>,
    candidate: &PointSet<T>,
    resp: &Responsibilities<T>,
    min_mass: T,
) -> Result<T, Guard> {
    let total = resp.total_mass();
    if !total.is_finite() || total <= min_mass {
        return Err(Guard::MassCollapsed);
    }

    let data_term = { data.iter().zip(&resp.pt1) }
        .fold(T::zero(), |acc, (x, &w)| acc + w * x.coords.norm_squared());
    let model_term = { candidate.iter().zip(&resp.p1) }
        .fold(T::zero(), |acc, (t, &w)| acc + w * t.coords.norm_squared());
    let cross = { candidate.iter().zip(resp.px.iter()) }
        .fold(T::zero(), |acc, (t, px)| acc + px.coords.dot(&t.coords));

    let three: T = convert(3.0);
    let two: T = convert(2.0);
    let sigma2 = (data_term + model_term - two * cross) / (three * total);
    if sigma2.is_finite() {
        Ok(sigma2.max(T::zero()))
    } else {
        Err(Guard::VarianceNotFinite)
    }
}
