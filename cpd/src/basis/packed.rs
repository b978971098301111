use std::io::{Read, Write};

use lrcpd_common::{PointSet, Real};
use nalgebra::{DMatrix, DVector};

use super::LowRankBasis;
use crate::{
    config::CpdConfig,
    error::{Error, Result},
};

const MAGIC: [u8; 8] = *b"LRCPDBS1";

/// Bytes of a packed basis over `m` points with rank `k`: Λ, then Λ⁻¹, then Q
/// column-major, each value native-endian.
#[inline]
pub fn packed_len<T: Real>(m: usize, k: usize) -> usize {
    (2 * k + m * k) * T::BYTES
}

/// Builds the basis of `model` straight into `out`.
///
/// Without a buffer only the required length is computed, so a caller can
/// size its storage first and build in a second call.
pub fn build_packed<T: Real>(
    config: &CpdConfig<T>,
    model: &PointSet<T>,
    out: Option<&mut [u8]>,
) -> Result<usize> {
    let m = model.len();
    config.validate_model(m)?;
    let len = packed_len::<T>(m, config.basis.resolve_rank(m)?);
    match out {
        None => Ok(len),
        Some(out) if out.len() != len => Err(Error::InvalidArgument("packed buffer has the wrong size")),
        Some(out) => LowRankBasis::from_config(model, config)?.write_packed(out),
    }
}

impl<T: Real> LowRankBasis<T> {
    #[inline]
    pub fn packed_bytes(&self) -> usize {
        packed_len::<T>(self.len(), self.rank())
    }

    pub fn write_packed(&self, out: &mut [u8]) -> Result<usize> {
        let len = self.packed_bytes();
        if out.len() != len {
            return Err(Error::InvalidArgument("packed buffer has the wrong size"));
        }
        let values = { self.lambda.iter() }
            .chain(self.lambda_inv.iter())
            .chain(self.q.iter());
        for (chunk, &value) in out.chunks_exact_mut(T::BYTES).zip(values) {
            value.write_ne(chunk);
        }
        Ok(len)
    }

    pub fn from_packed(bytes: &[u8], m: usize, k: usize) -> Result<Self> {
        if k == 0 || k > m {
            return Err(Error::InvalidArgument("basis rank out of range"));
        }
        if bytes.len() != packed_len::<T>(m, k) {
            return Err(Error::InvalidArgument("packed buffer has the wrong size"));
        }
        let mut values = bytes.chunks_exact(T::BYTES).map(T::read_ne);
        let lambda = DVector::from_iterator(k, values.by_ref().take(k));
        let lambda_inv = DVector::from_iterator(k, values.by_ref().take(k));
        let q = DMatrix::from_iterator(m, k, values);

        if !lambda.iter().chain(lambda_inv.iter()).all(|&l| l.is_finite() && l > T::zero()) {
            return Err(Error::InvalidArgument("kernel eigenvalues must be positive"));
        }
        if !q.iter().all(|x| x.is_finite()) {
            return Err(Error::InvalidArgument("basis vectors must be finite"));
        }
        Ok(LowRankBasis {
            q,
            lambda,
            lambda_inv,
        })
    }

    /// Writes a self-describing copy of the basis: a magic tag, the scalar
    /// width, `m` and `k`, then the packed layout.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        writer.write_all(&MAGIC)?;
        for field in [T::BYTES, self.len(), self.rank()] {
            writer.write_all(&(field as u64).to_le_bytes())?;
        }
        let mut buf = vec![0u8; self.packed_bytes()];
        self.write_packed(&mut buf)?;
        writer.write_all(&buf)?;
        Ok(writer.flush()?)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let mut magic = [0; 8];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(Error::InvalidArgument("not a packed kernel basis"));
        }
        let mut header = [0; 3];
        for field in &mut header {
            let mut buf = [0; 8];
            reader.read_exact(&mut buf)?;
            *field = usize::try_from(u64::from_le_bytes(buf))
                .map_err(|_| Error::InvalidArgument("basis header out of range"))?;
        }
        let [width, m, k] = header;
        if width != T::BYTES {
            return Err(Error::InvalidArgument("basis was stored with another scalar type"));
        }
        if k == 0 || k > m {
            return Err(Error::InvalidArgument("basis rank out of range"));
        }
        let len = { m.checked_mul(k) }
            .and_then(|mk| mk.checked_add(2 * k))
            .and_then(|count| count.checked_mul(width))
            .ok_or(Error::InvalidArgument("basis header out of range"))?;

        let mut buf = Vec::new();
        reader.take(len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            return Err(Error::InvalidArgument("packed basis is truncated"));
        }
        Self::from_packed(&buf, m, k)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::BufReader};

    use nalgebra::Point3;

    use super::*;
    use crate::config::BasisConfig;

    fn model() -> PointSet<f64> {
        { 0..30 }
            .map(|i| {
                let t = i as f64 * 0.41;
                Point3::new(t.cos(), t.sin(), 0.1 * t)
            })
            .collect()
    }

    #[test]
    fn test_packed_layout() {
        let q = DMatrix::from_column_slice(4, 2, &[1., 0., 0., 0., 0., 1., 0., 0.]);
        let basis = LowRankBasis::from_parts(q, DVector::from_vec(vec![2., 4.])).unwrap();
        assert_eq!(basis.packed_bytes(), 12 * 8);

        let mut buf = vec![0u8; basis.packed_bytes()];
        assert_eq!(basis.write_packed(&mut buf).unwrap(), 96);
        let values = buf.chunks_exact(8).map(f64::read_ne).collect::<Vec<_>>();
        assert_eq!(&values[..4], &[2., 4., 0.5, 0.25]);
        assert_eq!(&values[4..], basis.q().as_slice());

        assert_eq!(LowRankBasis::<f64>::from_packed(&buf, 4, 2).unwrap(), basis);
        assert!(LowRankBasis::<f64>::from_packed(&buf, 5, 2).is_err());
        assert!(LowRankBasis::<f64>::from_packed(&buf[1..], 4, 2).is_err());
        assert!(basis.write_packed(&mut buf[..95]).is_err());
    }

    #[test]
    fn test_two_call() {
        let model = model();
        let config = CpdConfig::default().with_rank(5);
        let len = build_packed(&config, &model, None).unwrap();
        assert_eq!(len, packed_len::<f64>(30, 5));
        assert!(build_packed(&config, &model, Some(vec![0u8; len - 1].as_mut_slice())).is_err());

        let mut buf = vec![0u8; len];
        assert_eq!(build_packed(&config, &model, Some(buf.as_mut_slice())).unwrap(), len);
        let basis = LowRankBasis::<f64>::from_packed(&buf, 30, 5).unwrap();
        let direct = LowRankBasis::from_config(&model, &config).unwrap();
        assert_eq!(basis, direct);

        let config = config.with_rank(31);
        assert!(build_packed(&config, &model, None).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let model = model();
        let basis = LowRankBasis::build(&model, 1.2, &BasisConfig::default()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.basis");
        basis.write_to(File::create(&path).unwrap()).unwrap();
        let read = LowRankBasis::read_from(BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(read, basis);

        assert!(LowRankBasis::<f32>::read_from(File::open(&path).unwrap()).is_err());
        let truncated = std::fs::read(&path).unwrap();
        assert!(LowRankBasis::<f64>::read_from(&truncated[..truncated.len() - 3]).is_err());
    }
}
