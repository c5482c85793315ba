use half::{bf16, f16};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::Debug;

use crate::{
    distance::*,
    error::IndexError,
};

/// Scalar encodings a vector can be stored in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    /// 64-bit double-precision IEEE 754 floating-point number.
    F64,
    /// 32-bit single-precision IEEE 754 floating-point number.
    F32,
    /// 16-bit half-precision IEEE 754 floating-point number.
    F16,
    /// 16-bit brain floating point, the f32 exponent with a 7-bit mantissa.
    BF16,
    /// 8-bit signed integer, `[-1, 1]` floats scaled to `[-127, 127]`.
    I8,
    /// 1-bit binary value, packed 8 per byte.
    B1,
}

impl ScalarKind {
    /// Native code of this scalar kind as used by the binding layer.
    pub fn code(self) -> i32 {
        match self {
            ScalarKind::F32 => 1,
            ScalarKind::F64 => 2,
            ScalarKind::F16 => 3,
            ScalarKind::I8 => 4,
            ScalarKind::B1 => 5,
            ScalarKind::BF16 => 6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarKind::F64 => "f64",
            ScalarKind::F32 => "f32",
            ScalarKind::F16 => "f16",
            ScalarKind::BF16 => "bf16",
            ScalarKind::I8 => "i8",
            ScalarKind::B1 => "b1",
        }
    }

    /// Number of stored scalars per vector of the given dimensionality.
    pub fn words(self, dimensions: usize) -> usize {
        match self {
            ScalarKind::B1 => dimensions.div_ceil(8),
            _ => dimensions,
        }
    }

    /// Whether the kernel set of this encoding can compute `metric`.
    pub fn supports(self, metric: MetricKind) -> bool {
        if metric == MetricKind::Custom {
            return true;
        }
        match self {
            ScalarKind::F64 => f64::kernel(metric).is_some(),
            ScalarKind::F32 => f32::kernel(metric).is_some(),
            ScalarKind::F16 => f16::kernel(metric).is_some(),
            ScalarKind::BF16 => bf16::kernel(metric).is_some(),
            ScalarKind::I8 => i8::kernel(metric).is_some(),
            ScalarKind::B1 => B1x8::kernel(metric).is_some(),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            ScalarKind::F64 | ScalarKind::F32 | ScalarKind::F16 | ScalarKind::BF16
        )
    }
}

impl TryFrom<i32> for ScalarKind {
    type Error = IndexError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(ScalarKind::F32),
            2 => Ok(ScalarKind::F64),
            3 => Ok(ScalarKind::F16),
            4 => Ok(ScalarKind::I8),
            5 => Ok(ScalarKind::B1),
            6 => Ok(ScalarKind::BF16),
            _ => Err(IndexError::invalid_options(format!(
                "unknown scalar kind code {code}"
            ))),
        }
    }
}

/// Eight packed binary components. Bit `i` of a vector lives in byte `i / 8`,
/// most significant bit first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct B1x8(pub u8);

impl B1x8 {
    /// Packs boolean components into bytes.
    pub fn pack(bits: &[bool]) -> Vec<B1x8> {
        let mut out = vec![B1x8(0); bits.len().div_ceil(8)];
        for (i, _) in bits.iter().enumerate().filter(|(_, b)| **b) {
            out[i / 8].0 |= 0x80 >> (i % 8);
        }
        out
    }

    /// Unpacks the first `dimensions` components.
    pub fn unpack(packed: &[B1x8], dimensions: usize) -> Vec<bool> {
        (0..dimensions)
            .map(|i| packed.get(i / 8).is_some_and(|b| b.0 & (0x80 >> (i % 8)) != 0))
            .collect()
    }
}

/// A vector lifted out of its encoding, the common currency for conversions
/// between the caller's scalar type and the stored one.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Floats(Vec<f64>),
    Int8(Vec<i8>),
    /// Packed bytes, most significant bit first.
    Bits(Vec<u8>),
}

impl Decoded {
    /// Number of scalars (bytes for packed bits).
    pub fn len(&self) -> usize {
        match self {
            Decoded::Floats(v) => v.len(),
            Decoded::Int8(v) => v.len(),
            Decoded::Bits(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn bit(bytes: &[u8], i: usize) -> bool {
        bytes.get(i / 8).is_some_and(|b| b & (0x80 >> (i % 8)) != 0)
    }

    pub(crate) fn to_floats(&self, dimensions: usize) -> Vec<f64> {
        match self {
            Decoded::Floats(v) => v.clone(),
            Decoded::Int8(v) => v.iter().map(|&x| x as f64 / 127.0).collect(),
            Decoded::Bits(v) => (0..dimensions)
                .map(|i| if Self::bit(v, i) { 1.0 } else { 0.0 })
                .collect(),
        }
    }

    pub(crate) fn to_int8(&self, dimensions: usize) -> Vec<i8> {
        match self {
            Decoded::Floats(v) => v
                .iter()
                .map(|&x| (x.clamp(-1.0, 1.0) * 127.0).round() as i8)
                .collect(),
            Decoded::Int8(v) => v.clone(),
            Decoded::Bits(v) => (0..dimensions)
                .map(|i| if Self::bit(v, i) { 127 } else { 0 })
                .collect(),
        }
    }

    pub(crate) fn to_bits(&self, dimensions: usize) -> Vec<u8> {
        let mut out = vec![0u8; dimensions.div_ceil(8)];
        match self {
            Decoded::Floats(v) => {
                for (i, _) in v.iter().enumerate().filter(|(_, x)| **x > 0.0) {
                    out[i / 8] |= 0x80 >> (i % 8);
                }
            }
            Decoded::Int8(v) => {
                for (i, _) in v.iter().enumerate().filter(|(_, x)| **x > 0) {
                    out[i / 8] |= 0x80 >> (i % 8);
                }
            }
            Decoded::Bits(v) => {
                out.iter_mut().zip(v).for_each(|(o, b)| *o = *b);
                let tail = dimensions % 8;
                if tail != 0 {
                    if let Some(last) = out.last_mut() {
                        *last &= 0xFFu8 << (8 - tail);
                    }
                }
            }
        }
        out
    }

    /// Scales float components to unit length. Other encodings pass through.
    pub(crate) fn normalized(self) -> Self {
        match self {
            Decoded::Floats(v) => {
                let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
                if norm > f64::EPSILON {
                    Decoded::Floats(v.into_iter().map(|x| x / norm).collect())
                } else {
                    Decoded::Floats(v)
                }
            }
            other => other,
        }
    }
}

/// A scalar type vectors can be passed in, read out and stored as.
///
/// Each implementation provides the capability set the index needs from an
/// encoding: decoding into [`Decoded`], encoding from it, widening to f32 for
/// user-defined metrics, and the distance kernels that work on the encoding
/// directly.
pub trait Scalar:
    Copy + Debug + Default + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const KIND: ScalarKind;

    /// Number of `Self` values per vector.
    fn words(dimensions: usize) -> usize {
        Self::KIND.words(dimensions)
    }

    fn decode(src: &[Self]) -> Decoded;

    fn encode(src: &Decoded, dimensions: usize) -> Vec<Self>;

    /// Appends the components of `src` as f32 values to `out`.
    fn widen(src: &[Self], out: &mut Vec<f32>);

    /// The kernel computing `metric` on this encoding, if there is one.
    fn kernel(metric: MetricKind) -> Option<Kernel<Self>>;
}

impl Scalar for f64 {
    const KIND: ScalarKind = ScalarKind::F64;

    fn decode(src: &[Self]) -> Decoded {
        Decoded::Floats(src.to_vec())
    }

    fn encode(src: &Decoded, dimensions: usize) -> Vec<Self> {
        src.to_floats(dimensions)
    }

    fn widen(src: &[Self], out: &mut Vec<f32>) {
        out.extend(src.iter().map(|&x| x as f32));
    }

    fn kernel(metric: MetricKind) -> Option<Kernel<Self>> {
        let kernel: Kernel<Self> = match metric {
            MetricKind::L2sq => l2sq,
            MetricKind::Cos => cosine,
            MetricKind::IP => inner_product,
            MetricKind::Pearson => pearson,
            MetricKind::Haversine => haversine,
            MetricKind::Divergence => divergence,
            MetricKind::Tanimoto => tanimoto,
            MetricKind::Sorensen => sorensen,
            _ => return None,
        };
        Some(kernel)
    }
}

impl Scalar for f32 {
    const KIND: ScalarKind = ScalarKind::F32;

    fn decode(src: &[Self]) -> Decoded {
        Decoded::Floats(src.iter().map(|&x| x as f64).collect())
    }

    fn encode(src: &Decoded, dimensions: usize) -> Vec<Self> {
        match src {
            Decoded::Floats(v) => v.iter().map(|&x| x as f32).collect(),
            other => other.to_floats(dimensions).into_iter().map(|x| x as f32).collect(),
        }
    }

    fn widen(src: &[Self], out: &mut Vec<f32>) {
        out.extend_from_slice(src);
    }

    fn kernel(metric: MetricKind) -> Option<Kernel<Self>> {
        let kernel: Kernel<Self> = match metric {
            MetricKind::L2sq => l2sq_f32,
            MetricKind::Cos => cosine_f32,
            MetricKind::IP => inner_product_f32,
            MetricKind::Pearson => pearson,
            MetricKind::Haversine => haversine,
            MetricKind::Divergence => divergence,
            MetricKind::Tanimoto => tanimoto,
            MetricKind::Sorensen => sorensen,
            _ => return None,
        };
        Some(kernel)
    }
}

impl Scalar for f16 {
    const KIND: ScalarKind = ScalarKind::F16;

    fn decode(src: &[Self]) -> Decoded {
        Decoded::Floats(src.iter().map(|x| x.to_f64()).collect())
    }

    fn encode(src: &Decoded, dimensions: usize) -> Vec<Self> {
        src.to_floats(dimensions)
            .into_iter()
            .map(f16::from_f64)
            .collect()
    }

    fn widen(src: &[Self], out: &mut Vec<f32>) {
        out.extend(src.iter().map(|x| x.to_f32()));
    }

    fn kernel(metric: MetricKind) -> Option<Kernel<Self>> {
        widened_kernel(metric)
    }
}

impl Scalar for bf16 {
    const KIND: ScalarKind = ScalarKind::BF16;

    fn decode(src: &[Self]) -> Decoded {
        Decoded::Floats(src.iter().map(|x| x.to_f64()).collect())
    }

    fn encode(src: &Decoded, dimensions: usize) -> Vec<Self> {
        src.to_floats(dimensions)
            .into_iter()
            .map(bf16::from_f64)
            .collect()
    }

    fn widen(src: &[Self], out: &mut Vec<f32>) {
        out.extend(src.iter().map(|x| x.to_f32()));
    }

    fn kernel(metric: MetricKind) -> Option<Kernel<Self>> {
        widened_kernel(metric)
    }
}

impl Scalar for i8 {
    const KIND: ScalarKind = ScalarKind::I8;

    fn decode(src: &[Self]) -> Decoded {
        Decoded::Int8(src.to_vec())
    }

    fn encode(src: &Decoded, dimensions: usize) -> Vec<Self> {
        src.to_int8(dimensions)
    }

    fn widen(src: &[Self], out: &mut Vec<f32>) {
        out.extend(src.iter().map(|&x| x as f32 / 127.0));
    }

    fn kernel(metric: MetricKind) -> Option<Kernel<Self>> {
        let kernel: Kernel<Self> = match metric {
            MetricKind::L2sq => l2sq_i8,
            MetricKind::Cos => cosine_i8,
            MetricKind::IP => inner_product_i8,
            _ => return None,
        };
        Some(kernel)
    }
}

impl Scalar for B1x8 {
    const KIND: ScalarKind = ScalarKind::B1;

    fn decode(src: &[Self]) -> Decoded {
        Decoded::Bits(src.iter().map(|b| b.0).collect())
    }

    fn encode(src: &Decoded, dimensions: usize) -> Vec<Self> {
        src.to_bits(dimensions).into_iter().map(B1x8).collect()
    }

    fn widen(src: &[Self], out: &mut Vec<f32>) {
        for b in src {
            out.extend((0..8).map(|i| if b.0 & (0x80 >> i) != 0 { 1.0 } else { 0.0 }));
        }
    }

    fn kernel(metric: MetricKind) -> Option<Kernel<Self>> {
        let kernel: Kernel<Self> = match metric {
            MetricKind::Hamming => hamming_b1,
            MetricKind::Jaccard | MetricKind::Tanimoto => jaccard_b1,
            MetricKind::Sorensen => sorensen_b1,
            _ => return None,
        };
        Some(kernel)
    }
}

fn widened_kernel<E: Scalar>(metric: MetricKind) -> Option<Kernel<E>> {
    let kernel: Kernel<E> = match metric {
        MetricKind::L2sq => widened_l2sq::<E>,
        MetricKind::Cos => widened_cosine::<E>,
        MetricKind::IP => widened_inner_product::<E>,
        MetricKind::Pearson => widened_pearson::<E>,
        MetricKind::Haversine => widened_haversine::<E>,
        MetricKind::Divergence => widened_divergence::<E>,
        MetricKind::Tanimoto => widened_tanimoto::<E>,
        MetricKind::Sorensen => widened_sorensen::<E>,
        _ => return None,
    };
    Some(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for kind in [
            ScalarKind::F64,
            ScalarKind::F32,
            ScalarKind::F16,
            ScalarKind::BF16,
            ScalarKind::I8,
            ScalarKind::B1,
        ] {
            assert_eq!(ScalarKind::try_from(kind.code()).unwrap(), kind);
        }
        assert!(matches!(
            ScalarKind::try_from(0),
            Err(IndexError::InvalidOptions { .. })
        ));
        assert!(ScalarKind::try_from(42).is_err());
    }

    #[test]
    fn test_words() {
        assert_eq!(ScalarKind::F32.words(10), 10);
        assert_eq!(ScalarKind::B1.words(8), 1);
        assert_eq!(ScalarKind::B1.words(9), 2);
        assert_eq!(B1x8::words(17), 3);
    }

    #[test]
    fn test_metric_support() {
        assert!(ScalarKind::F32.supports(MetricKind::L2sq));
        assert!(ScalarKind::F16.supports(MetricKind::Divergence));
        assert!(!ScalarKind::F32.supports(MetricKind::Hamming));
        assert!(!ScalarKind::F64.supports(MetricKind::Jaccard));
        assert!(ScalarKind::I8.supports(MetricKind::Cos));
        assert!(!ScalarKind::I8.supports(MetricKind::Pearson));
        assert!(ScalarKind::B1.supports(MetricKind::Hamming));
        assert!(ScalarKind::B1.supports(MetricKind::Tanimoto));
        assert!(!ScalarKind::B1.supports(MetricKind::L2sq));
        assert!(ScalarKind::B1.supports(MetricKind::Custom));
    }

    #[test]
    fn test_pack_unpack() {
        let bits = [true, false, true, true, false, false, false, false, true];
        let packed = B1x8::pack(&bits);
        assert_eq!(packed, vec![B1x8(0b1011_0000), B1x8(0b1000_0000)]);
        assert_eq!(B1x8::unpack(&packed, bits.len()), bits);
    }

    #[test]
    fn test_int8_conversions() {
        // i8 -> f32 -> i8 is lossless.
        let raw: Vec<i8> = vec![-18, 127, 0, -127, 64];
        let stored = f32::encode(&i8::decode(&raw), raw.len());
        let back = i8::encode(&f32::decode(&stored), raw.len());
        assert_eq!(back, raw);

        // Floats are clamped into [-1, 1] before scaling.
        let q = i8::encode(&Decoded::Floats(vec![2.0, -3.0, 0.5]), 3);
        assert_eq!(q, vec![127, -127, 64]);
    }

    #[test]
    fn test_bits_conversions() {
        let floats = Decoded::Floats(vec![0.3, -1.0, 0.0, 2.0, 0.1, 0.0, 0.0, 0.0, 5.0, -2.0]);
        let bits = B1x8::encode(&floats, 10);
        assert_eq!(bits, vec![B1x8(0b1001_1000), B1x8(0b1000_0000)]);

        let widened = f32::encode(&B1x8::decode(&bits), 10);
        assert_eq!(widened, vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);

        // Trailing bits past the dimensionality are masked off.
        let noisy = B1x8::encode(&Decoded::Bits(vec![0xFF, 0xFF]), 10);
        assert_eq!(noisy, vec![B1x8(0xFF), B1x8(0b1100_0000)]);
    }

    #[test]
    fn test_half_conversions() {
        let pi = std::f64::consts::PI;
        let halves = f16::encode(&f64::decode(&[pi, -pi, 0.0]), 3);
        assert_eq!(halves[0], f16::from_f64(pi));
        let brains = bf16::encode(&f16::decode(&halves), 3);
        assert!((brains[1].to_f32() + std::f32::consts::PI).abs() < 0.02);
    }

    #[test]
    fn test_normalized() {
        let v = Decoded::Floats(vec![3.0, 4.0]).normalized();
        assert_eq!(v, Decoded::Floats(vec![0.6, 0.8]));
        let zero = Decoded::Floats(vec![0.0, 0.0]).normalized();
        assert_eq!(zero, Decoded::Floats(vec![0.0, 0.0]));
        let raw = Decoded::Int8(vec![3, 4]).normalized();
        assert_eq!(raw, Decoded::Int8(vec![3, 4]));
    }
}
