use ndarray::{ArrayView1, NdFloat};
use serde::{Deserialize, Serialize};
use std::{cell::RefCell, fmt, sync::Arc, sync::OnceLock};

use crate::{
    error::IndexError,
    scalar::{B1x8, Scalar, ScalarKind},
};

/// Distance metric types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Squared Euclidean distance.
    L2sq,
    /// Cosine distance (1 - cosine similarity).
    Cos,
    /// Inner product distance (1 - dot product).
    IP,
    /// Number of differing bits.
    Hamming,
    /// 1 - |a ∩ b| / |a ∪ b| over set bits.
    Jaccard,
    /// Great-circle central angle between `[lat, lon]` pairs in radians.
    Haversine,
    /// 1 - Pearson correlation.
    Pearson,
    /// 1 - 2|a ∩ b| / (|a| + |b|), with a continuous form for floats.
    Sorensen,
    /// Jaccard over bits, 1 - a·b / (a·a + b·b - a·b) over floats.
    Tanimoto,
    /// Jensen-Shannon divergence between probability distributions.
    Divergence,
    /// A user-defined distance function.
    Custom,
}

impl MetricKind {
    /// Native code of this metric as used by the binding layer.
    /// User-defined metrics have no native code.
    pub fn code(self) -> Option<i32> {
        match self {
            MetricKind::Cos => Some(1),
            MetricKind::IP => Some(2),
            MetricKind::L2sq => Some(3),
            MetricKind::Haversine => Some(4),
            MetricKind::Divergence => Some(5),
            MetricKind::Pearson => Some(6),
            MetricKind::Jaccard => Some(7),
            MetricKind::Hamming => Some(8),
            MetricKind::Tanimoto => Some(9),
            MetricKind::Sorensen => Some(10),
            MetricKind::Custom => None,
        }
    }
}

impl TryFrom<i32> for MetricKind {
    type Error = IndexError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(MetricKind::Cos),
            2 => Ok(MetricKind::IP),
            3 => Ok(MetricKind::L2sq),
            4 => Ok(MetricKind::Haversine),
            5 => Ok(MetricKind::Divergence),
            6 => Ok(MetricKind::Pearson),
            7 => Ok(MetricKind::Jaccard),
            8 => Ok(MetricKind::Hamming),
            9 => Ok(MetricKind::Tanimoto),
            10 => Ok(MetricKind::Sorensen),
            _ => Err(IndexError::invalid_options(format!(
                "unknown metric kind code {code}"
            ))),
        }
    }
}

/// A distance kernel over two vectors in the same encoding.
pub type Kernel<E> = fn(&[E], &[E]) -> f32;

/// A user-defined distance over widened f32 components.
pub type CustomDistance = Arc<dyn Fn(&[f32], &[f32]) -> f32 + Send + Sync>;

/// The metric an index ranks candidates by.
#[derive(Clone)]
pub struct Metric {
    kind: MetricKind,
    custom: Option<CustomDistance>,
}

impl fmt::Debug for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metric")
            .field("kind", &self.kind)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

impl Metric {
    /// A built-in metric. Fails for [`MetricKind::Custom`], which needs a function.
    pub fn builtin(kind: MetricKind) -> Result<Self, IndexError> {
        if kind == MetricKind::Custom {
            return Err(IndexError::invalid_options(
                "custom metric requires a distance function",
            ));
        }
        Ok(Self { kind, custom: None })
    }

    /// A user-defined metric. The function receives both vectors widened to f32;
    /// packed bits arrive as 0.0/1.0 per bit, padded to a multiple of 8.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[f32], &[f32]) -> f32 + Send + Sync + 'static,
    {
        Self {
            kind: MetricKind::Custom,
            custom: Some(Arc::new(f)),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub(crate) fn custom_fn(&self) -> Option<&CustomDistance> {
        self.custom.as_ref()
    }

    /// Resolves the kernel for encoding `E`, failing when the pair is unsupported.
    pub(crate) fn resolve<E: Scalar>(&self) -> Result<Distance<'_, E>, IndexError> {
        match (&self.custom, self.kind) {
            (Some(f), MetricKind::Custom) => Ok(Distance::Custom(f)),
            (_, kind) => E::kernel(kind).map(Distance::Kernel).ok_or_else(|| {
                IndexError::invalid_options(format!(
                    "metric {:?} is not supported for scalar kind {}",
                    kind,
                    E::KIND.name()
                ))
            }),
        }
    }

    /// Computes the distance between two vectors using the selected metric.
    ///
    /// # Arguments
    ///
    /// * `a` - First vector
    /// * `b` - Second vector
    ///
    /// # Returns
    ///
    /// * `Result<f32, IndexError>` - The computed distance or an error if the dimensions don't match.
    pub fn compute<E: Scalar>(&self, a: &[E], b: &[E]) -> Result<f32, IndexError> {
        if a.len() != b.len() {
            return Err(IndexError::DimensionMismatch {
                expected: a.len(),
                got: b.len(),
            });
        }
        Ok(self.resolve::<E>()?.compute(a, b))
    }
}

/// A resolved distance function for one encoding.
pub(crate) enum Distance<'a, E> {
    Kernel(Kernel<E>),
    Custom(&'a CustomDistance),
}

impl<E: Scalar> Distance<'_, E> {
    #[inline]
    pub(crate) fn compute(&self, a: &[E], b: &[E]) -> f32 {
        match self {
            Distance::Kernel(kernel) => kernel(a, b),
            Distance::Custom(f) => with_widened(a, b, |a, b| f(a, b)),
        }
    }
}

// 使用线程本地存储的缓冲区，避免频繁分配内存
thread_local! {
    static A_BUFFER: RefCell<Vec<f32>> = RefCell::new(Vec::with_capacity(1024));
    static B_BUFFER: RefCell<Vec<f32>> = RefCell::new(Vec::with_capacity(1024));
}

/// Widens both vectors into thread-local f32 buffers and applies `f`.
#[inline]
fn with_widened<E, F>(a: &[E], b: &[E], f: F) -> f32
where
    E: Scalar,
    F: FnOnce(&[f32], &[f32]) -> f32,
{
    A_BUFFER.with_borrow_mut(|a_buf| {
        B_BUFFER.with_borrow_mut(|b_buf| {
            a_buf.clear();
            b_buf.clear();
            E::widen(a, a_buf);
            E::widen(b, b_buf);
            f(a_buf.as_slice(), b_buf.as_slice())
        })
    })
}

macro_rules! widened_kernels {
    ($($name:ident => $kernel:expr),* $(,)?) => {
        $(
            pub(crate) fn $name<E: Scalar>(a: &[E], b: &[E]) -> f32 {
                with_widened(a, b, $kernel)
            }
        )*
    };
}

widened_kernels! {
    widened_l2sq => l2sq_f32,
    widened_cosine => cosine_f32,
    widened_inner_product => inner_product_f32,
    widened_pearson => pearson::<f32>,
    widened_haversine => haversine::<f32>,
    widened_divergence => divergence::<f32>,
    widened_tanimoto => tanimoto::<f32>,
    widened_sorensen => sorensen::<f32>,
}

#[inline]
fn cosine_from(ab: f64, aa: f64, bb: f64) -> f32 {
    let (a_zero, b_zero) = (aa <= f64::EPSILON, bb <= f64::EPSILON);
    if a_zero && b_zero {
        return 0.0;
    }
    if a_zero || b_zero {
        return 1.0;
    }
    (1.0 - ab / (aa.sqrt() * bb.sqrt())).max(0.0) as f32
}

/// Squared Euclidean distance.
#[inline]
pub fn l2sq<A: NdFloat + Into<f64>>(a: &[A], b: &[A]) -> f32 {
    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);
    let diff = &a - &b;
    let d: f64 = diff.dot(&diff).into();
    d as f32
}

/// Cosine distance. Two zero vectors are identical, one zero vector is orthogonal.
#[inline]
pub fn cosine<A: NdFloat + Into<f64>>(a: &[A], b: &[A]) -> f32 {
    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);
    cosine_from(a.dot(&b).into(), a.dot(&a).into(), b.dot(&b).into())
}

/// Inner product distance, `1 - a·b`.
///
/// Only a proper distance over unit-length vectors, where it lies in `[0, 2]`
/// and equals cosine distance. Unnormalized input is not rescaled: the result
/// goes negative once `a·b > 1` and self distance is `1 - |a|²`.
#[inline]
pub fn inner_product<A: NdFloat + Into<f64>>(a: &[A], b: &[A]) -> f32 {
    let ab: f64 = ArrayView1::from(a).dot(&ArrayView1::from(b)).into();
    (1.0 - ab) as f32
}

/// Pearson distance, `1 - r`. A constant vector has no correlation.
#[inline]
pub fn pearson<A: NdFloat + Into<f64>>(a: &[A], b: &[A]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    let n = a.len() as f64;
    let mean = |v: &[A]| v.iter().map(|&x| Into::<f64>::into(x)).sum::<f64>() / n;
    let (ma, mb) = (mean(a), mean(b));
    let (mut ab, mut aa, mut bb) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y): (f64, f64) = (x.into(), y.into());
        let (x, y) = (x - ma, y - mb);
        ab += x * y;
        aa += x * x;
        bb += y * y;
    }
    cosine_from(ab, aa, bb)
}

/// Haversine central angle between two `[latitude, longitude]` points in radians.
#[inline]
pub fn haversine<A: NdFloat + Into<f64>>(a: &[A], b: &[A]) -> f32 {
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }
    let (lat1, lon1): (f64, f64) = (a[0].into(), a[1].into());
    let (lat2, lon2): (f64, f64) = (b[0].into(), b[1].into());
    let h = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
    (2.0 * h.clamp(0.0, 1.0).sqrt().asin()) as f32
}

/// Jensen-Shannon divergence. Non-positive components contribute nothing.
#[inline]
pub fn divergence<A: NdFloat + Into<f64>>(a: &[A], b: &[A]) -> f32 {
    let mut d = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y): (f64, f64) = (x.into(), y.into());
        let m = (x + y) / 2.0;
        if m <= 0.0 {
            continue;
        }
        if x > 0.0 {
            d += x * (x / m).ln();
        }
        if y > 0.0 {
            d += y * (y / m).ln();
        }
    }
    (d / 2.0).max(0.0) as f32
}

/// Continuous Tanimoto distance, `1 - a·b / (a·a + b·b - a·b)`.
#[inline]
pub fn tanimoto<A: NdFloat + Into<f64>>(a: &[A], b: &[A]) -> f32 {
    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);
    let (ab, aa, bb): (f64, f64, f64) = (a.dot(&b).into(), a.dot(&a).into(), b.dot(&b).into());
    let denom = aa + bb - ab;
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (1.0 - ab / denom).max(0.0) as f32
}

/// Continuous Sorensen-Dice distance, `1 - 2a·b / (a·a + b·b)`.
#[inline]
pub fn sorensen<A: NdFloat + Into<f64>>(a: &[A], b: &[A]) -> f32 {
    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);
    let (ab, aa, bb): (f64, f64, f64) = (a.dot(&b).into(), a.dot(&a).into(), b.dot(&b).into());
    let denom = aa + bb;
    if denom <= f64::EPSILON {
        return 0.0;
    }
    (1.0 - 2.0 * ab / denom).max(0.0) as f32
}

#[inline]
fn dot_i8(a: &[i8], b: &[i8]) -> i64 {
    a.iter().zip(b).map(|(&x, &y)| x as i64 * y as i64).sum()
}

/// Squared Euclidean distance on quantized components, in decoded units.
#[inline]
pub fn l2sq_i8(a: &[i8], b: &[i8]) -> f32 {
    let d: i64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x as i64 - y as i64;
            d * d
        })
        .sum();
    (d as f64 / (127.0 * 127.0)) as f32
}

#[inline]
pub fn cosine_i8(a: &[i8], b: &[i8]) -> f32 {
    cosine_from(
        dot_i8(a, b) as f64,
        dot_i8(a, a) as f64,
        dot_i8(b, b) as f64,
    )
}

/// Inner product distance in decoded units. Like [`inner_product`] it
/// assumes unit-length input.
#[inline]
pub fn inner_product_i8(a: &[i8], b: &[i8]) -> f32 {
    (1.0 - dot_i8(a, b) as f64 / (127.0 * 127.0)) as f32
}

/// Set-bit counts over two packed bit vectors.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BitCounts {
    /// |a ⊕ b|
    diff: u32,
    /// |a ∩ b|
    inter: u32,
    /// |a ∪ b|
    union: u32,
    /// |a| + |b|
    total: u32,
}

impl BitCounts {
    #[inline(always)]
    fn add(&mut self, x: u64, y: u64) {
        self.diff += (x ^ y).count_ones();
        self.inter += (x & y).count_ones();
        self.union += (x | y).count_ones();
        self.total += x.count_ones() + y.count_ones();
    }
}

/// Counts bits a word at a time. Inlined into the `popcnt` build below so the
/// same loop runs on both paths.
#[inline(always)]
fn count_bits(a: &[B1x8], b: &[B1x8]) -> BitCounts {
    let mut counts = BitCounts::default();
    let (mut wa, mut wb) = (a.chunks_exact(8), b.chunks_exact(8));
    for (x, y) in (&mut wa).zip(&mut wb) {
        let x = u64::from_le_bytes(std::array::from_fn(|i| x[i].0));
        let y = u64::from_le_bytes(std::array::from_fn(|i| y[i].0));
        counts.add(x, y);
    }
    for (x, y) in wa.remainder().iter().zip(wb.remainder()) {
        counts.add(x.0 as u64, y.0 as u64);
    }
    counts
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "popcnt")]
unsafe fn count_bits_popcnt(a: &[B1x8], b: &[B1x8]) -> BitCounts {
    count_bits(a, b)
}

/// Whether bit kernels run on the hardware population count.
pub fn popcnt_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        is_x86_feature_detected!("popcnt")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

#[inline]
fn bit_counts(a: &[B1x8], b: &[B1x8]) -> BitCounts {
    #[cfg(target_arch = "x86_64")]
    {
        if popcnt_available() {
            // SAFETY: popcnt 已在运行时检测到
            return unsafe { count_bits_popcnt(a, b) };
        }
    }
    count_bits(a, b)
}

/// Number of differing bits.
#[inline]
pub fn hamming_b1(a: &[B1x8], b: &[B1x8]) -> f32 {
    bit_counts(a, b).diff as f32
}

/// Jaccard (Tanimoto) distance over set bits. Two empty sets are identical.
#[inline]
pub fn jaccard_b1(a: &[B1x8], b: &[B1x8]) -> f32 {
    let counts = bit_counts(a, b);
    if counts.union == 0 {
        return 0.0;
    }
    1.0 - counts.inter as f32 / counts.union as f32
}

/// Sorensen-Dice distance over set bits. Two empty sets are identical.
#[inline]
pub fn sorensen_b1(a: &[B1x8], b: &[B1x8]) -> f32 {
    let counts = bit_counts(a, b);
    if counts.total == 0 {
        return 0.0;
    }
    1.0 - 2.0 * counts.inter as f32 / counts.total as f32
}

/// Detected SIMD capability of the executing processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdCapability {
    /// No SIMD (scalar fallback)
    Serial,
    /// AVX2 + FMA (x86_64)
    Avx2,
    /// NEON (aarch64)
    Neon,
}

impl SimdCapability {
    /// Detect CPU SIMD capabilities at runtime
    #[allow(unreachable_code)]
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return SimdCapability::Avx2;
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            return SimdCapability::Neon;
        }

        SimdCapability::Serial
    }

    pub fn name(self) -> &'static str {
        match self {
            SimdCapability::Serial => "serial",
            SimdCapability::Avx2 => "haswell",
            SimdCapability::Neon => "neon",
        }
    }
}

static SIMD_CAPABILITY: OnceLock<SimdCapability> = OnceLock::new();

/// Cached SIMD capability of the executing processor.
pub fn simd_capability() -> SimdCapability {
    *SIMD_CAPABILITY.get_or_init(SimdCapability::detect)
}

/// Squared Euclidean distance over f32, dispatched on [`simd_capability`].
#[inline]
pub fn l2sq_f32(a: &[f32], b: &[f32]) -> f32 {
    match simd_capability() {
        // SAFETY: avx2 与 fma 已在运行时检测到
        #[cfg(target_arch = "x86_64")]
        SimdCapability::Avx2 => unsafe { x86::l2sq(a, b) },
        #[cfg(target_arch = "aarch64")]
        SimdCapability::Neon => unsafe { neon::l2sq(a, b) },
        _ => l2sq(a, b),
    }
}

/// `(a·b, a·a, b·b)` over f32, dispatched on [`simd_capability`].
#[inline]
fn dots_f32(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    match simd_capability() {
        #[cfg(target_arch = "x86_64")]
        SimdCapability::Avx2 => unsafe { x86::dots(a, b) },
        #[cfg(target_arch = "aarch64")]
        SimdCapability::Neon => unsafe { neon::dots(a, b) },
        _ => {
            let (va, vb) = (ArrayView1::from(a), ArrayView1::from(b));
            (va.dot(&vb), va.dot(&va), vb.dot(&vb))
        }
    }
}

/// Cosine distance over f32, dispatched on [`simd_capability`].
#[inline]
pub fn cosine_f32(a: &[f32], b: &[f32]) -> f32 {
    let (ab, aa, bb) = dots_f32(a, b);
    cosine_from(ab as f64, aa as f64, bb as f64)
}

/// Inner product distance over f32, dispatched on [`simd_capability`].
/// Assumes unit-length input, see [`inner_product`].
#[inline]
pub fn inner_product_f32(a: &[f32], b: &[f32]) -> f32 {
    let ab = match simd_capability() {
        #[cfg(target_arch = "x86_64")]
        SimdCapability::Avx2 => unsafe { x86::dot(a, b) },
        #[cfg(target_arch = "aarch64")]
        SimdCapability::Neon => unsafe { neon::dot(a, b) },
        _ => ArrayView1::from(a).dot(&ArrayView1::from(b)),
    };
    (1.0 - ab as f64) as f32
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use std::arch::x86_64::*;

    #[inline]
    #[target_feature(enable = "avx")]
    unsafe fn hsum(v: __m256) -> f32 {
        let hi = _mm256_extractf128_ps(v, 1);
        let lo = _mm256_castps256_ps128(v);
        let sum = _mm_add_ps(lo, hi);
        let sum = _mm_add_ps(sum, _mm_movehl_ps(sum, sum));
        let sum = _mm_add_ss(sum, _mm_shuffle_ps(sum, sum, 1));
        _mm_cvtss_f32(sum)
    }

    #[target_feature(enable = "avx2", enable = "fma")]
    pub(super) unsafe fn l2sq(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let tail = n - n % 8;
        let mut acc = _mm256_setzero_ps();
        for i in (0..tail).step_by(8) {
            // SAFETY: i + 8 <= n
            let (va, vb) = unsafe {
                (
                    _mm256_loadu_ps(a.as_ptr().add(i)),
                    _mm256_loadu_ps(b.as_ptr().add(i)),
                )
            };
            let d = _mm256_sub_ps(va, vb);
            acc = _mm256_fmadd_ps(d, d, acc);
        }
        let mut sum = unsafe { hsum(acc) };
        for i in tail..n {
            let d = a[i] - b[i];
            sum += d * d;
        }
        sum
    }

    #[target_feature(enable = "avx2", enable = "fma")]
    pub(super) unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let tail = n - n % 8;
        let mut acc = _mm256_setzero_ps();
        for i in (0..tail).step_by(8) {
            let (va, vb) = unsafe {
                (
                    _mm256_loadu_ps(a.as_ptr().add(i)),
                    _mm256_loadu_ps(b.as_ptr().add(i)),
                )
            };
            acc = _mm256_fmadd_ps(va, vb, acc);
        }
        let mut sum = unsafe { hsum(acc) };
        for i in tail..n {
            sum += a[i] * b[i];
        }
        sum
    }

    #[target_feature(enable = "avx2", enable = "fma")]
    pub(super) unsafe fn dots(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
        let n = a.len().min(b.len());
        let tail = n - n % 8;
        let (mut ab, mut aa, mut bb) = (
            _mm256_setzero_ps(),
            _mm256_setzero_ps(),
            _mm256_setzero_ps(),
        );
        for i in (0..tail).step_by(8) {
            let (va, vb) = unsafe {
                (
                    _mm256_loadu_ps(a.as_ptr().add(i)),
                    _mm256_loadu_ps(b.as_ptr().add(i)),
                )
            };
            ab = _mm256_fmadd_ps(va, vb, ab);
            aa = _mm256_fmadd_ps(va, va, aa);
            bb = _mm256_fmadd_ps(vb, vb, bb);
        }
        let (mut ab, mut aa, mut bb) = unsafe { (hsum(ab), hsum(aa), hsum(bb)) };
        for i in tail..n {
            ab += a[i] * b[i];
            aa += a[i] * a[i];
            bb += b[i] * b[i];
        }
        (ab, aa, bb)
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    #[target_feature(enable = "neon")]
    pub(super) unsafe fn l2sq(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let tail = n - n % 4;
        let mut acc = vdupq_n_f32(0.0);
        for i in (0..tail).step_by(4) {
            // SAFETY: i + 4 <= n
            let (va, vb) = unsafe { (vld1q_f32(a.as_ptr().add(i)), vld1q_f32(b.as_ptr().add(i))) };
            let d = vsubq_f32(va, vb);
            acc = vfmaq_f32(acc, d, d);
        }
        let mut sum = vaddvq_f32(acc);
        for i in tail..n {
            let d = a[i] - b[i];
            sum += d * d;
        }
        sum
    }

    #[target_feature(enable = "neon")]
    pub(super) unsafe fn dot(a: &[f32], b: &[f32]) -> f32 {
        let n = a.len().min(b.len());
        let tail = n - n % 4;
        let mut acc = vdupq_n_f32(0.0);
        for i in (0..tail).step_by(4) {
            let (va, vb) = unsafe { (vld1q_f32(a.as_ptr().add(i)), vld1q_f32(b.as_ptr().add(i))) };
            acc = vfmaq_f32(acc, va, vb);
        }
        let mut sum = vaddvq_f32(acc);
        for i in tail..n {
            sum += a[i] * b[i];
        }
        sum
    }

    #[target_feature(enable = "neon")]
    pub(super) unsafe fn dots(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
        let n = a.len().min(b.len());
        let tail = n - n % 4;
        let (mut ab, mut aa, mut bb) = (vdupq_n_f32(0.0), vdupq_n_f32(0.0), vdupq_n_f32(0.0));
        for i in (0..tail).step_by(4) {
            let (va, vb) = unsafe { (vld1q_f32(a.as_ptr().add(i)), vld1q_f32(b.as_ptr().add(i))) };
            ab = vfmaq_f32(ab, va, vb);
            aa = vfmaq_f32(aa, va, va);
            bb = vfmaq_f32(bb, vb, vb);
        }
        let (mut ab, mut aa, mut bb) = (vaddvq_f32(ab), vaddvq_f32(aa), vaddvq_f32(bb));
        for i in tail..n {
            ab += a[i] * b[i];
            aa += a[i] * a[i];
            bb += b[i] * b[i];
        }
        (ab, aa, bb)
    }
}

/// Names the code path distances for `kind` under `metric` run on.
///
/// f32 and the widened half types report the SIMD path of L2sq, Cos and IP.
/// Packed bits report `"popcnt"` when the hardware count is used. Every other
/// combination, custom metrics included, runs the portable kernels and
/// reports `"serial"`.
pub fn hardware_acceleration(kind: ScalarKind, metric: MetricKind) -> &'static str {
    match (kind, metric) {
        (
            ScalarKind::F32 | ScalarKind::F16 | ScalarKind::BF16,
            MetricKind::L2sq | MetricKind::Cos | MetricKind::IP,
        ) => simd_capability().name(),
        (
            ScalarKind::B1,
            MetricKind::Hamming | MetricKind::Jaccard | MetricKind::Tanimoto | MetricKind::Sorensen,
        ) if popcnt_available() => "popcnt",
        _ => "serial",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::{bf16, f16};
    use rand::Rng;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_float_kernels() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        assert!(approx(l2sq(&a, &b), 2.0));
        assert!(approx(cosine(&a, &b), 1.0));
        assert!(approx(cosine(&a, &a), 0.0));
        assert!(approx(inner_product(&a, &b), 1.0));
        assert!(approx(inner_product(&a, &a), 0.0));
        assert!(approx(tanimoto(&a, &b), 1.0));
        assert!(approx(sorensen(&a, &a), 0.0));

        // 零向量
        let zero = [0.0f32, 0.0];
        assert!(approx(cosine(&zero, &zero), 0.0));
        assert!(approx(cosine(&zero, &a), 1.0));
    }

    #[test]
    fn test_inner_product_range() {
        let mut rng = rand::rng();
        let unit = |rng: &mut rand::rngs::ThreadRng| {
            let v: Vec<f32> = (0..16).map(|_| rng.random::<f32>() - 0.5).collect();
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            v.into_iter().map(|x| x / norm).collect::<Vec<f32>>()
        };
        for _ in 0..100 {
            let (a, b) = (unit(&mut rng), unit(&mut rng));
            let d = inner_product_f32(&a, &b);
            assert!((-1e-5..=2.0 + 1e-5).contains(&d));
            assert!((d - cosine(&a, &b)).abs() < 1e-4);
            assert!(inner_product_f32(&a, &a).abs() < 1e-5);
        }

        // 未归一化的输入不做缩放
        assert!(approx(inner_product(&[2.0f32, 0.0], &[2.0, 0.0]), -3.0));
    }

    #[test]
    fn test_pearson() {
        let a = [1.0f64, 2.0, 3.0, 4.0];
        let b = [2.0f64, 4.0, 6.0, 8.0];
        let c = [4.0f64, 3.0, 2.0, 1.0];
        assert!(approx(pearson(&a, &b), 0.0));
        assert!(approx(pearson(&a, &c), 2.0));
    }

    #[test]
    fn test_haversine() {
        let half_pi = std::f32::consts::FRAC_PI_2;
        // 北极到赤道
        let pole = [half_pi, 0.0];
        let equator = [0.0f32, 0.0];
        assert!(approx(haversine(&pole, &equator), half_pi));
        assert!(approx(haversine(&equator, &[0.0, std::f32::consts::PI]), 2.0 * half_pi));
    }

    #[test]
    fn test_divergence() {
        let p = [0.5f32, 0.5];
        let q = [1.0f32, 0.0];
        assert!(approx(divergence(&p, &p), 0.0));
        let d = divergence(&p, &q);
        assert!(d > 0.0 && d < std::f32::consts::LN_2);
        assert!(approx(divergence(&p, &q), divergence(&q, &p)));
    }

    #[test]
    fn test_int8_kernels() {
        let a = [127i8, 0];
        let b = [0i8, 127];
        assert!(approx(l2sq_i8(&a, &b), 2.0));
        assert!(approx(cosine_i8(&a, &b), 1.0));
        assert!(approx(cosine_i8(&a, &a), 0.0));
        assert!(approx(inner_product_i8(&a, &a), 0.0));
    }

    #[test]
    fn test_bit_kernels() {
        let a = [B1x8(0b1111_0000)];
        let b = [B1x8(0b1100_1100)];
        assert_eq!(hamming_b1(&a, &b), 4.0);
        assert!(approx(jaccard_b1(&a, &b), 1.0 - 2.0 / 6.0));
        assert!(approx(sorensen_b1(&a, &b), 1.0 - 4.0 / 8.0));
        let empty = [B1x8(0)];
        assert_eq!(jaccard_b1(&empty, &empty), 0.0);
        assert_eq!(sorensen_b1(&empty, &empty), 0.0);
    }

    #[test]
    fn test_widened_vs_native() {
        let mut rng = rand::rng();
        let dims = 64;
        let v1: Vec<f32> = (0..dims).map(|_| rng.random::<f32>()).collect();
        let v2: Vec<f32> = (0..dims).map(|_| rng.random::<f32>()).collect();
        let h1: Vec<f16> = v1.iter().map(|&x| f16::from_f32(x)).collect();
        let h2: Vec<f16> = v2.iter().map(|&x| f16::from_f32(x)).collect();
        let b1: Vec<bf16> = v1.iter().map(|&x| bf16::from_f32(x)).collect();
        let b2: Vec<bf16> = v2.iter().map(|&x| bf16::from_f32(x)).collect();

        assert!((widened_l2sq(&h1, &h2) - l2sq(&v1, &v2)).abs() < 0.1);
        assert!((widened_cosine(&h1, &h2) - cosine(&v1, &v2)).abs() < 0.01);
        assert!((widened_cosine(&b1, &b2) - cosine(&v1, &v2)).abs() < 0.05);
    }

    #[test]
    fn test_simd_vs_scalar() {
        let mut rng = rand::rng();

        fn l2sq_scalar(a: &[f32], b: &[f32]) -> f32 {
            a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f32>()
        }

        fn cosine_scalar(a: &[f32], b: &[f32]) -> f32 {
            let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
            let norm_a: f32 = a.iter().map(|x| x.powi(2)).sum::<f32>().sqrt();
            let norm_b: f32 = b.iter().map(|x| x.powi(2)).sum::<f32>().sqrt();
            1.0 - (dot_product / (norm_a * norm_b))
        }

        let dims = 128;
        let v1: Vec<f32> = (0..dims).map(|_| rng.random::<f32>() + 0.01).collect();
        let v2: Vec<f32> = (0..dims).map(|_| rng.random::<f32>() + 0.01).collect();

        assert!((l2sq(&v1, &v2) - l2sq_scalar(&v1, &v2)).abs() < 1e-3);
        assert!((cosine(&v1, &v2) - cosine_scalar(&v1, &v2)).abs() < 1e-4);
        // 对称性
        assert_eq!(l2sq(&v1, &v2), l2sq(&v2, &v1));
        assert_eq!(cosine(&v1, &v2), cosine(&v2, &v1));
    }

    #[test]
    fn test_metric() {
        assert!(matches!(
            Metric::builtin(MetricKind::Custom),
            Err(IndexError::InvalidOptions { .. })
        ));

        let metric = Metric::builtin(MetricKind::L2sq).unwrap();
        assert_eq!(metric.compute(&[1.0f32, 2.0], &[1.0, 4.0]).unwrap(), 4.0);
        assert!(matches!(
            metric.compute(&[1.0f32, 2.0], &[1.0]),
            Err(IndexError::DimensionMismatch {
                expected: 2,
                got: 1
            })
        ));
        assert!(metric.compute(&[B1x8(1)], &[B1x8(0)]).is_err());

        let manhattan = Metric::custom(|a, b| a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum());
        assert_eq!(manhattan.kind(), MetricKind::Custom);
        assert!(approx(manhattan.compute(&[1.0f32, 0.0], &[0.0, 1.0]).unwrap(), 2.0));
        assert!(approx(manhattan.compute(&[127i8, 0], &[0, 0]).unwrap(), 1.0));
        assert_eq!(manhattan.compute(&[B1x8(0b1000_0001)], &[B1x8(0)]).unwrap(), 2.0);
    }

    #[test]
    fn test_dispatched_kernels() {
        let mut rng = rand::rng();
        // 37 维覆盖 SIMD 主循环与尾部
        for dims in [1, 7, 8, 37, 128] {
            let a: Vec<f32> = (0..dims).map(|_| rng.random::<f32>() - 0.5).collect();
            let b: Vec<f32> = (0..dims).map(|_| rng.random::<f32>() - 0.5).collect();
            assert!((l2sq_f32(&a, &b) - l2sq(&a, &b)).abs() < 1e-4);
            assert!((cosine_f32(&a, &b) - cosine(&a, &b)).abs() < 1e-4);
            assert!((inner_product_f32(&a, &b) - inner_product(&a, &b)).abs() < 1e-4);
            assert_eq!(l2sq_f32(&a, &a), 0.0);
        }
        assert_eq!(cosine_f32(&[0.0; 9], &[0.0; 9]), 0.0);
        assert_eq!(cosine_f32(&[0.0; 9], &[1.0; 9]), 1.0);

        let a: Vec<B1x8> = (0..37).map(|_| B1x8(rng.random())).collect();
        let b: Vec<B1x8> = (0..37).map(|_| B1x8(rng.random())).collect();
        let mut serial = BitCounts::default();
        for (x, y) in a.iter().zip(&b) {
            serial.add(x.0 as u64, y.0 as u64);
        }
        assert_eq!(bit_counts(&a, &b), serial);
        assert_eq!(count_bits(&a, &b), serial);
    }

    #[test]
    fn test_hardware_acceleration() {
        assert_eq!(simd_capability(), SimdCapability::detect());

        // The reported name follows the capability the f32 kernels dispatch on.
        let simd = simd_capability().name();
        for kind in [ScalarKind::F32, ScalarKind::F16, ScalarKind::BF16] {
            for metric in [MetricKind::L2sq, MetricKind::Cos, MetricKind::IP] {
                assert_eq!(hardware_acceleration(kind, metric), simd);
            }
            assert_eq!(hardware_acceleration(kind, MetricKind::Pearson), "serial");
            assert_eq!(hardware_acceleration(kind, MetricKind::Custom), "serial");
        }
        #[cfg(target_arch = "x86_64")]
        assert_eq!(
            simd == "haswell",
            is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma")
        );
        #[cfg(target_arch = "aarch64")]
        assert_eq!(simd, "neon");

        // 没有加速路径的组合报告 serial
        assert_eq!(hardware_acceleration(ScalarKind::F64, MetricKind::L2sq), "serial");
        assert_eq!(hardware_acceleration(ScalarKind::I8, MetricKind::Cos), "serial");
        assert_eq!(hardware_acceleration(ScalarKind::B1, MetricKind::Custom), "serial");
        let bits = if popcnt_available() { "popcnt" } else { "serial" };
        assert_eq!(hardware_acceleration(ScalarKind::B1, MetricKind::Hamming), bits);
    }

    #[test]
    fn test_metric_codes() {
        for code in 1..=10 {
            let kind = MetricKind::try_from(code).unwrap();
            assert_eq!(kind.code(), Some(code));
        }
        assert!(MetricKind::try_from(0).is_err());
        assert_eq!(MetricKind::Custom.code(), None);
    }
}
