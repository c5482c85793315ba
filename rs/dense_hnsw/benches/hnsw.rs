use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dense_hnsw::{Index, IndexOptions, MetricKind, ScalarKind};
use rand::{Rng, SeedableRng, rngs::StdRng};

const DIM: usize = 128;
const SIZE: usize = 10_000;

struct TestCase {
    name: &'static str,
    metric: MetricKind,
    quantization: ScalarKind,
}

fn random_vectors(n: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..DIM).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect())
        .collect()
}

fn build(case: &TestCase, data: &[Vec<f32>]) -> Index {
    let index = Index::new(IndexOptions {
        dimensions: DIM,
        metric: case.metric,
        quantization: case.quantization,
        seed: Some(7),
        ..Default::default()
    })
    .unwrap();
    index.reserve(data.len()).unwrap();
    for (i, v) in data.iter().enumerate() {
        index.add(i as u64, v).unwrap();
    }
    index
}

// cargo bench --bench hnsw -- --save-baseline initial
// cargo bench --bench hnsw -- --baseline initial
pub fn criterion_benchmark(c: &mut Criterion) {
    let test_cases = vec![
        TestCase {
            name: "f32_l2sq",
            metric: MetricKind::L2sq,
            quantization: ScalarKind::F32,
        },
        TestCase {
            name: "f16_cos",
            metric: MetricKind::Cos,
            quantization: ScalarKind::F16,
        },
        TestCase {
            name: "i8_cos",
            metric: MetricKind::Cos,
            quantization: ScalarKind::I8,
        },
        TestCase {
            name: "b1_hamming",
            metric: MetricKind::Hamming,
            quantization: ScalarKind::B1,
        },
    ];

    let data = random_vectors(SIZE, 1);
    let queries = random_vectors(100, 2);

    let mut group = c.benchmark_group("add");
    group.sample_size(10);
    group.throughput(Throughput::Elements(1000));
    for case in &test_cases {
        group.bench_with_input(BenchmarkId::new("1000", case.name), case, |b, case| {
            b.iter(|| black_box(build(case, &data[..1000])))
        });
    }
    group.finish();

    let mut group = c.benchmark_group("search");
    group.sample_size(60);
    group.measurement_time(std::time::Duration::from_secs(6));
    group.throughput(Throughput::Elements(queries.len() as u64));
    for case in &test_cases {
        println!("Building {} index: {} vectors", case.name, SIZE);
        let index = build(case, &data);
        for count in [1, 10] {
            group.bench_with_input(
                BenchmarkId::new(format!("top{count}"), case.name),
                &count,
                |b, &count| {
                    b.iter(|| {
                        for q in &queries {
                            let results = index.search(black_box(q), count).unwrap();
                            black_box(assert_eq!(results.len(), count));
                        }
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
