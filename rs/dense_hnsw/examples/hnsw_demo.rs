use dense_hnsw::{Index, IndexOptions, MetricKind, ScalarKind};
use rand::Rng;
use tokio::time;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    structured_logger::Builder::new().init();

    const DIM: usize = 384;

    // 创建索引 (384维向量，如BERT嵌入)，以 f16 存储
    let index = Index::new(IndexOptions {
        dimensions: DIM,
        metric: MetricKind::Cos,
        quantization: ScalarKind::F16,
        ..Default::default()
    })?;
    index.reserve(10_000)?;
    println!("Hardware acceleration: {}", index.hardware_acceleration()?);

    // 模拟数据流
    let mut rng = rand::rng();

    let mut insert_start = time::Instant::now();
    for i in 0..20_000u64 {
        let vector: Vec<f32> = (0..DIM).map(|_| rng.random::<f32>()).collect();
        index.add(i, &vector)?;

        // 模拟搜索查询
        if i % 1000 == 0 {
            println!("{} inserted 1000 vectors in {:?}", i, insert_start.elapsed());
            insert_start = time::Instant::now();

            let query: Vec<f32> = (0..DIM).map(|_| rng.random::<f32>()).collect();
            let query_start = time::Instant::now();
            let results = index.search(&query, 10)?;
            println!(
                "{} Search returned {} results in {:?}",
                i,
                results.len(),
                query_start.elapsed()
            );
        }

        // 模拟删除
        if i % 5000 == 0 && i > 0 {
            let to_remove = rng.random_range(0..i);
            let remove_start = time::Instant::now();
            match index.remove(to_remove) {
                Ok(_) => println!(
                    "{} Removed vector {} in {:?}",
                    i,
                    to_remove,
                    remove_start.elapsed()
                ),
                Err(err) => println!("{i} Skipped removal: {err}"),
            }
        }
    }

    // 打印统计信息
    let stats = index.stats()?;
    println!("Index statistics:");
    println!("- Keys: {}", stats.num_keys);
    println!("- Vectors: {}", stats.num_vectors);
    println!("- Capacity: {}", stats.capacity);
    println!("- Max level: {}", stats.max_level);
    println!("- Memory usage: {} bytes", stats.memory_usage);
    println!("- Search operations: {}", stats.search_count);
    println!("- Insert operations: {}", stats.insert_count);
    println!("- Delete operations: {}", stats.delete_count);

    // 最终保存
    let path = std::env::temp_dir().join("hnsw_demo.cbor");
    let save_start = time::Instant::now();
    index.save_file(&path)?;
    println!(
        "Saved {} bytes in {:?}",
        index.serialized_length()?,
        save_start.elapsed()
    );

    let load_start = time::Instant::now();
    let index = Index::load_file(&path)?;
    println!("Load index in {:?}", load_start.elapsed());
    let query: Vec<f32> = (0..DIM).map(|_| rng.random::<f32>()).collect();
    let query_start = time::Instant::now();
    let results = index.search(&query, 10)?;
    println!(
        "Search returned {} results in {:?}",
        results.len(),
        query_start.elapsed()
    );

    index.release()?;
    std::fs::remove_file(&path)?;
    Ok(())
}
