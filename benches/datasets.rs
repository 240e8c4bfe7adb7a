use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::Path;
use tsmigrate::{BlockWriter, Labels, Sample};

pub const DEFAULT_SEED: u64 = 0x_5453_4D49_4752_4154; // fixed seed for stable benchmarks

/// One generated series: labels plus its chunks.
#[derive(Clone, Debug)]
pub struct SeriesSpec {
    pub labels: Labels,
    pub chunks: Vec<Vec<Sample>>,
}

/// Deterministic series with a scrape-like 15s step. Roughly `nan_ratio` of the values are NaN
/// (stale markers), the rest a random walk.
pub fn generate_series(
    seed: u64,
    series_count: usize,
    chunks_per_series: usize,
    samples_per_chunk: usize,
    jobs: u32,
    nan_ratio: f64,
) -> Vec<SeriesSpec> {
    assert!(jobs > 0);

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut out = Vec::with_capacity(series_count);

    for s in 0..series_count {
        let job = format!("job_{}", rng.random_range(0..jobs));
        let instance = format!("instance_{}", s);
        let labels = Labels::from_pairs(&[("instance", instance.as_str()), ("job", job.as_str())]);

        let mut ts: i64 = 1_600_000_000_000;
        let mut val: f64 = rng.random_range(0.0..100.0);
        let mut chunks = Vec::with_capacity(chunks_per_series);
        for _ in 0..chunks_per_series {
            let mut chunk = Vec::with_capacity(samples_per_chunk);
            for _ in 0..samples_per_chunk {
                ts += 15_000;
                val += rng.random_range(-1.0..1.0);
                let v = if rng.random::<f64>() < nan_ratio {
                    f64::NAN
                } else {
                    val
                };
                chunk.push(Sample::new(ts, v));
            }
            chunks.push(chunk);
        }
        out.push(SeriesSpec { labels, chunks });
    }

    out
}

pub fn write_block(dir: &Path, series: &[SeriesSpec]) {
    let mut w = BlockWriter::create(dir).expect("block writer");
    for item in series {
        w.add_series(item.labels.clone(), &item.chunks)
            .expect("add series");
    }
    w.finish().expect("finish block");
}
