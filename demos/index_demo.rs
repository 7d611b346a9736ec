use std::time::Instant;

use xor_index::{IndexConfig, XorIndex};

fn main() {
    let key_count = 1_000_000_usize;
    let keys: Vec<u64> = (0..key_count as u64).map(|i| i.wrapping_mul(13_791)).collect();

    let config = IndexConfig {
        seed: Some(0xD6E8_FEB8_6659_FD93),
        ..IndexConfig::default()
    };

    let build_start = Instant::now();
    let built = XorIndex::build_32_with_config(&keys, &config).expect("index should build");
    let build_time = build_start.elapsed();
    let index = built.index;

    let mut payloads = vec![0u64; index.len()];
    for &key in &keys {
        let slot = index.index_of(key).expect("member key must resolve to a slot");
        payloads[slot] = key;
    }
    let verified = keys
        .iter()
        .filter(|&&key| payloads[index.index_of(key).expect("member key must resolve")] == key)
        .count();

    let probe_count = 1_000_000_u64;
    let mut generator = SplitMix64::new(0xBADC_0FFE);
    let mut positives = 0_u64;
    for _ in 0..probe_count {
        if index.contains(generator.next()) {
            positives += 1;
        }
    }

    println!(
        "built index for {key_count} keys in {build_time:?} ({} attempts)",
        built.attempts
    );
    println!(
        "slots: {} ({:.3}x overhead, {:.2} bytes per key)",
        index.len(),
        built.actual_overhead,
        index.byte_size() as f64 / key_count as f64
    );
    println!("round-trip payloads verified: {verified}/{key_count}");
    println!("random probes flagged positive: {positives}/{probe_count}");
}

struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next(&mut self) -> u64 {
        let mut z = self.state.wrapping_add(0x9E3779B97F4A7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}
