use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;

use scd2_rs::RawRecord;

const PLATFORMS: [&str; 2] = ["chess.com", "lichess"];

/// A raw player snapshot record with every tracked field present.
pub fn player_record(username: &str, platform: &str, date: &str, blitz: i64) -> RawRecord {
    RawRecord::new()
        .with("username", username)
        .with("platform", platform)
        .with("data_date", date)
        .with("rating_blitz", blitz)
        .with("rating_rapid", blitz + 100)
        .with("rating_bullet", blitz - 100)
        .with("rating_classical", Value::Null)
        .with("games_played", 100)
        .with("wins", 50)
        .with("losses", 40)
        .with("draws", 10)
}

/// A snapshot of `count` distinct players.
pub fn generate_snapshot(count: usize, date: &str, seed: u64) -> Vec<RawRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let platform = PLATFORMS[i % PLATFORMS.len()];
            let blitz = rng.random_range(800..2800);
            player_record(&format!("player{}", i), platform, date, blitz)
        })
        .collect()
}

/// The next snapshot of the same players, with a share of them re-rated.
pub fn evolve_snapshot(
    previous: &[RawRecord],
    date: &str,
    change_probability: f64,
    seed: u64,
) -> Vec<RawRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    previous
        .iter()
        .map(|raw| {
            let mut next = raw.clone().with("data_date", date);
            if rng.random_bool(change_probability) {
                let blitz = raw
                    .get("rating_blitz")
                    .and_then(Value::as_i64)
                    .unwrap_or(1500);
                next = next.with("rating_blitz", blitz + rng.random_range(1..50));
            }
            next
        })
        .collect()
}
