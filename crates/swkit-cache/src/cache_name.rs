//! Cache name generation.
//!
//! A worker version owns exactly one cache named `{prefix}{id}` where `id` is
//! the current time in milliseconds followed by two random blocks, all in
//! base 36. Ids are not guaranteed unique, collisions are only unlikely.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

const BASE: u64 = 36;
const BLOCK_SIZE: usize = 4;
const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Build a fresh cache name for `prefix`.
pub fn cache_name(prefix: &str) -> String {
    format!("{}{}", prefix, generate_cache_id())
}

/// Generate a new cache id.
pub fn generate_cache_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut rng = rand::thread_rng();
    format!(
        "{}{}{}",
        to_base36(timestamp),
        random_block(&mut rng),
        random_block(&mut rng)
    )
}

fn random_block(rng: &mut impl Rng) -> String {
    let discrete_values = BASE.pow(BLOCK_SIZE as u32);
    let encoded = to_base36(rng.gen_range(0..discrete_values));
    format!("{:0>width$}", encoded, width = BLOCK_SIZE)
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % BASE) as usize]);
        value /= BASE;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_679_615), "zzzz");
    }

    #[test]
    fn test_random_block_is_padded() {
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let block = random_block(&mut rng);
            assert_eq!(block.len(), BLOCK_SIZE);
            assert!(block.bytes().all(|b| DIGITS.contains(&b)));
        }
    }

    #[test]
    fn test_cache_name_shape() {
        let name = cache_name("jsenv");
        assert!(name.starts_with("jsenv"));
        // 8+ timestamp digits followed by two blocks of 4.
        assert!(name.len() >= "jsenv".len() + 8 + 2 * BLOCK_SIZE);
        assert_ne!(cache_name("jsenv"), name);
    }
}
