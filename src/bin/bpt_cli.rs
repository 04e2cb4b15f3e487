//! Interactive driver reading index commands from standard input.
//!
//! Input format: a count `n` on the first line, then `n` commands:
//!
//! ```text
//! insert <key> <value>
//! delete <key> <value>
//! find <key>
//! ```
//!
//! Keys are strings shortened to a 64-bit hash; the value doubles as
//! the disambiguating tag of the composite key, so one key can carry
//! many values. `find` prints the values stored for a key separated by
//! spaces, or `null`, one line per query.

use std::io::{self, BufRead, BufWriter, Write};
use std::process::exit;

use bptree_index::{open, CompositeKey, CompositeKeyComparator, Config, Result};

/// Shorten a user key to a 64-bit prefix with two seeded CRC32 passes.
fn hash_key(key: &str) -> u64 {
    let lo = crc32fast::hash(key.as_bytes());
    let mut hasher = crc32fast::Hasher::new_with_initial(0x9e37_79b9);
    hasher.update(key.as_bytes());
    let hi = hasher.finalize();
    ((hi as u64) << 32) | lo as u64
}

fn run() -> Result<()> {
    let config = Config::new(".").name("bpt").fan_out(200, 30);
    let tree = open::<CompositeKey, i32, CompositeKeyComparator>(config)?;

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    let n: usize = match lines.next() {
        Some(line) => line?.trim().parse().unwrap_or(0),
        None => 0,
    };

    for _ in 0..n {
        let Some(line) = lines.next() else { break };
        let line = line?;
        let mut parts = line.split_whitespace();
        let (Some(op), Some(key)) = (parts.next(), parts.next()) else {
            continue;
        };
        match op {
            "insert" => {
                let Some(value) = parts.next().and_then(|v| v.parse::<i32>().ok()) else {
                    continue;
                };
                tree.insert(&CompositeKey::new(hash_key(key), value), &0)?;
            }
            "delete" => {
                let Some(value) = parts.next().and_then(|v| v.parse::<i32>().ok()) else {
                    continue;
                };
                tree.remove(&CompositeKey::new(hash_key(key), value))?;
            }
            "find" => {
                let hits = tree.find(&CompositeKey::new(hash_key(key), 0))?;
                if hits.is_empty() {
                    writeln!(out, "null")?;
                } else {
                    let values: Vec<String> = hits.iter().map(|k| k.tag.to_string()).collect();
                    writeln!(out, "{}", values.join(" "))?;
                }
            }
            _ => {}
        }
    }

    out.flush()?;
    tree.close()
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        eprintln!("ERROR: {e}");
        exit(1);
    }
}
