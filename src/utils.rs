use std::{io::Write, path::Path, time::Duration};

use log::debug;
use rand::Rng;
use serde::Serialize;

use crate::error::{Error, Result};

/// Upper bound (exclusive) for generated seeds.
pub const SEED_LIMIT: u64 = 2_000_000_000;

/// Directory-friendly run id.
/// With a positive index it sorts in execution order: `0007_3fa2c1`.
pub fn generate_run_id(index: usize) -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    if index > 0 {
        format!("{:04}_{}", index, &hex[..6])
    } else {
        hex[..8].to_owned()
    }
}

pub fn generate_seed() -> u64 {
    rand::thread_rng().gen_range(0..SEED_LIMIT)
}

/// Replaces path separators and other characters Windows or ComfyUI dislike with `_`,
/// collapses runs of `_`, and caps the result at `max_len` characters.
pub fn safe_filename(text: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        let c = match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(|c: char| c == '_' || c == ' ').chars().take(max_len).collect()
}

/// `45s`, `1m 5s`, `1h 1m 5s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Linear extrapolation from the average time per completed item.
pub fn estimate_remaining(completed: usize, total: usize, elapsed: Duration) -> Option<Duration> {
    if completed == 0 {
        return None;
    }
    let per_item = elapsed.as_secs_f64() / completed as f64;
    Some(Duration::from_secs_f64(per_item * total.saturating_sub(completed) as f64))
}

/// Float formatting for file names: `0.320` -> `0.32`, `8.0` -> `8`.
pub fn fmt_float(x: f64, digits: usize) -> String {
    let s = format!("{:.*}", digits, x);
    let s = if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s.as_str()
    };
    match s {
        "" | "-0" => "0".to_owned(),
        s => s.to_owned(),
    }
}

/// Pretty-prints `value` to `path`, creating parent directories.
/// The file is replaced atomically, so an interrupted run never leaves half a document behind.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::io(format!("failed to create {}", dir.display()), e))?;
    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| {
            Error::io(format!("failed to create temporary file in {}", dir.display()), e)
        })?;
    tmp.write_all(text.as_bytes())
        .map_err(|e| Error::io("failed to write temporary file", e))?;
    tmp.persist(path)
        .map_err(|e| Error::io(format!("failed to write {}", path.display()), e.error))?;
    debug!("Wrote {}", path.display());
    Ok(())
}
