//! Resource derivation engine.
//!
//! Derives a consistent `(memory, processes)` pair from the resource
//! fields of a cluster configuration and keeps any resource-spec string in
//! sync. The knobs are:
//!
//! - `memory`: required upper bound for the whole job (size string)
//! - `worker_memory`: desired per-worker memory (size string, consumed)
//! - `processes`: worker process count
//!
//! With `memory` and `worker_memory` the process count is derived and the
//! total rounded down to an exact multiple; with all three the total is
//! recomputed from the given count. Either way the result must stay under
//! the declared `memory` ceiling.

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ProfileError, Result};

/// Cluster-config key carrying the batch scheduler resource string
pub const RESOURCE_SPEC_KEY: &str = "resource_spec";

/// Separator candidates, in detection preference order: (item, key/value)
const SPEC_SEPARATORS: [(char, char); 2] = [(':', '='), (',', '=')];

/// Parse a human-readable byte size: plain integers, scientific notation,
/// and decimal (`kB`, `MB`, ...) or binary (`KiB`, `MiB`, ...) suffixes,
/// case-insensitive, with an optional space before the suffix.
pub fn parse_bytes(text: &str) -> Result<u64> {
    let trimmed = text.trim();
    let invalid = || ProfileError::InvalidMemory(text.to_string());

    // bare number, including "1.5e9"
    if let Ok(value) = trimmed.parse::<f64>() {
        if !value.is_finite() || value < 0.0 {
            return Err(invalid());
        }
        return Ok(value.round() as u64);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(invalid)?;
    let (number, suffix) = trimmed.split_at(split);

    let number = number.parse::<f64>().map_err(|_| invalid())?;
    let multiplier = suffix_multiplier(suffix.trim()).ok_or_else(invalid)?;

    if !number.is_finite() || number < 0.0 {
        return Err(invalid());
    }
    Ok((number * multiplier as f64).round() as u64)
}

fn suffix_multiplier(suffix: &str) -> Option<u64> {
    let multiplier = match suffix.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1_000,
        "m" | "mb" => 1_000_000,
        "g" | "gb" => 1_000_000_000,
        "t" | "tb" => 1_000_000_000_000,
        "p" | "pb" => 1_000_000_000_000_000,
        "ki" | "kib" => 1 << 10,
        "mi" | "mib" => 1 << 20,
        "gi" | "gib" => 1 << 30,
        "ti" | "tib" => 1 << 40,
        "pi" | "pib" => 1 << 50,
        _ => return None,
    };
    Some(multiplier)
}

/// Format a byte count with binary prefixes, exact multiples without
/// decimals (`"8GiB"`), anything else with two (`"1.50GiB"`).
pub fn format_bytes(n: u64) -> String {
    const UNITS: [(&str, u64); 5] = [
        ("PiB", 1 << 50),
        ("TiB", 1 << 40),
        ("GiB", 1 << 30),
        ("MiB", 1 << 20),
        ("KiB", 1 << 10),
    ];

    for (suffix, k) in UNITS {
        if n >= k {
            if n % k == 0 {
                return format!("{}{}", n / k, suffix);
            }
            return format!("{:.2}{}", n as f64 / k as f64, suffix);
        }
    }
    format!("{n}B")
}

/// Compact size formatting for resource-spec strings (`mem=110GB`).
///
/// Below 1024 the plain byte count is kept; above, the largest prefix whose
/// 0.9 multiple is reached wins, rounded to the nearest integer.
pub fn format_resource_size(n: u64) -> String {
    const PREFIXES: [(&str, u64); 5] = [
        ("P", 1 << 50),
        ("T", 1 << 40),
        ("G", 1 << 30),
        ("M", 1 << 20),
        ("k", 1 << 10),
    ];

    if n < 1024 {
        return format!("{n}B");
    }

    for (prefix, k) in PREFIXES {
        if n as f64 >= k as f64 * 0.9 {
            let quantity = (n as f64 / k as f64).round() as u64;
            return format!("{quantity}{prefix}B");
        }
    }
    format!("{n}B")
}

/// Split a resource-spec string into ordered key/value pairs, auto-detecting
/// the separator pair. Returns the pairs and the detected item separator.
pub fn split_spec(spec: &str) -> Result<(Vec<(String, String)>, char)> {
    for (item_sep, kv_sep) in SPEC_SEPARATORS {
        let mut settings = Vec::new();
        let mut clean = true;

        for item in spec.split(item_sep) {
            let parts = item.split(kv_sep).collect::<Vec<_>>();
            if parts.len() != 2 {
                clean = false;
                break;
            }
            settings.push((parts[0].to_string(), parts[1].to_string()));
        }

        if clean {
            return Ok((settings, item_sep));
        }
    }

    Err(ProfileError::MalformedResourceSpec(spec.to_string()))
}

/// Reassemble key/value pairs with the given item separator
pub fn join_spec(settings: &[(String, String)], item_sep: char) -> String {
    settings
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(&item_sep.to_string())
}

/// Rewrite entries of a resource-spec string.
///
/// Only keys already present in the spec are touched; everything else,
/// including the entry order and the separator style, is preserved.
pub fn update_resource_spec(spec: &str, new_values: &[(&str, String)]) -> Result<String> {
    let (mut settings, item_sep) = split_spec(spec)?;

    for (key, value) in new_values {
        if let Some(entry) = settings.iter_mut().find(|(name, _)| name == key) {
            entry.1 = value.clone();
        }
    }

    Ok(join_spec(&settings, item_sep))
}

fn required_memory(cluster: &Map<String, Value>) -> Result<Option<u64>> {
    match cluster.get("memory") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => parse_bytes(text).map(Some),
        Some(other) => Err(ProfileError::InvalidMemory(other.to_string())),
    }
}

fn given_processes(cluster: &Map<String, Value>) -> Result<Option<u64>> {
    match cluster.get("processes") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| ProfileError::InvalidResource(format!("invalid 'processes': {value}"))),
    }
}

/// Derive consistent resource values for a cluster configuration.
///
/// Returns `None` when the configuration does not use derived resources
/// (no `memory`, or no `worker_memory`); otherwise a rewritten copy with
/// `worker_memory` consumed and `memory`/`processes` made consistent.
pub fn derive_resources(cluster: &Map<String, Value>) -> Result<Option<Map<String, Value>>> {
    let Some(memory) = required_memory(cluster)? else {
        return Ok(None);
    };

    let worker_memory = match cluster.get("worker_memory") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(text)) => parse_bytes(text)?,
        Some(other) => return Err(ProfileError::InvalidMemory(other.to_string())),
    };
    if worker_memory == 0 {
        return Err(ProfileError::InvalidResource(
            "'worker_memory' must be non-zero".to_string(),
        ));
    }

    let processes = match given_processes(cluster)? {
        None => {
            let derived = memory / worker_memory;
            if derived == 0 {
                return Err(ProfileError::InvalidResource(format!(
                    "per-worker memory ({}) must be smaller or equal to the total memory ({})",
                    format_bytes(worker_memory),
                    format_bytes(memory),
                )));
            }
            derived
        }
        Some(given) => {
            if given == 0 {
                return Err(ProfileError::InvalidResource(
                    "'processes' must be at least 1".to_string(),
                ));
            }
            given
        }
    };

    // checked: a wrapped product could sneak under the ceiling
    let new_memory = processes.checked_mul(worker_memory).ok_or_else(|| {
        ProfileError::InvalidResource(format!(
            "the requested combination of 'worker_memory' ({}) and 'processes' ({}) \
             overflows the total memory",
            format_bytes(worker_memory),
            processes,
        ))
    })?;
    if new_memory > memory {
        return Err(ProfileError::InvalidResource(format!(
            "the requested combination of 'worker_memory' ({}) and 'processes' ({}) \
             exceeds the total memory: {} > {}",
            format_bytes(worker_memory),
            processes,
            format_bytes(new_memory),
            format_bytes(memory),
        )));
    }

    debug!(
        "derived resources: {} workers, {} total",
        processes,
        format_bytes(new_memory)
    );

    let mut derived = cluster.clone();
    derived.remove("worker_memory");
    derived.insert("memory".to_string(), Value::String(format_bytes(new_memory)));
    derived.insert("processes".to_string(), Value::from(processes));

    let rewritten_spec = match derived.get(RESOURCE_SPEC_KEY) {
        Some(Value::String(spec)) => {
            Some(update_resource_spec(spec, &[("mem", format_resource_size(new_memory))])?)
        }
        _ => None,
    };
    if let Some(spec) = rewritten_spec {
        derived.insert(RESOURCE_SPEC_KEY.to_string(), Value::String(spec));
    }

    Ok(Some(derived))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cluster(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn parse_bytes_understands_common_forms() {
        assert_eq!(parse_bytes("100").unwrap(), 100);
        assert_eq!(parse_bytes("1.5e9").unwrap(), 1_500_000_000);
        assert_eq!(parse_bytes("5 kB").unwrap(), 5_000);
        assert_eq!(parse_bytes("4GiB").unwrap(), 4 << 30);
        assert_eq!(parse_bytes("110GB").unwrap(), 110_000_000_000);
        assert_eq!(parse_bytes("2.5 MiB").unwrap(), (2.5 * 1048576.0) as u64);
    }

    #[test]
    fn parse_bytes_rejects_garbage() {
        assert!(parse_bytes("lots").is_err());
        assert!(parse_bytes("4XiB").is_err());
        assert!(parse_bytes("-1GiB").is_err());
    }

    #[test]
    fn parse_bytes_rejects_non_finite_numbers() {
        assert!(parse_bytes("inf").is_err());
        assert!(parse_bytes("-inf").is_err());
        assert!(parse_bytes("NaN").is_err());
        assert!(parse_bytes("1e400").is_err());
    }

    #[test]
    fn format_bytes_prefers_exact_binary_multiples() {
        assert_eq!(format_bytes(8 << 30), "8GiB");
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(3 << 40), "3TiB");
        assert_eq!(format_bytes((1 << 30) + (1 << 29)), "1.50GiB");
    }

    #[test]
    fn resource_size_thresholds() {
        assert_eq!(format_resource_size(1023), "1023B");
        assert_eq!(format_resource_size(1024), "1kB");
        assert_eq!(format_resource_size(1 << 30), "1GB");
        assert_eq!(format_resource_size((0.95 * 1048576.0) as u64), "1MB");
    }

    #[test]
    fn split_spec_detects_colon_separator() {
        let (settings, sep) = split_spec("select=1:ncpus=28:mem=110GB").unwrap();
        assert_eq!(sep, ':');
        assert_eq!(
            settings,
            vec![
                ("select".to_string(), "1".to_string()),
                ("ncpus".to_string(), "28".to_string()),
                ("mem".to_string(), "110GB".to_string()),
            ]
        );
    }

    #[test]
    fn split_spec_falls_back_to_comma() {
        let (settings, sep) = split_spec("mem=4GB,vmem=4GB").unwrap();
        assert_eq!(sep, ',');
        assert_eq!(settings.len(), 2);
    }

    #[test]
    fn split_spec_rejects_unparseable_strings() {
        let err = split_spec("this is not a spec").unwrap_err();
        assert!(matches!(err, ProfileError::MalformedResourceSpec(_)));
    }

    #[test]
    fn update_only_touches_present_keys() {
        let updated = update_resource_spec(
            "select=1:ncpus=28:mem=110GB",
            &[("mem", "98GB".to_string()), ("vmem", "98GB".to_string())],
        )
        .unwrap();

        assert_eq!(updated, "select=1:ncpus=28:mem=98GB");
    }

    #[test]
    fn mem_rewrite_is_idempotent() {
        let spec = "select=1:ncpus=4:mem=10GB";
        let once = update_resource_spec(spec, &[("mem", format_resource_size(8 << 30))]).unwrap();
        let twice = update_resource_spec(&once, &[("mem", format_resource_size(8 << 30))]).unwrap();

        assert_eq!(once, twice);
        assert_eq!(once, "select=1:ncpus=4:mem=8GB");
    }

    #[test]
    fn no_memory_means_no_derivation() {
        let input = cluster(json!({"type": "local", "processes": 4}));
        assert_eq!(derive_resources(&input).unwrap(), None);
    }

    #[test]
    fn no_worker_memory_means_no_derivation() {
        let input = cluster(json!({"type": "pbs", "memory": "10GiB", "processes": 4}));
        assert_eq!(derive_resources(&input).unwrap(), None);
    }

    #[test]
    fn processes_derived_from_worker_memory() {
        let input = cluster(json!({"type": "pbs", "memory": "10GiB", "worker_memory": "3GiB"}));
        let derived = derive_resources(&input).unwrap().unwrap();

        assert_eq!(derived["processes"], json!(3));
        assert_eq!(derived["memory"], json!("9GiB"));
        assert!(!derived.contains_key("worker_memory"));
    }

    #[test]
    fn oversized_worker_memory_fails() {
        let input = cluster(json!({"type": "pbs", "memory": "2GiB", "worker_memory": "4GiB"}));
        let err = derive_resources(&input).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidResource(_)));
    }

    #[test]
    fn given_processes_recompute_total() {
        let input = cluster(json!({
            "type": "pbs", "memory": "10GiB", "worker_memory": "2GiB", "processes": 4
        }));
        let derived = derive_resources(&input).unwrap().unwrap();

        assert_eq!(derived["processes"], json!(4));
        assert_eq!(derived["memory"], json!("8GiB"));
    }

    #[test]
    fn ceiling_violations_name_both_values() {
        let input = cluster(json!({
            "type": "pbs", "memory": "10GiB", "worker_memory": "3GiB", "processes": 4
        }));

        let err = derive_resources(&input).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("12GiB"), "got: {message}");
        assert!(message.contains("10GiB"), "got: {message}");
    }

    #[test]
    fn overflowing_process_counts_fail_instead_of_wrapping() {
        let input = cluster(json!({
            "type": "pbs",
            "memory": "8GiB",
            "worker_memory": "2GiB",
            "processes": u64::MAX / 2,
        }));

        let err = derive_resources(&input).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidResource(_)));
        assert!(err.to_string().contains("overflows"), "got: {err}");
    }

    #[test]
    fn derivation_rewrites_the_resource_spec() {
        let input = cluster(json!({
            "type": "pbs",
            "memory": "10GiB",
            "worker_memory": "2GiB",
            "resource_spec": "select=1:ncpus=4:mem=10GB",
        }));

        let derived = derive_resources(&input).unwrap().unwrap();
        assert_eq!(derived["resource_spec"], json!("select=1:ncpus=4:mem=10GB"));
        assert_eq!(derived["memory"], json!("10GiB"));
    }

    #[test]
    fn derivation_never_mutates_its_input() {
        let input = cluster(json!({"type": "pbs", "memory": "8GiB", "worker_memory": "2GiB"}));
        let before = input.clone();

        derive_resources(&input).unwrap();
        assert_eq!(input, before);
    }
}
