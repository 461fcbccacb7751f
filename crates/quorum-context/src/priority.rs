// File Prioritization
// Orders bootstrap candidates so high-signal files index first. The sort is
// stable: equal keys keep their original order.

use std::path::{Path, PathBuf};

/// Script-like names that index first regardless of extension.
const SPECIAL_SCRIPT_NAMES: &[&str] = &[
    "Dockerfile",
    "Makefile",
    "Justfile",
    "Rakefile",
    "build.gradle",
    "CMakeLists.txt",
];

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "ts", "tsx", "js", "jsx", "go", "java", "kt", "kts", "c", "h", "cpp", "cc",
    "hpp", "rb", "swift", "sh",
];

const DOC_EXTENSIONS: &[&str] = &["md", "markdown", "rst", "txt", "adoc"];

const CONFIG_EXTENSIONS: &[&str] = &["toml", "json", "yaml", "yml", "ini", "cfg", "env"];

/// Bucket demotion applied to files over the size limit.
const OVERSIZE_PENALTY: u32 = 100;

const SIZE_BUCKET_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct PriorityConfig {
    /// Extensions (with leading dot) promoted to the top bucket.
    pub priority_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            priority_extensions: Vec::new(),
            max_file_size_bytes: 10 * 1024 * 1024,
        }
    }
}

/// One candidate file with its on-disk size.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub size_bytes: u64,
}

fn priority_bucket(path: &Path, config: &PriorityConfig) -> u32 {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if SPECIAL_SCRIPT_NAMES.contains(&name) {
        return 0;
    }
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return 4;
    };
    let dotted = format!(".{ext}");
    if config.priority_extensions.iter().any(|p| p == &dotted) {
        0
    } else if SOURCE_EXTENSIONS.contains(&ext) {
        1
    } else if DOC_EXTENSIONS.contains(&ext) {
        2
    } else if CONFIG_EXTENSIONS.contains(&ext) {
        3
    } else {
        4
    }
}

/// Stable sort by (priority bucket, size bucket, original index).
pub fn prioritize(candidates: Vec<Candidate>, config: &PriorityConfig) -> Vec<Candidate> {
    let mut keyed: Vec<(u32, u64, usize, Candidate)> = candidates
        .into_iter()
        .enumerate()
        .map(|(index, candidate)| {
            let mut bucket = priority_bucket(&candidate.path, config);
            if candidate.size_bytes > config.max_file_size_bytes {
                bucket += OVERSIZE_PENALTY;
            }
            let size_bucket = candidate.size_bytes / SIZE_BUCKET_BYTES;
            (bucket, size_bucket, index, candidate)
        })
        .collect();
    keyed.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));
    keyed.into_iter().map(|(_, _, _, c)| c).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(path: &str, size: u64) -> Candidate {
        Candidate {
            path: PathBuf::from(path),
            size_bytes: size,
        }
    }

    #[test]
    fn buckets_order_source_before_docs_before_config() {
        let sorted = prioritize(
            vec![
                candidate("settings.toml", 100),
                candidate("README.md", 100),
                candidate("main.rs", 100),
                candidate("data.bin", 100),
            ],
            &PriorityConfig::default(),
        );
        let names: Vec<&str> = sorted
            .iter()
            .map(|c| c.path.to_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["main.rs", "README.md", "settings.toml", "data.bin"]
        );
    }

    #[test]
    fn special_scripts_and_priority_extensions_come_first() {
        let config = PriorityConfig {
            priority_extensions: vec![".proto".to_string()],
            ..PriorityConfig::default()
        };
        let sorted = prioritize(
            vec![
                candidate("main.rs", 100),
                candidate("api.proto", 100),
                candidate("Dockerfile", 100),
            ],
            &config,
        );
        let names: Vec<&str> = sorted
            .iter()
            .map(|c| c.path.to_str().unwrap())
            .collect();
        // Both bucket 0; stable sort keeps original order among them.
        assert_eq!(names, vec!["api.proto", "Dockerfile", "main.rs"]);
    }

    #[test]
    fn oversize_files_are_demoted() {
        let config = PriorityConfig {
            max_file_size_bytes: 1024,
            ..PriorityConfig::default()
        };
        let sorted = prioritize(
            vec![
                candidate("huge.rs", 10_000_000),
                candidate("data.bin", 100),
            ],
            &config,
        );
        assert_eq!(sorted[0].path, PathBuf::from("data.bin"));
    }

    #[test]
    fn smaller_files_sort_first_within_a_bucket() {
        let sorted = prioritize(
            vec![
                candidate("big.rs", 200 * 1024),
                candidate("small.rs", 1024),
            ],
            &PriorityConfig::default(),
        );
        assert_eq!(sorted[0].path, PathBuf::from("small.rs"));
    }

    #[test]
    fn equal_keys_preserve_original_order() {
        let sorted = prioritize(
            vec![
                candidate("a.rs", 100),
                candidate("b.rs", 200),
                candidate("c.rs", 300),
            ],
            &PriorityConfig::default(),
        );
        let names: Vec<&str> = sorted
            .iter()
            .map(|c| c.path.to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.rs", "b.rs", "c.rs"]);
    }
}
