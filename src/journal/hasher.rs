//! GT-014: BLAKE3 content hashing for declarations and assets.
//!
//! Every hash is rendered as `blake3:{hex}`.

use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

fn render(hash: blake3::Hash) -> String {
    format!("blake3:{}", hash.to_hex())
}

/// Hash a string.
pub fn hash_string(s: &str) -> String {
    render(blake3::hash(s.as_bytes()))
}

/// Hash an ordered list of components. Component boundaries are part of the
/// hash, so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    render(hasher.finalize())
}

/// Serialize with sorted object keys at every depth.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(k.clone()),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Hash a file's contents, streaming.
pub fn hash_file(path: &Path) -> Result<String, String> {
    let mut file =
        std::fs::File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; STREAM_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| format!("read error {}: {}", path.display(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(render(hasher.finalize()))
}

/// Hash a directory tree: sorted walk, relative paths included, symlinks
/// skipped.
pub fn hash_directory(path: &Path) -> Result<String, String> {
    let mut entries: Vec<(String, String)> = Vec::new();
    walk(path, path, &mut entries)?;

    let mut hasher = blake3::Hasher::new();
    for (rel, hash) in &entries {
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    Ok(render(hasher.finalize()))
}

fn walk(base: &Path, current: &Path, entries: &mut Vec<(String, String)>) -> Result<(), String> {
    let read_dir = std::fs::read_dir(current)
        .map_err(|e| format!("cannot read dir {}: {}", current.display(), e))?;
    let mut children: Vec<std::fs::DirEntry> = read_dir.filter_map(|e| e.ok()).collect();
    children.sort_by_key(|e| e.file_name());

    for entry in children {
        let ft = entry.file_type().map_err(|e| format!("stat error: {}", e))?;
        if ft.is_symlink() {
            continue;
        }
        let path = entry.path();
        let rel = path
            .strip_prefix(base)
            .map_err(|e| format!("path prefix error: {}", e))?
            .to_string_lossy()
            .to_string();
        if ft.is_file() {
            entries.push((rel, hash_file(&path)?));
        } else if ft.is_dir() {
            walk(base, &path, entries)?;
        }
    }
    Ok(())
}

/// Hash a file or a directory, whichever the path is.
pub fn hash_path(path: &Path) -> Result<String, String> {
    if path.is_dir() {
        hash_directory(path)
    } else {
        hash_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gt014_hash_string() {
        let h1 = hash_string("hello");
        assert_eq!(h1, hash_string("hello"));
        assert_ne!(h1, hash_string("world"));
        assert_eq!(h1.len(), 7 + 64);
    }

    #[test]
    fn test_gt014_composite_boundaries() {
        assert_ne!(composite_hash(&["ab", "c"]), composite_hash(&["a", "bc"]));
        assert_ne!(composite_hash(&["a", "b"]), composite_hash(&["b", "a"]));
    }

    #[test]
    fn test_gt014_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": [1, 2], "c": null}});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
        let b = json!({"a": {"c": null, "d": [1, 2]}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_gt014_canonical_json_escapes_keys() {
        let v = json!({"we\"ird": "x"});
        assert_eq!(canonical_json(&v), r#"{"we\"ird":"x"}"#);
    }

    #[test]
    fn test_gt014_hash_file_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.zip");
        std::fs::write(&path, "payload").unwrap();
        let h = hash_file(&path).unwrap();
        assert_eq!(h, hash_path(&path).unwrap());
        std::fs::write(&path, "payload v2").unwrap();
        assert_ne!(h, hash_file(&path).unwrap());
    }

    #[test]
    fn test_gt014_hash_directory_creation_order() {
        let d1 = tempfile::tempdir().unwrap();
        std::fs::write(d1.path().join("b.txt"), "bbb").unwrap();
        std::fs::write(d1.path().join("a.txt"), "aaa").unwrap();
        let d2 = tempfile::tempdir().unwrap();
        std::fs::write(d2.path().join("a.txt"), "aaa").unwrap();
        std::fs::write(d2.path().join("b.txt"), "bbb").unwrap();
        assert_eq!(
            hash_directory(d1.path()).unwrap(),
            hash_directory(d2.path()).unwrap()
        );
        assert_eq!(
            hash_path(d1.path()).unwrap(),
            hash_directory(d1.path()).unwrap()
        );
    }

    #[test]
    fn test_gt014_hash_missing_file() {
        assert!(hash_file(Path::new("/nonexistent/lambda.zip")).is_err());
    }
}
