//! Loading target manifests from YAML files.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

use keel_core::{config::env_or, manifest_from_value, Manifest};

fn max_manifest_bytes() -> usize {
    env_or("KEEL_MAX_MANIFEST_BYTES", 1_048_576)
}

fn max_manifest_nodes() -> usize {
    env_or("KEEL_MAX_MANIFEST_NODES", 100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => map.values().for_each(|vv| walk(vv, cur, max)),
            Json::Array(arr) => arr.iter().for_each(|vv| walk(vv, cur, max)),
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse every document in a (possibly multi-document) YAML string.
/// `kind: List` documents are flattened into their items.
pub fn parse_manifests(yaml: &str) -> Result<Vec<Manifest>> {
    if yaml.len() > max_manifest_bytes() {
        return Err(anyhow!("YAML payload too large (>{} bytes)", max_manifest_bytes()));
    }
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(doc).with_context(|| format!("parsing YAML document {idx}"))?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if node_budget_exceeded(&json, max_manifest_nodes()) {
            return Err(anyhow!("document {idx} too complex (>{} nodes)", max_manifest_nodes()));
        }
        if json.get("kind").and_then(Json::as_str) == Some("List") {
            let items = json.get("items").and_then(Json::as_array).cloned().unwrap_or_default();
            for item in items {
                out.push(to_manifest(item, idx)?);
            }
        } else {
            out.push(to_manifest(json, idx)?);
        }
    }
    Ok(out)
}

fn to_manifest(json: Json, idx: usize) -> Result<Manifest> {
    if json.get("apiVersion").and_then(Json::as_str).is_none() {
        return Err(anyhow!("document {idx}: YAML missing apiVersion"));
    }
    if json.get("kind").and_then(Json::as_str).is_none() {
        return Err(anyhow!("document {idx}: YAML missing kind"));
    }
    let meta = json.get("metadata");
    let named = ["name", "generateName"].iter().any(|f| meta.and_then(|m| m.get(*f)).and_then(Json::as_str).is_some());
    if !named {
        return Err(anyhow!("document {idx}: YAML missing metadata.name"));
    }
    manifest_from_value(json).map_err(|e| anyhow!("document {idx}: {e}"))
}

/// Load `.yaml`/`.yml`/`.json` files from a file or a directory (non-recursive, sorted by name).
pub fn load_manifests(path: &Path) -> Result<Vec<Manifest>> {
    let files: Vec<PathBuf> = if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("reading directory {}", path.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml" | "json")))
            .collect();
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };
    let mut out = Vec::new();
    for file in files {
        let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        let docs = parse_manifests(&text).with_context(|| format!("in {}", file.display()))?;
        debug!(file = %file.display(), count = docs.len(), "loaded manifests");
        out.extend(docs);
    }
    Ok(out)
}
