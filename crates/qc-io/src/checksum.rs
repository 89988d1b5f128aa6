//! `checksums.sha256` manifests: one `<sha256>  <relative path>` line per
//! report file, sorted by path.

use std::fmt::Write as _;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Forward-slash path relative to the bundle root.
    pub path: String,
    pub sha256: String,
}

pub fn manifest_for(
    bundle_root: &Path,
    relative_paths: &[PathBuf],
) -> anyhow::Result<Vec<ManifestEntry>> {
    let mut entries = relative_paths
        .iter()
        .map(|relative| -> anyhow::Result<ManifestEntry> {
            let absolute = bundle_root.join(relative);
            let contents = fs::read(&absolute)
                .with_context(|| format!("failed to hash report file {}", absolute.display()))?;
            Ok(ManifestEntry {
                path: relative.to_string_lossy().replace('\\', "/"),
                sha256: sha256_hex(&contents),
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

pub fn render_manifest(entries: &[ManifestEntry]) -> String {
    entries
        .iter()
        .map(|entry| format!("{}  {}\n", entry.sha256, entry.path))
        .collect()
}

pub fn parse_manifest(raw: &str) -> anyhow::Result<Vec<ManifestEntry>> {
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| -> anyhow::Result<ManifestEntry> {
            let (digest, path) = line
                .split_once("  ")
                .with_context(|| format!("manifest line {} is not `<sha256>  <path>`", idx + 1))?;
            if digest.len() != 64 || !digest.chars().all(|ch| ch.is_ascii_hexdigit()) {
                anyhow::bail!("manifest line {} has an invalid digest", idx + 1);
            }
            if !is_bundle_relative(path) {
                anyhow::bail!("manifest line {} names a path outside the bundle: {path}", idx + 1);
            }
            Ok(ManifestEntry {
                path: path.to_string(),
                sha256: digest.to_ascii_lowercase(),
            })
        })
        .collect()
}

/// Re-hashes every file named in `<bundle_root>/<manifest_name>`. Returns the
/// entries whose file is missing or whose digest no longer matches.
pub fn verify_bundle(
    bundle_root: &Path,
    manifest_name: &str,
) -> anyhow::Result<Vec<ManifestEntry>> {
    let manifest_path = bundle_root.join(manifest_name);
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;

    let mut mismatched = Vec::new();
    for entry in parse_manifest(&raw)? {
        let matches = fs::read(bundle_root.join(&entry.path))
            .map(|contents| sha256_hex(&contents) == entry.sha256)
            .unwrap_or(false);
        if !matches {
            mismatched.push(entry);
        }
    }
    Ok(mismatched)
}

/// Only plain relative paths below the bundle root may appear in a manifest.
fn is_bundle_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .fold(String::with_capacity(64), |mut hex, byte| {
            let _ = write!(hex, "{byte:02x}");
            hex
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn manifest_lines_parse_back() {
        let entries = vec![ManifestEntry {
            path: "charts/Linac_1__Dose_Output.json".to_string(),
            sha256: sha256_hex(b"{}"),
        }];
        assert_eq!(parse_manifest(&render_manifest(&entries)).expect("parse"), entries);
        assert!(parse_manifest("abc  summary.json\n").is_err());
        assert!(parse_manifest("no separator here\n").is_err());
    }

    #[test]
    fn manifest_paths_must_stay_inside_the_bundle() {
        let digest = sha256_hex(b"{}");
        for path in ["../outside.json", "charts/../../outside.json", "/etc/passwd"] {
            let err = parse_manifest(&format!("{digest}  {path}\n")).expect_err(path);
            assert!(err.to_string().contains("outside the bundle"), "{err}");
        }
        assert!(parse_manifest(&format!("{digest}  ./summary.json\n")).is_ok());
    }
}
