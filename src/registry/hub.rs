// Downloads config/tokenizer/weights from `{base}/{model_id}/resolve/{revision}/{file}` and caches
// them at ~/.cache/intent-model-prep/<model_id>/. The hub publishes no digests up front, so the
// first download records each file's SHA256 in a cache manifest; later runs verify against it and
// re-download anything that no longer matches.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{validate_model_id, ModelBundle, ModelRegistry};
use crate::config;

const MODEL_FILES: [&str; 3] = [
    config::hub::CONFIG_FILE,
    config::hub::TOKENIZER_FILE,
    config::hub::WEIGHTS_FILE,
];

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheManifest {
    model_id: String,
    revision: String,
    /// file name -> hex SHA256
    files: BTreeMap<String, String>,
}

pub struct HubRegistry {
    base_url: String,
    revision: String,
    cache_root: PathBuf,
}

impl HubRegistry {
    pub fn new(base_url: &str, revision: &str, cache_root: PathBuf) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            revision: revision.to_string(),
            cache_root,
        }
    }

    /// Cache root from `INTENT_PREP_CACHE_DIR`, else ~/.cache/intent-model-prep.
    pub fn default_cache_root() -> anyhow::Result<PathBuf> {
        if let Ok(v) = std::env::var(config::hub::CACHE_DIR_ENV) {
            if !v.trim().is_empty() {
                return Ok(PathBuf::from(v));
            }
        }
        let home = crate::logging::home_dir()
            .context("cannot determine home directory (neither HOME nor USERPROFILE is set)")?;
        Ok(home.join(config::hub::CACHE_DIR_REL))
    }

    pub fn file_url(&self, model_id: &str, file: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.base_url, model_id, self.revision, file)
    }

    fn model_dir(&self, model_id: &str) -> PathBuf {
        self.cache_root.join(model_id)
    }

    /// Download all model files unless the cache already holds verified copies.
    pub fn ensure_model_files(&self, model_id: &str) -> anyhow::Result<PathBuf> {
        validate_model_id(model_id)?;
        let dir = self.model_dir(model_id);
        let manifest_path = dir.join(config::hub::MANIFEST_FILE);

        let mut manifest = read_manifest(&manifest_path)
            .filter(|m| m.model_id == model_id && m.revision == self.revision)
            .unwrap_or_else(|| CacheManifest {
                model_id: model_id.to_string(),
                revision: self.revision.clone(),
                files: BTreeMap::new(),
            });

        let stale: Vec<&str> = MODEL_FILES
            .iter()
            .copied()
            .filter(|f| !cached_file_valid(&dir.join(f), manifest.files.get(*f)))
            .collect();

        if stale.is_empty() {
            log::info!("Model files already cached at {}", dir.display());
            return Ok(dir);
        }

        log::info!("Downloading {} file(s) of '{}' to {}", stale.len(), model_id, dir.display());
        fs::create_dir_all(&dir).with_context(|| format!("failed to create model dir {}", dir.display()))?;

        for file in stale {
            let digest = download_file(&self.file_url(model_id, file), &dir.join(file))?;
            manifest.files.insert(file.to_string(), digest);
        }

        let json = serde_json::to_vec_pretty(&manifest).context("serialize cache manifest")?;
        fs::write(&manifest_path, json).with_context(|| format!("write {}", manifest_path.display()))?;

        log::info!("Model download complete");
        Ok(dir)
    }
}

impl ModelRegistry for HubRegistry {
    fn load(&self, model_id: &str) -> anyhow::Result<ModelBundle> {
        let dir = self.ensure_model_files(model_id)?;
        ModelBundle::load(model_id, &dir)
    }
}

fn read_manifest(path: &Path) -> Option<CacheManifest> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(m) => Some(m),
        Err(e) => {
            log::warn!("Ignoring unreadable cache manifest {}: {}", path.display(), e);
            None
        }
    }
}

fn cached_file_valid(path: &Path, expected_sha256: Option<&String>) -> bool {
    let Some(expected) = expected_sha256 else {
        return false;
    };
    match sha256_file(path) {
        Ok(actual) if &actual == expected => true,
        Ok(actual) => {
            log::warn!(
                "SHA256 mismatch for cached {}: expected {}, got {}",
                path.display(),
                expected,
                actual
            );
            false
        }
        Err(_) => false,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf).with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Download a file to `dest` (atomically) and return its SHA256.
fn download_file(url: &str, dest: &Path) -> anyhow::Result<String> {
    let filename = dest.file_name().unwrap_or_default().to_string_lossy();
    log::info!("Downloading {} from {}", filename, url);

    let resp = ureq::get(url)
        .timeout(std::time::Duration::from_secs(config::hub::DOWNLOAD_TIMEOUT_SECS))
        .call()
        .with_context(|| format!("failed to download {url}"))?;

    let status = resp.status();
    if status != 200 {
        bail!("HTTP {status} downloading {url}");
    }

    let mut body = Vec::new();
    resp.into_reader()
        .read_to_end(&mut body)
        .with_context(|| format!("failed to read response body for {url}"))?;
    if body.is_empty() {
        bail!("empty response body for {url}");
    }

    let digest = sha256_hex(&body);
    log::info!("Downloaded {} ({} bytes, sha256 {})", filename, body.len(), &digest[..12]);

    // Write atomically: write to .tmp, then rename
    let tmp_path = dest.with_extension("tmp");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(&body)?;
    file.flush()?;
    drop(file);

    fs::rename(&tmp_path, dest)
        .with_context(|| format!("failed to rename {} -> {}", tmp_path.display(), dest.display()))?;

    Ok(digest)
}
