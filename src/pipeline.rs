// Steps run in order: output dir → fetch → vocab → export → quantize → validate → size
// report → taxonomy metadata. Strictly sequential; the first failure aborts the run.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use prost::Message;

use crate::config;
use crate::error::{PrepError, PrepResult};
use crate::export::{encode_sample, GraphExporter};
use crate::metadata::IntentMetadata;
use crate::onnx::checker::check_model;
use crate::onnx::proto::ModelProto;
use crate::onnx::quantize::{quantize_dynamic, QuantType};
use crate::registry::hub::sha256_file;
use crate::registry::ModelRegistry;
use crate::vocab::Vocabulary;

/// Knobs with fixed defaults; tests shrink the sequence length.
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub sample_input: String,
    pub max_sequence_length: usize,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            sample_input: config::export::SAMPLE_INPUT.to_string(),
            max_sequence_length: config::export::MAX_SEQUENCE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SizeReport {
    pub original_bytes: u64,
    pub quantized_bytes: u64,
}

impl SizeReport {
    pub fn original_mb(&self) -> f64 {
        self.original_bytes as f64 / config::artifacts::BYTES_PER_MB
    }

    pub fn quantized_mb(&self) -> f64 {
        self.quantized_bytes as f64 / config::artifacts::BYTES_PER_MB
    }

    /// `(1 - quantized/original) * 100`; 0 when there is no original to compare against.
    pub fn reduction_percent(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        (1.0 - self.quantized_bytes as f64 / self.original_bytes as f64) * 100.0
    }

    pub fn lines(&self) -> Vec<String> {
        vec![
            format!("   Original size: {:.2} MB", self.original_mb()),
            format!("   Quantized size: {:.2} MB", self.quantized_mb()),
            format!("   Size reduction: {:.1}%", self.reduction_percent()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineResult {
    pub vocab: Artifact,
    pub graph: Artifact,
    pub quantized_graph: Artifact,
    pub metadata: Artifact,
    pub sizes: SizeReport,
}

/// Run every step for `model_id`, writing the four artifacts into `output_dir`.
pub fn prepare(
    registry: &dyn ModelRegistry,
    exporter: &dyn GraphExporter,
    model_id: &str,
    output_dir: &Path,
    options: &PrepareOptions,
) -> PrepResult<PipelineResult> {
    // The output location must be usable before anything is fetched.
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))
        .map_err(PrepError::Io)?;
    let vocab_path = output_dir.join(config::artifacts::VOCAB_FILE);
    let graph_path = output_dir.join(config::artifacts::GRAPH_FILE);
    let quantized_path = output_dir.join(config::artifacts::QUANTIZED_GRAPH_FILE);
    let metadata_path = output_dir.join(config::artifacts::METADATA_FILE);

    println!("📥 Downloading {model_id} model...");
    let model = registry
        .load(model_id)
        .with_context(|| format!("cannot resolve model '{model_id}'"))
        .map_err(PrepError::Resolution)?;
    log::info!("Model '{}' ready in {}", model.model_id, model.dir.display());

    println!("💾 Saving tokenizer vocabulary...");
    let vocab = Vocabulary::from_tokenizer(&model.tokenizer);
    if vocab.is_empty() {
        return Err(PrepError::Resolution(anyhow::anyhow!(
            "tokenizer for '{model_id}' has an empty vocabulary"
        )));
    }
    let vocab_bytes = vocab.to_json().map_err(PrepError::Io)?;
    write_artifact(&vocab_path, &vocab_bytes).map_err(PrepError::Io)?;
    log::info!("Wrote {} vocabulary entries to {}", vocab.len(), vocab_path.display());

    println!("🔄 Converting to ONNX format...");
    let sample = encode_sample(&model, &options.sample_input, options.max_sequence_length)
        .map_err(PrepError::Export)?;
    let graph = exporter
        .export(&model, &sample)
        .with_context(|| format!("export '{model_id}'"))
        .map_err(PrepError::Export)?;
    write_artifact(&graph_path, &graph.encode_to_vec()).map_err(PrepError::Io)?;

    println!("📦 Quantizing model for mobile...");
    let quantized = quantize_dynamic(&graph, QuantType::QUInt8).map_err(PrepError::Quantization)?;
    write_artifact(&quantized_path, &quantized.encode_to_vec()).map_err(PrepError::Io)?;

    let reloaded = load_model(&quantized_path).map_err(PrepError::Validation)?;
    check_model(&reloaded)
        .with_context(|| format!("{} failed structural checks", quantized_path.display()))
        .map_err(PrepError::Validation)?;
    log::info!("Validated {}", quantized_path.display());

    let sizes = SizeReport {
        original_bytes: file_size(&graph_path).map_err(PrepError::Io)?,
        quantized_bytes: file_size(&quantized_path).map_err(PrepError::Io)?,
    };
    println!("✅ Model conversion complete!");
    for line in sizes.lines() {
        println!("{line}");
    }
    log::info!(
        "Size report: original={} bytes, quantized={} bytes, reduction={:.1}%",
        sizes.original_bytes,
        sizes.quantized_bytes,
        sizes.reduction_percent()
    );

    println!();
    println!("🎯 Creating intent classification layer...");
    let metadata = IntentMetadata::taxonomy().to_json().map_err(PrepError::Io)?;
    write_artifact(&metadata_path, &metadata).map_err(PrepError::Io)?;
    println!("✅ Intent classifier metadata saved!");

    Ok(PipelineResult {
        vocab: digest(vocab_path)?,
        graph: digest(graph_path)?,
        quantized_graph: digest(quantized_path)?,
        metadata: digest(metadata_path)?,
        sizes,
    })
}

pub fn load_model(path: &Path) -> anyhow::Result<ModelProto> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    ModelProto::decode(bytes.as_slice()).with_context(|| format!("decode ONNX model {}", path.display()))
}

fn file_size(path: &Path) -> anyhow::Result<u64> {
    Ok(fs::metadata(path).with_context(|| format!("stat {}", path.display()))?.len())
}

fn digest(path: PathBuf) -> PrepResult<Artifact> {
    let sha256 = sha256_file(&path).map_err(PrepError::Io)?;
    log::info!("{} sha256 {}", path.display(), sha256);
    Ok(Artifact { path, sha256 })
}

/// Write `bytes` to `dest` via a `.tmp` sibling and rename. Stale artifacts from earlier runs are
/// replaced.
fn write_artifact(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if dest.exists() {
        log::warn!("Overwriting existing artifact {}", dest.display());
    }

    let mut tmp_name = dest.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = dest.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    file.flush()?;
    drop(file);

    fs::rename(&tmp_path, dest)
        .with_context(|| format!("failed to rename {} -> {}", tmp_path.display(), dest.display()))?;
    log::debug!("Wrote {} ({} bytes)", dest.display(), bytes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::DistilBertExporter;
    use crate::registry::LocalRegistry;
    use crate::test_support::write_tiny_model;

    fn small_options() -> PrepareOptions {
        PrepareOptions {
            max_sequence_length: 32,
            ..Default::default()
        }
    }

    #[test]
    fn test_size_report_math() {
        let mb = 1024 * 1024;
        let r = SizeReport {
            original_bytes: 260 * mb,
            quantized_bytes: 65 * mb,
        };
        assert!((r.reduction_percent() - 75.0).abs() < 1e-9);
        assert!((r.original_mb() - 260.0).abs() < 1e-9);
        assert_eq!(r.lines()[2], "   Size reduction: 75.0%");

        let empty = SizeReport { original_bytes: 0, quantized_bytes: 0 };
        assert_eq!(empty.reduction_percent(), 0.0);
    }

    #[test]
    fn test_full_run_writes_four_artifacts() {
        let models = tempfile::tempdir().unwrap();
        write_tiny_model(&models.path().join("tiny"));
        let out = tempfile::tempdir().unwrap();
        let out_dir = out.path().join("assets/models");

        let result = prepare(
            &LocalRegistry::new(models.path()),
            &DistilBertExporter::default(),
            "tiny",
            &out_dir,
            &small_options(),
        )
        .unwrap();

        for artifact in [&result.vocab, &result.graph, &result.quantized_graph, &result.metadata] {
            let len = fs::metadata(&artifact.path).unwrap().len();
            assert!(len > 0, "{} is empty", artifact.path.display());
            assert_eq!(artifact.sha256.len(), 64);
        }
        assert_eq!(result.graph.path, out_dir.join("distilbert.onnx"));
        assert!(result.sizes.quantized_bytes <= result.sizes.original_bytes);
        assert!(result.sizes.reduction_percent() > 0.0);

        let metadata: IntentMetadata =
            serde_json::from_slice(&fs::read(&result.metadata.path).unwrap()).unwrap();
        assert_eq!(metadata, IntentMetadata::taxonomy());

        let vocab: std::collections::HashMap<String, u32> =
            serde_json::from_slice(&fs::read(&result.vocab.path).unwrap()).unwrap();
        assert_eq!(vocab["[CLS]"], 2);

        check_model(&load_model(&result.quantized_graph.path).unwrap()).unwrap();
        // No temp files left behind.
        assert!(fs::read_dir(&out_dir).unwrap().all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".tmp")));
    }

    #[test]
    fn test_rerun_overwrites_with_identical_metadata() {
        let models = tempfile::tempdir().unwrap();
        write_tiny_model(&models.path().join("tiny"));
        let out = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::new(models.path());
        let exporter = DistilBertExporter::default();

        let first = prepare(&registry, &exporter, "tiny", out.path(), &small_options()).unwrap();
        fs::write(&first.metadata.path, b"stale").unwrap();
        let second = prepare(&registry, &exporter, "tiny", out.path(), &small_options()).unwrap();

        assert_eq!(first.metadata.sha256, second.metadata.sha256);
        assert_eq!(first.vocab.sha256, second.vocab.sha256);
        assert_eq!(first.graph.sha256, second.graph.sha256);
    }

    #[test]
    fn test_output_dir_collision_fails_before_fetch() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("assets");
        fs::write(&blocker, b"not a directory").unwrap();

        // The registry root does not exist either; an Io error proves fetch never ran.
        let err = prepare(
            &LocalRegistry::new(tmp.path().join("no-models")),
            &DistilBertExporter::default(),
            "tiny",
            &blocker.join("models"),
            &small_options(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "io");
    }

    #[test]
    fn test_unresolvable_model_writes_nothing() {
        let models = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let out_dir = out.path().join("models");

        let err = prepare(
            &LocalRegistry::new(models.path()),
            &DistilBertExporter::default(),
            "missing-model",
            &out_dir,
            &small_options(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "resolution");
        assert_eq!(fs::read_dir(&out_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_sequence_longer_than_positions_is_export_error() {
        let models = tempfile::tempdir().unwrap();
        write_tiny_model(&models.path().join("tiny"));
        let out = tempfile::tempdir().unwrap();

        let err = prepare(
            &LocalRegistry::new(models.path()),
            &DistilBertExporter::default(),
            "tiny",
            out.path(),
            &PrepareOptions {
                max_sequence_length: 4096,
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err.kind(), "export");
        assert!(!out.path().join("distilbert.onnx").exists());
    }
}
