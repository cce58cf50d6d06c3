mod config;
mod error;
mod export;
mod logging;
mod metadata;
mod onnx;
mod pipeline;
mod registry;
#[cfg(test)]
mod test_support;
mod vocab;

use std::path::PathBuf;

use anyhow::{bail, Context};

use crate::export::DistilBertExporter;
use crate::pipeline::PrepareOptions;
use crate::registry::{HubRegistry, LocalRegistry, ModelRegistry};

const USAGE: &str = "\
Usage: prepare_models [OPTIONS]

Download a pretrained encoder, export it to ONNX, quantize it and write the
intent taxonomy metadata for the mobile NLP plugins.

Options:
  --model <id>              Model identifier (default: distilbert-base-uncased)
  --output-dir <path>       Where artifacts are written (default: assets/models)
  --local-model-dir <path>  Load model files from this directory instead of the hub
  --hub-url <url>           Model hub base URL (default: https://huggingface.co)
  --revision <rev>          Hub revision (default: main)
  -h, --help                Print this help

Environment:
  INTENT_PREP_LOG           Log spec, e.g. debug (default: info)
  INTENT_PREP_CACHE_DIR     Download cache (default: ~/.cache/intent-model-prep)";

#[derive(Debug, PartialEq)]
struct Args {
    model_id: String,
    output_dir: PathBuf,
    local_model_dir: Option<PathBuf>,
    hub_url: String,
    revision: String,
    help: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            model_id: config::hub::DEFAULT_MODEL_ID.to_string(),
            output_dir: PathBuf::from(config::artifacts::DEFAULT_OUTPUT_DIR),
            local_model_dir: None,
            hub_url: config::hub::DEFAULT_BASE_URL.to_string(),
            revision: config::hub::DEFAULT_REVISION.to_string(),
            help: false,
        }
    }
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .with_context(|| format!("missing value for {arg}"))
        };
        match arg.as_str() {
            "-h" | "--help" => parsed.help = true,
            "--model" => parsed.model_id = value()?,
            "--output-dir" => parsed.output_dir = PathBuf::from(value()?),
            "--local-model-dir" => parsed.local_model_dir = Some(PathBuf::from(value()?)),
            "--hub-url" => parsed.hub_url = value()?,
            "--revision" => parsed.revision = value()?,
            other => bail!("unknown argument '{other}' (see --help)"),
        }
    }
    Ok(parsed)
}

fn main() {
    if let Err(e) = real_main() {
        println!("❌ Error: {e:#}");
        log::error!("Fatal error: {:?}", e);
        std::process::exit(1);
    }
}

fn real_main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&argv)?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }

    logging::init_logging()?;
    log::info!("Arguments: {:?}", args);

    let registry: Box<dyn ModelRegistry> = match &args.local_model_dir {
        Some(dir) => Box::new(LocalRegistry::new(dir)),
        None => Box::new(HubRegistry::new(
            &args.hub_url,
            &args.revision,
            HubRegistry::default_cache_root()?,
        )),
    };

    let result = pipeline::prepare(
        registry.as_ref(),
        &DistilBertExporter::default(),
        &args.model_id,
        &args.output_dir,
        &PrepareOptions::default(),
    )
    .map_err(|e| {
        log::error!("Pipeline failed at {} step", e.kind());
        e
    })?;

    log::info!(
        "Prepared {} and {} ({:.1}% smaller)",
        result.graph.path.display(),
        result.quantized_graph.path.display(),
        result.sizes.reduction_percent()
    );
    println!("\n🎉 Setup complete! Models ready for mobile deployment.");
    Ok(())
}
