// IMPORTANT:
// Keep ALL numeric values and artifact names centralized here (no hardcoded values scattered around).

// NOTE: TOOL_VERSION must stay in sync with the `version` field in Cargo.toml.
pub const TOOL_VERSION: &str = "0.1.0";
pub const TOOL_NAME: &str = "intent-model-prep";

pub mod logging {
    pub const LOG_DIR_REL: &str = ".intent-model-prep/logs";
    pub const LOG_FILE_NAME: &str = "prepare_models";
    pub const LOG_SPEC_ENV: &str = "INTENT_PREP_LOG";
    pub const DEFAULT_LOG_SPEC: &str = "info";

    pub const LOG_ROTATE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
    pub const LOG_ROTATE_KEEP_FILES: usize = 5;
}

pub mod hub {
    pub const DEFAULT_MODEL_ID: &str = "distilbert-base-uncased";
    pub const DEFAULT_BASE_URL: &str = "https://huggingface.co";
    pub const DEFAULT_REVISION: &str = "main";

    pub const CONFIG_FILE: &str = "config.json";
    pub const TOKENIZER_FILE: &str = "tokenizer.json";
    pub const WEIGHTS_FILE: &str = "model.safetensors";
    pub const MANIFEST_FILE: &str = "manifest.json";

    // Download cache (relative to home), overridable with CACHE_DIR_ENV.
    pub const CACHE_DIR_REL: &str = ".cache/intent-model-prep";
    pub const CACHE_DIR_ENV: &str = "INTENT_PREP_CACHE_DIR";

    // Weights for distilbert-base-uncased are ~260 MB.
    pub const DOWNLOAD_TIMEOUT_SECS: u64 = 600;

    // Same ceiling the safetensors crate enforces.
    pub const MAX_SAFETENSORS_HEADER_BYTES: u64 = 100_000_000;
}

pub mod export {
    pub const SAMPLE_INPUT: &str = "find a book club event near me";
    pub const MAX_SEQUENCE_LENGTH: usize = 128;

    pub const OPSET_VERSION: i64 = 11;
    // IR version that shipped with opset 11 (onnx 1.6).
    pub const IR_VERSION: i64 = 6;

    pub const INPUT_IDS: &str = "input_ids";
    pub const ATTENTION_MASK: &str = "attention_mask";
    pub const OUTPUT: &str = "output";
    pub const BATCH_AXIS: &str = "batch_size";
    pub const SEQUENCE_AXIS: &str = "sequence";

    pub const LAYER_NORM_EPS: f32 = 1e-12;
    pub const WEIGHT_PREFIX: &str = "distilbert";
}

pub mod quantize {
    pub const QUANTIZED_SUFFIX: &str = "_quantized";
    pub const SCALE_SUFFIX: &str = "_scale";
    pub const ZERO_POINT_SUFFIX: &str = "_zero_point";
    pub const MIN_OPSET: i64 = 11;
}

pub mod artifacts {
    pub const DEFAULT_OUTPUT_DIR: &str = "assets/models";

    pub const VOCAB_FILE: &str = "vocab.json";
    pub const GRAPH_FILE: &str = "distilbert.onnx";
    pub const QUANTIZED_GRAPH_FILE: &str = "distilbert_quantized.onnx";
    pub const METADATA_FILE: &str = "intent_metadata.json";

    pub const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
}

pub mod taxonomy {
    pub const CATEGORIES: [&str; 8] = [
        "Social & Networking",
        "Entertainment",
        "Sports & Fitness",
        "Education & Learning",
        "Arts & Culture",
        "Food & Dining",
        "Technology",
        "Community & Charity",
    ];

    pub const LOCATION_INTENTS: [&str; 4] = ["near_me", "specific_location", "online", "any"];

    pub const TIME_INTENTS: [&str; 6] = [
        "today",
        "tomorrow",
        "this_week",
        "this_weekend",
        "next_week",
        "any",
    ];
}
