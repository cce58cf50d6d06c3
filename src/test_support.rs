use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

pub const TINY_DIM: usize = 32;
pub const TINY_HIDDEN: usize = 64;
pub const TINY_LAYERS: usize = 2;
pub const TINY_HEADS: usize = 2;
pub const TINY_MAX_POSITIONS: usize = 160;

const VOCAB: &[&str] = &[
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "[MASK]", "find", "a", "book", "club", "event", "near", "me",
    "music", "today", "online", "##s", "food", "sports", "art", "tech",
];

fn tokenizer_json() -> String {
    let vocab: serde_json::Map<String, serde_json::Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(i, t)| (t.to_string(), serde_json::json!(i)))
        .collect();

    serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "[PAD]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": "[UNK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 2, "content": "[CLS]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 3, "content": "[SEP]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 4, "content": "[MASK]", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": {
            "type": "BertNormalizer",
            "clean_text": true,
            "handle_chinese_chars": true,
            "strip_accents": null,
            "lowercase": true
        },
        "pre_tokenizer": {"type": "BertPreTokenizer"},
        "post_processor": {
            "type": "BertProcessing",
            "sep": ["[SEP]", 3],
            "cls": ["[CLS]", 2]
        },
        "decoder": {"type": "WordPiece", "prefix": "##", "cleanup": true},
        "model": {
            "type": "WordPiece",
            "unk_token": "[UNK]",
            "continuing_subword_prefix": "##",
            "max_input_chars_per_word": 100,
            "vocab": vocab
        }
    })
    .to_string()
}

fn config_json(activation: &str) -> String {
    serde_json::json!({
        "activation": activation,
        "architectures": ["DistilBertForMaskedLM"],
        "attention_dropout": 0.1,
        "dim": TINY_DIM,
        "dropout": 0.1,
        "hidden_dim": TINY_HIDDEN,
        "initializer_range": 0.02,
        "max_position_embeddings": TINY_MAX_POSITIONS,
        "model_type": "distilbert",
        "n_heads": TINY_HEADS,
        "n_layers": TINY_LAYERS,
        "pad_token_id": 0,
        "qa_dropout": 0.1,
        "seq_classif_dropout": 0.2,
        "sinusoidal_pos_embds": false,
        "tie_weights_": true,
        "vocab_size": VOCAB.len()
    })
    .to_string()
}

fn weights() -> HashMap<String, Tensor> {
    let dev = Device::Cpu;
    let randn = |dims: &[usize]| Tensor::randn(0f32, 0.5f32, dims, &dev).unwrap();
    let ones = |n: usize| Tensor::ones(n, DType::F32, &dev).unwrap();
    let zeros = |n: usize| Tensor::zeros(n, DType::F32, &dev).unwrap();

    let p = "distilbert";
    let mut w = HashMap::new();
    w.insert(format!("{p}.embeddings.word_embeddings.weight"), randn(&[VOCAB.len(), TINY_DIM]));
    w.insert(format!("{p}.embeddings.position_embeddings.weight"), randn(&[TINY_MAX_POSITIONS, TINY_DIM]));
    w.insert(format!("{p}.embeddings.LayerNorm.weight"), ones(TINY_DIM));
    w.insert(format!("{p}.embeddings.LayerNorm.bias"), zeros(TINY_DIM));

    for i in 0..TINY_LAYERS {
        let l = format!("{p}.transformer.layer.{i}");
        for lin in ["q_lin", "k_lin", "v_lin", "out_lin"] {
            w.insert(format!("{l}.attention.{lin}.weight"), randn(&[TINY_DIM, TINY_DIM]));
            w.insert(format!("{l}.attention.{lin}.bias"), randn(&[TINY_DIM]));
        }
        w.insert(format!("{l}.sa_layer_norm.weight"), ones(TINY_DIM));
        w.insert(format!("{l}.sa_layer_norm.bias"), zeros(TINY_DIM));
        w.insert(format!("{l}.ffn.lin1.weight"), randn(&[TINY_HIDDEN, TINY_DIM]));
        w.insert(format!("{l}.ffn.lin1.bias"), randn(&[TINY_HIDDEN]));
        w.insert(format!("{l}.ffn.lin2.weight"), randn(&[TINY_DIM, TINY_HIDDEN]));
        w.insert(format!("{l}.ffn.lin2.bias"), randn(&[TINY_DIM]));
        w.insert(format!("{l}.output_layer_norm.weight"), ones(TINY_DIM));
        w.insert(format!("{l}.output_layer_norm.bias"), zeros(TINY_DIM));
    }
    w
}

/// Write config.json, tokenizer.json and model.safetensors for a 2-layer, 32-dim encoder.
pub fn write_tiny_model(dir: &Path) {
    write_tiny_model_with(dir, "gelu");
}

pub fn write_tiny_model_with(dir: &Path, activation: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("config.json"), config_json(activation)).unwrap();
    std::fs::write(dir.join("tokenizer.json"), tokenizer_json()).unwrap();
    candle_core::safetensors::save(&weights(), dir.join("model.safetensors")).unwrap();
}
