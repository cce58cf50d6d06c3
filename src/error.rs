//! Pipeline error kinds.
//!
//! Every step builds its own `anyhow` chain with `.context(...)`; the pipeline tags the chain
//! with the step that failed. At the process boundary all kinds end in the same exit code and the
//! message is printed with the full source chain.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepError {
    /// The registry could not resolve or load the named model.
    #[error("model resolution failed")]
    Resolution(#[source] anyhow::Error),

    /// Tracing the encoder into an ONNX graph failed.
    #[error("graph export failed")]
    Export(#[source] anyhow::Error),

    #[error("quantization failed")]
    Quantization(#[source] anyhow::Error),

    /// The quantized graph did not pass structural validation.
    #[error("graph validation failed")]
    Validation(#[source] anyhow::Error),

    #[error("I/O failure")]
    Io(#[source] anyhow::Error),
}

impl PrepError {
    pub fn kind(&self) -> &'static str {
        match self {
            PrepError::Resolution(_) => "resolution",
            PrepError::Export(_) => "export",
            PrepError::Quantization(_) => "quantization",
            PrepError::Validation(_) => "validation",
            PrepError::Io(_) => "io",
        }
    }
}

pub type PrepResult<T> = Result<T, PrepError>;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn test_alternate_display_walks_source_chain() {
        let inner: anyhow::Result<()> = Err(anyhow!("HTTP 404")).context("failed to download config.json");
        let err = PrepError::Resolution(inner.unwrap_err());
        assert_eq!(err.to_string(), "model resolution failed");
        assert_eq!(err.kind(), "resolution");

        // The binary prints the alternate form, which walks the source chain.
        let msg = format!("{:#}", anyhow::Error::from(err));
        assert!(msg.contains("failed to download config.json"));
        assert!(msg.contains("HTTP 404"));
    }
}
