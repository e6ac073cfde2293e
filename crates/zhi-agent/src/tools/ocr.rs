//! OCR tool: text from images and PDFs via an [`OcrBackend`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use zhi_core::utils::{expand_home, truncate_at_char_boundary};
use zhi_providers::http_provider::validate_ocr_file;
use zhi_providers::OcrBackend;

use super::base::{require_string, Tool};

/// Cap on returned text, in bytes.
const MAX_OCR_OUTPUT: usize = 50 * 1024;

pub struct OcrTool {
    backend: Arc<dyn OcrBackend>,
    working_dir: PathBuf,
}

impl OcrTool {
    pub fn new(backend: Arc<dyn OcrBackend>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            working_dir: working_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for OcrTool {
    fn name(&self) -> &str {
        "ocr"
    }

    fn description(&self) -> &str {
        "Extract text from images and PDFs using OCR. \
         Supported formats: PDF, PNG, JPG, JPEG, GIF, WEBP. \
         Maximum file size: 20MB."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the image or PDF file to OCR."
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let path_str = require_string(&params, "path")?;
        // Absolute paths are fine here: the user often names files outside
        // the working directory.
        let expanded = expand_home(&path_str);
        let path = if expanded.is_absolute() {
            expanded
        } else {
            self.working_dir.join(expanded)
        };

        validate_ocr_file(&path)?;
        debug!(path = %path.display(), "running OCR");
        let text = self
            .backend
            .extract_text(&path)
            .await
            .map_err(|e| anyhow::anyhow!("OCR failed: {e}"))?;

        if text.trim().is_empty() {
            return Ok("OCR completed but no text was extracted from the file.".into());
        }
        if text.len() > MAX_OCR_OUTPUT {
            return Ok(format!(
                "{}\n[truncated, showing first 50KB of {}B]",
                truncate_at_char_boundary(&text, MAX_OCR_OUTPUT),
                text.len()
            ));
        }
        Ok(text)
    }
}
