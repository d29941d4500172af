use chrono::Utc;
use common::{
    error::AppError,
    model::{BlockMeta, RawBlock},
    utils::checksum::sha1_hex,
};
use serde_json::Value;
use tracing::warn;

const FAST_PATH_MIN_LEN: usize = 150;
const FAST_PATH_MIN_ASCII_RATIO: f64 = 0.7;

/// One mining input: either raw text or a named file with payload bytes.
#[derive(Debug, Clone)]
pub enum FileOrText {
    Text(String),
    File {
        filename: String,
        data: Vec<u8>,
        content_type: String,
    },
}

impl FileOrText {
    /// Normalizes inputs to `{filename, data, content_type}`. Bare strings
    /// become `input_{i}.txt`.
    pub fn normalize(inputs: Vec<FileOrText>) -> Vec<(String, Vec<u8>, String)> {
        inputs
            .into_iter()
            .enumerate()
            .map(|(i, input)| match input {
                FileOrText::Text(text) => (
                    format!("input_{i}.txt"),
                    text.into_bytes(),
                    "text/plain".to_string(),
                ),
                FileOrText::File {
                    filename,
                    data,
                    content_type,
                } => (filename, data, content_type),
            })
            .collect()
    }
}

/// Turns document bytes into raw text blocks tagged with provenance.
/// The parser is a seam: production uses [`DefaultDocumentParser`], tests may
/// substitute scripted ones.
pub trait DocumentParser: Send + Sync {
    fn extract(
        &self,
        filename: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<Vec<RawBlock>, AppError>;
}

/// Handles plain text, markdown, JSON and PDF. Unknown formats are decoded
/// as lossy UTF-8 text rather than failing the input.
#[derive(Default)]
pub struct DefaultDocumentParser;

impl DefaultDocumentParser {
    fn resolve_content_type(filename: &str, content_type: &str) -> String {
        if !content_type.trim().is_empty() {
            return content_type.trim().to_lowercase();
        }
        mime_guess::from_path(filename)
            .first()
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| "text/plain".to_string())
    }

    fn block(text: String, filename: &str, content_type: &str, sha1: &str, page_no: Option<u32>) -> RawBlock {
        RawBlock {
            text,
            meta: BlockMeta {
                source_file: filename.to_string(),
                content_type: content_type.to_string(),
                sha1: sha1.to_string(),
                page_no,
                created_at: Utc::now(),
            },
        }
    }

    /// Collects every scalar in a JSON document into one text body, in
    /// document order.
    fn flatten_json(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                if !s.trim().is_empty() {
                    out.push(s.trim().to_string());
                }
            }
            Value::Number(n) => out.push(n.to_string()),
            Value::Bool(b) => out.push(b.to_string()),
            Value::Array(items) => {
                for item in items {
                    Self::flatten_json(item, out);
                }
            }
            Value::Object(map) => {
                for (key, item) in map {
                    out.push(format!("{key}:"));
                    Self::flatten_json(item, out);
                }
            }
            Value::Null => {}
        }
    }

    fn extract_pdf(
        filename: &str,
        data: &[u8],
        content_type: &str,
        sha1: &str,
    ) -> Result<Vec<RawBlock>, AppError> {
        let page_count = lopdf::Document::load_mem(data)
            .map(|document| document.get_pages().len())
            .map_err(|e| AppError::Processing(format!("unreadable PDF {filename}: {e}")))?;
        if page_count == 0 {
            return Err(AppError::Processing(format!(
                "PDF {filename} appears to have no pages"
            )));
        }

        let text = pdf_extract::extract_text_from_mem(data)
            .map_err(|e| AppError::Processing(format!("pdf extraction failed for {filename}: {e}")))?;

        // Text-layer sanity gate: scanned PDFs yield next to nothing here and
        // need an OCR path this service does not ship.
        let ascii = text.chars().filter(char::is_ascii).count();
        let ratio = if text.is_empty() {
            0.0
        } else {
            ascii as f64 / text.chars().count() as f64
        };
        if text.trim().len() < FAST_PATH_MIN_LEN && ratio < FAST_PATH_MIN_ASCII_RATIO {
            return Err(AppError::Processing(format!(
                "PDF {filename} has no usable text layer"
            )));
        }

        // pdf-extract separates pages with form feeds when the document
        // carries page structure; fall back to one block otherwise.
        let pages: Vec<&str> = text.split('\u{c}').collect();
        let blocks: Vec<RawBlock> = pages
            .iter()
            .enumerate()
            .filter(|(_, page)| !page.trim().is_empty())
            .map(|(i, page)| {
                Self::block(
                    page.trim().to_string(),
                    filename,
                    content_type,
                    sha1,
                    Some(i.saturating_add(1) as u32),
                )
            })
            .collect();

        if blocks.is_empty() {
            return Ok(Vec::new());
        }
        if blocks.len() == 1 {
            // Single page: drop the page tag, it adds nothing.
            let mut only = blocks;
            if let Some(first) = only.first_mut() {
                first.meta.page_no = None;
            }
            return Ok(only);
        }
        Ok(blocks)
    }
}

impl DocumentParser for DefaultDocumentParser {
    fn extract(
        &self,
        filename: &str,
        data: &[u8],
        content_type: &str,
    ) -> Result<Vec<RawBlock>, AppError> {
        let content_type = Self::resolve_content_type(filename, content_type);
        let sha1 = sha1_hex(data);

        let is_pdf = content_type == "application/pdf" || filename.to_lowercase().ends_with(".pdf");
        if is_pdf {
            return Self::extract_pdf(filename, data, &content_type, &sha1);
        }

        let is_json = content_type == "application/json" || filename.to_lowercase().ends_with(".json");
        if is_json {
            let text = String::from_utf8_lossy(data);
            let value: Value = serde_json::from_str(&text)
                .map_err(|e| AppError::Processing(format!("invalid JSON in {filename}: {e}")))?;
            let mut parts = Vec::new();
            Self::flatten_json(&value, &mut parts);
            let body = parts.join("\n");
            if body.trim().is_empty() {
                return Ok(Vec::new());
            }
            return Ok(vec![Self::block(body, filename, &content_type, &sha1, None)]);
        }

        // Text, markdown and anything else: decode as UTF-8, lossily for
        // unknown binary formats.
        let text = match std::str::from_utf8(data) {
            Ok(text) => text.to_string(),
            Err(_) => {
                warn!(filename, content_type, "non-UTF-8 input decoded lossily");
                String::from_utf8_lossy(data).into_owned()
            }
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Self::block(text, filename, &content_type, &sha1, None)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_yields_one_block_with_sha1() {
        let parser = DefaultDocumentParser;
        let blocks = parser
            .extract("notes.txt", b"The system shall support SSO.", "")
            .expect("extract");

        assert_eq!(blocks.len(), 1);
        let block = blocks.first().expect("block");
        assert_eq!(block.meta.source_file, "notes.txt");
        assert_eq!(block.meta.sha1.len(), 40);
        assert!(block.text.contains("SSO"));
    }

    #[test]
    fn json_scalars_are_flattened_in_order() {
        let parser = DefaultDocumentParser;
        let data = br#"{"requirements": ["login fast", "log out safely"], "count": 2}"#;
        let blocks = parser.extract("reqs.json", data, "application/json").expect("extract");

        assert_eq!(blocks.len(), 1);
        let text = &blocks.first().expect("block").text;
        assert!(text.contains("login fast"));
        assert!(text.contains("log out safely"));
        assert!(text.contains('2'));
    }

    #[test]
    fn invalid_json_is_a_processing_error() {
        let parser = DefaultDocumentParser;
        let result = parser.extract("broken.json", b"{not json", "application/json");
        assert!(matches!(result, Err(AppError::Processing(_))));
    }

    #[test]
    fn empty_input_yields_no_blocks() {
        let parser = DefaultDocumentParser;
        let blocks = parser.extract("empty.txt", b"   ", "text/plain").expect("extract");
        assert!(blocks.is_empty());
    }

    #[test]
    fn normalize_names_bare_strings() {
        let inputs = vec![
            FileOrText::Text("first".to_string()),
            FileOrText::File {
                filename: "doc.md".to_string(),
                data: b"# Title".to_vec(),
                content_type: "text/markdown".to_string(),
            },
        ];
        let normalized = FileOrText::normalize(inputs);
        assert_eq!(normalized.first().map(|(n, _, _)| n.as_str()), Some("input_0.txt"));
        assert_eq!(normalized.get(1).map(|(n, _, _)| n.as_str()), Some("doc.md"));
    }

    #[test]
    fn identical_bytes_share_sha1_across_names() {
        let parser = DefaultDocumentParser;
        let a = parser.extract("a.txt", b"same body", "").expect("a");
        let b = parser.extract("b.txt", b"same body", "").expect("b");
        assert_eq!(
            a.first().map(|x| x.meta.sha1.clone()),
            b.first().map(|x| x.meta.sha1.clone())
        );
    }
}
