use async_trait::async_trait;

/// Turns an uploaded file into prompt text.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<String, ExtractError>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Unsupported file type: {ext}")]
    Unsupported { ext: String },

    #[error("Failed to decode file: {0}")]
    Decode(String),
}

/// Extensions read as plain text.
const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "py", "js", "ts", "jsx", "tsx", "json", "yaml", "yml", "xml", "html", "css",
    "sql", "sh", "bash", "toml", "env", "log", "csv", "ini", "cfg", "conf", "rst", "go", "rs",
    "java", "kt", "swift", "c", "cpp", "h", "hpp", "cs", "php", "rb", "pl", "r", "scala", "vue",
    "svelte", "astro", "prisma", "graphql", "proto", "dockerfile", "makefile", "cmake", "gradle",
    "properties",
];

/// Extension-less file names that are known to be text.
const TEXT_FILENAMES: &[&str] = &["dockerfile", "makefile", "readme", "license", ".gitignore"];

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Extractor for text and source files.
#[derive(Debug, Clone)]
pub struct TextExtractor {
    max_chars: usize,
}

impl TextExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn is_supported(filename: &str) -> bool {
        let lower = filename.to_lowercase();
        if TEXT_FILENAMES.contains(&lower.as_str()) {
            return true;
        }
        extension(&lower).is_some_and(|ext| TEXT_EXTENSIONS.contains(&ext))
    }
}

/// Text after the last dot; `.env` yields `env`.
fn extension(filename: &str) -> Option<&str> {
    filename.rsplit_once('.').map(|(_, ext)| ext)
}

#[async_trait]
impl ContentExtractor for TextExtractor {
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<String, ExtractError> {
        if !Self::is_supported(filename) {
            let ext = extension(&filename.to_lowercase())
                .map(|e| format!(".{e}"))
                .unwrap_or_else(|| filename.to_string());
            return Err(ExtractError::Unsupported { ext });
        }

        let body = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        if body.contains(&0) {
            return Err(ExtractError::Decode(format!(
                "{filename} looks like a binary file"
            )));
        }
        let text = String::from_utf8_lossy(body);

        let total = text.chars().count();
        if total <= self.max_chars {
            return Ok(text.into_owned());
        }
        let kept: String = text.chars().take(self.max_chars).collect();
        Ok(format!(
            "{kept}\n\n[Truncated: showing {} of {total} chars]",
            self.max_chars
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_source_files() {
        let ex = TextExtractor::new(1000);
        let text = ex.extract(b"fn main() {}\n", "main.rs").await.unwrap();
        assert_eq!(text, "fn main() {}\n");
        assert!(TextExtractor::is_supported("Dockerfile"));
        assert!(TextExtractor::is_supported(".env"));
        assert!(TextExtractor::is_supported("NOTES.MD"));
    }

    #[tokio::test]
    async fn rejects_unknown_extensions() {
        let ex = TextExtractor::new(1000);
        let err = ex.extract(b"%PDF-1.7", "report.pdf").await.unwrap_err();
        assert_eq!(
            err,
            ExtractError::Unsupported {
                ext: ".pdf".to_string()
            }
        );
    }

    #[tokio::test]
    async fn strips_bom_and_tolerates_bad_utf8() {
        let ex = TextExtractor::new(1000);
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice(b"caf\xC3\xA9 \xFF!");
        let text = ex.extract(&bytes, "notes.txt").await.unwrap();
        assert_eq!(text, "café \u{FFFD}!");
    }

    #[tokio::test]
    async fn binary_content_fails_to_decode() {
        let ex = TextExtractor::new(1000);
        let err = ex.extract(b"abc\0def", "data.log").await.unwrap_err();
        assert!(matches!(err, ExtractError::Decode(_)));
    }

    #[tokio::test]
    async fn long_files_are_truncated_with_notice() {
        let ex = TextExtractor::new(10);
        let text = ex.extract("é".repeat(25).as_bytes(), "a.txt").await.unwrap();
        assert!(text.starts_with(&"é".repeat(10)));
        assert!(text.ends_with("[Truncated: showing 10 of 25 chars]"));
    }
}
