use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::config::DataFormat;

/// Opens a file and returns a buffered reader, automatically decompressing
/// based on file extension (.gz, .zst, .zstd).
pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Box<dyn BufRead>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let reader: Box<dyn Read> = match extension.as_str() {
        "gz" | "gzip" => Box::new(GzDecoder::new(file)),
        "zst" | "zstd" => Box::new(zstd::Decoder::new(file)?),
        _ => Box::new(file),
    };

    Ok(Box::new(BufReader::new(reader)))
}

/// Reads entire file content as string, automatically decompressing if needed.
pub fn read_to_string<P: AsRef<Path>>(path: P) -> Result<String> {
    let mut reader = open_file(path)?;
    let mut content = String::new();
    reader.read_to_string(&mut content)?;
    Ok(content)
}

/// Reads the documents of a corpus file.
///
/// JSONL files yield one document per line, taken from `text_field`; blank
/// lines and empty texts are skipped. Text files are a single document.
pub fn read_documents<P: AsRef<Path>>(
    path: P,
    format: DataFormat,
    text_field: &str,
) -> Result<Vec<String>> {
    let path = path.as_ref();
    match format {
        DataFormat::Text => {
            let content = read_to_string(path)?;
            if content.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![content])
            }
        }
        DataFormat::Jsonl => {
            let reader = open_file(path)?;
            let mut documents = Vec::new();
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: Value = serde_json::from_str(&line).with_context(|| {
                    format!("{}:{}: malformed JSON record", path.display(), line_no + 1)
                })?;
                let text = record
                    .get(text_field)
                    .and_then(Value::as_str)
                    .with_context(|| {
                        format!(
                            "{}:{}: missing string field '{}'",
                            path.display(),
                            line_no + 1,
                            text_field
                        )
                    })?;
                if !text.is_empty() {
                    documents.push(text.to_string());
                }
            }
            Ok(documents)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        std::fs::write(&path, "hello\nworld").unwrap();

        let content = read_to_string(&path).unwrap();
        assert_eq!(content, "hello\nworld");
    }

    #[test]
    fn test_read_gzip_jsonl() {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.jsonl.gz");

        let file = File::create(&path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder
            .write_all(b"{\"text\": \"first\"}\n\n{\"text\": \"\"}\n{\"text\": \"second\"}\n")
            .unwrap();
        encoder.finish().unwrap();

        let docs = read_documents(&path, DataFormat::Jsonl, "text").unwrap();
        assert_eq!(docs, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn test_read_zstd_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.txt.zst");

        let file = File::create(&path).unwrap();
        let mut encoder = zstd::Encoder::new(file, 0).unwrap();
        encoder.write_all(b"one document\nspanning lines").unwrap();
        encoder.finish().unwrap();

        let docs = read_documents(&path, DataFormat::Text, "text").unwrap();
        assert_eq!(docs, vec!["one document\nspanning lines".to_string()]);
    }

    #[test]
    fn test_custom_text_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.jsonl");
        std::fs::write(&path, "{\"body\": \"abc\", \"text\": 3}\n").unwrap();

        let docs = read_documents(&path, DataFormat::Jsonl, "body").unwrap();
        assert_eq!(docs, vec!["abc".to_string()]);
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.jsonl");
        std::fs::write(&path, "{\"text\": \"ok\"}\nnot json\n").unwrap();

        let err = read_documents(&path, DataFormat::Jsonl, "text").unwrap_err();
        assert!(format!("{err:#}").contains(":2:"));
    }
}
