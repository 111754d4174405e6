//! File-backed data source
//!
//! Loads CSV/TSV, Parquet, and JSON files through polars. The whole file is
//! loaded once on `open` and rows are sliced from memory afterwards.

use polars::prelude::*;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::{DataSource, LoadedTable, SourceMetadata, TableHandle};
use crate::error::{Result, SheetflowError};

/// File format, chosen from the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Csv,
    Tsv,
    Parquet,
    Json,
}

impl SourceFormat {
    /// Detect the format from a path's extension. Unknown extensions read as CSV.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "tsv" | "tab" => SourceFormat::Tsv,
            "parquet" | "pq" => SourceFormat::Parquet,
            "json" | "jsonl" | "ndjson" => SourceFormat::Json,
            _ => SourceFormat::Csv,
        }
    }
}

/// Polars-backed file reader.
#[derive(Debug, Clone)]
pub struct FileSource {
    has_header: bool,
    infer_schema_length: Option<usize>,
}

impl Default for FileSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSource {
    pub fn new() -> Self {
        Self {
            has_header: true,
            infer_schema_length: Some(100),
        }
    }

    /// Whether delimited files start with a header row
    pub fn with_has_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    /// Rows scanned to infer column types (`None` scans everything)
    pub fn with_infer_schema_length(mut self, rows: Option<usize>) -> Self {
        self.infer_schema_length = rows;
        self
    }

    fn open_file(path: &Path) -> Result<File> {
        File::open(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SheetflowError::NotFound(path.display().to_string()),
            _ => SheetflowError::IoError(e),
        })
    }

    fn load_delimited(&self, path: &Path, separator: u8) -> Result<DataFrame> {
        let file = Self::open_file(path)?;

        let parse_opts = CsvParseOptions::default().with_separator(separator);

        CsvReadOptions::default()
            .with_has_header(self.has_header)
            .with_infer_schema_length(self.infer_schema_length)
            .with_parse_options(parse_opts)
            .into_reader_with_file_handle(file)
            .finish()
            .map_err(|e| SheetflowError::DataError(e.to_string()))
    }

    /// Load the whole file into a DataFrame.
    pub fn load(&self, path: &Path) -> Result<DataFrame> {
        let start = Instant::now();
        let df = match SourceFormat::from_path(path) {
            SourceFormat::Csv => self.load_delimited(path, b',')?,
            SourceFormat::Tsv => self.load_delimited(path, b'\t')?,
            SourceFormat::Parquet => ParquetReader::new(Self::open_file(path)?)
                .finish()
                .map_err(|e| SheetflowError::DataError(e.to_string()))?,
            SourceFormat::Json => JsonReader::new(Self::open_file(path)?)
                .finish()
                .map_err(|e| SheetflowError::DataError(e.to_string()))?,
        };

        debug!(
            path = %path.display(),
            rows = df.height(),
            cols = df.width(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Loaded source file"
        );
        Ok(df)
    }
}

impl DataSource for FileSource {
    fn probe(&self, locator: &str) -> Result<SourceMetadata> {
        let path = Path::new(locator);
        let metadata = std::fs::metadata(path)
            .map_err(|_| SheetflowError::NotFound(locator.to_string()))?;
        if !metadata.is_file() {
            return Err(SheetflowError::NotFound(locator.to_string()));
        }

        Ok(SourceMetadata {
            locator: locator.to_string(),
            size_bytes: metadata.len(),
            path: Some(path.to_path_buf()),
        })
    }

    fn open(&self, locator: &str) -> Result<Arc<dyn TableHandle>> {
        let path = Path::new(locator);
        if !path.is_file() {
            return Err(SheetflowError::NotFound(locator.to_string()));
        }
        let df = self.load(path)?;
        Ok(Arc::new(LoadedTable::new(locator, df)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_csv(rows: usize) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "id,name,score").unwrap();
        for i in 0..rows {
            writeln!(file, "{},row{},{}", i, i, i as f64 * 0.5).unwrap();
        }
        file
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(SourceFormat::from_path(Path::new("a.CSV")), SourceFormat::Csv);
        assert_eq!(SourceFormat::from_path(Path::new("a.tsv")), SourceFormat::Tsv);
        assert_eq!(SourceFormat::from_path(Path::new("a.parquet")), SourceFormat::Parquet);
        assert_eq!(SourceFormat::from_path(Path::new("a.jsonl")), SourceFormat::Json);
        assert_eq!(SourceFormat::from_path(Path::new("a.xyz")), SourceFormat::Csv);
    }

    #[test]
    fn test_open_csv() {
        let file = create_test_csv(25);
        let source = FileSource::new();
        let locator = file.path().to_str().unwrap();

        let meta = source.probe(locator).unwrap();
        assert!(meta.size_bytes > 0);

        let handle = source.open(locator).unwrap();
        assert_eq!(handle.len(), 25);
        assert_eq!(handle.schema().len(), 3);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let source = FileSource::new();
        assert!(matches!(
            source.probe("/definitely/not/here.csv"),
            Err(SheetflowError::NotFound(_))
        ));
        assert!(matches!(
            source.open("/definitely/not/here.csv"),
            Err(SheetflowError::NotFound(_))
        ));
    }
}
