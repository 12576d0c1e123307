// src/normalize.rs

use crate::config::NormalizerConfig;
use crate::error::NormalizeError;
use calamine::{Reader, open_workbook_auto};
use lopdf::Document;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::{debug, info, warn};

const PDF_EXTENSIONS: &[&str] = &["pdf"];
const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp", "heic",
];
const SPREADSHEET_EXTENSIONS: &[&str] = &["xlsx", "xls", "csv"];

/// Page separator written between OCR'd pages.
const PAGE_MARKER: &str = "--- Page";
const OCR_ERROR_MARKER: &str = "[OCR Error]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Image,
    Spreadsheet,
}

impl FileKind {
    /// Classify by extension; anything unknown fails fast.
    pub fn from_path(path: &Path) -> Result<Self, NormalizeError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if PDF_EXTENSIONS.contains(&ext.as_str()) {
            Ok(FileKind::Pdf)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Ok(FileKind::Image)
        } else if SPREADSHEET_EXTENSIONS.contains(&ext.as_str()) {
            Ok(FileKind::Spreadsheet)
        } else if ext.is_empty() {
            Err(NormalizeError::UnsupportedType("(no extension)".to_string()))
        } else {
            Err(NormalizeError::UnsupportedType(format!(".{ext}")))
        }
    }
}

/// How the text of a document was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeMethod {
    PdfNative,
    /// Native text below the threshold, kept because OCR was unavailable.
    PdfNativeSparse,
    PdfOcr,
    ImageOcr,
    ImageNoNative,
    Spreadsheet,
}

impl NormalizeMethod {
    pub fn confidence(self) -> f64 {
        match self {
            NormalizeMethod::PdfNative | NormalizeMethod::Spreadsheet => 1.0,
            NormalizeMethod::PdfOcr => 0.85,
            NormalizeMethod::ImageOcr => 0.80,
            NormalizeMethod::PdfNativeSparse => 0.5,
            NormalizeMethod::ImageNoNative => 0.0,
        }
    }

    pub fn is_ocr(self) -> bool {
        matches!(self, NormalizeMethod::PdfOcr | NormalizeMethod::ImageOcr)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NormalizeMethod::PdfNative => "pdf_native",
            NormalizeMethod::PdfNativeSparse => "pdf_native_sparse",
            NormalizeMethod::PdfOcr => "pdf_ocr",
            NormalizeMethod::ImageOcr => "image_ocr",
            NormalizeMethod::ImageNoNative => "image_no_native",
            NormalizeMethod::Spreadsheet => "spreadsheet",
        }
    }
}

/// Plain text of a source document plus how it was read.
#[derive(Debug, Clone, Serialize)]
pub struct NormalizedDocument {
    pub text: String,
    pub method: NormalizeMethod,
    pub page_count: usize,
    pub char_count: usize,
    pub confidence: f64,
}

impl NormalizedDocument {
    fn new(text: String, method: NormalizeMethod, page_count: usize) -> Self {
        let char_count = text.chars().count();
        Self {
            text,
            method,
            page_count,
            char_count,
            confidence: method.confidence(),
        }
    }
}

/// Coarse type detection, used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedType {
    PdfNative,
    PdfScanned,
    Image,
    Spreadsheet,
    Unknown,
}

/// Result of attempting to extract embedded text from a PDF.
#[derive(Debug)]
pub enum PdfContent {
    /// Enough embedded text to skip OCR.
    Text { text: String, pages: usize },
    /// Some text, but below the threshold.
    Sparse { text: String, pages: usize },
    /// No readable text layer, needs OCR.
    ScannedImage { pages: usize },
    Error(String),
}

pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    /// Full normalization: native text first, OCR when it is too thin.
    pub fn normalize(&self, path: &Path) -> Result<NormalizedDocument, NormalizeError> {
        let kind = FileKind::from_path(path)?;
        let bytes = read_source(path)?;

        let doc = match kind {
            FileKind::Pdf => self.normalize_pdf(path, &bytes, true)?,
            FileKind::Image => {
                let text = self.ocr_image(path)?;
                NormalizedDocument::new(text, NormalizeMethod::ImageOcr, 1)
            }
            FileKind::Spreadsheet => self.normalize_spreadsheet(path)?,
        };

        info!(
            method = doc.method.as_str(),
            pages = doc.page_count,
            chars = doc.char_count,
            "Normalized document"
        );
        Ok(doc)
    }

    /// Fast provisional read that never shells out to OCR.
    ///
    /// Images come back empty with `ImageNoNative`; spreadsheets are read normally.
    pub fn normalize_native_only(&self, path: &Path) -> Result<NormalizedDocument, NormalizeError> {
        let kind = FileKind::from_path(path)?;
        let bytes = read_source(path)?;

        match kind {
            FileKind::Pdf => self.normalize_pdf(path, &bytes, false),
            FileKind::Image => Ok(NormalizedDocument::new(
                String::new(),
                NormalizeMethod::ImageNoNative,
                1,
            )),
            FileKind::Spreadsheet => self.normalize_spreadsheet(path),
        }
    }

    fn normalize_pdf(
        &self,
        path: &Path,
        bytes: &[u8],
        allow_ocr: bool,
    ) -> Result<NormalizedDocument, NormalizeError> {
        match extract_pdf_text(bytes, self.config.min_native_chars) {
            PdfContent::Text { text, pages } => {
                Ok(NormalizedDocument::new(text, NormalizeMethod::PdfNative, pages))
            }
            PdfContent::Error(e) => Err(NormalizeError::DecodeError(e)),
            PdfContent::Sparse { text, pages } if !allow_ocr => Ok(NormalizedDocument::new(
                text,
                NormalizeMethod::PdfNativeSparse,
                pages,
            )),
            PdfContent::ScannedImage { pages } if !allow_ocr => Ok(NormalizedDocument::new(
                String::new(),
                NormalizeMethod::PdfNativeSparse,
                pages,
            )),
            PdfContent::Sparse { text, pages } => match self.ocr_pdf(path, pages) {
                Ok(ocr) => Ok(NormalizedDocument::new(ocr, NormalizeMethod::PdfOcr, pages)),
                Err(e) if !text.trim().is_empty() => {
                    warn!(error = %e, "OCR unavailable, keeping sparse native text");
                    Ok(NormalizedDocument::new(
                        text,
                        NormalizeMethod::PdfNativeSparse,
                        pages,
                    ))
                }
                Err(e) => Err(e),
            },
            PdfContent::ScannedImage { pages } => {
                let ocr = self.ocr_pdf(path, pages)?;
                Ok(NormalizedDocument::new(ocr, NormalizeMethod::PdfOcr, pages))
            }
        }
    }

    /// Rasterize up to `max_pages` pages and OCR each one.
    ///
    /// A page that fails keeps its marker with `[OCR Error]` so nothing is
    /// dropped silently; only a total failure is an error.
    fn ocr_pdf(&self, path: &Path, pages: usize) -> Result<String, NormalizeError> {
        let page_limit = pages.clamp(1, self.config.max_pages.max(1) as usize);
        let temp_dir = TempDir::new()?;
        let prefix = temp_dir.path().join("page");
        let dpi = self.config.dpi.to_string();
        let last = page_limit.to_string();

        let status = Command::new("pdftoppm")
            .args(["-png", "-r", &dpi, "-f", "1", "-l", &last])
            .arg(path)
            .arg(&prefix)
            .status();
        check_status(status, "pdftoppm", "pdftoppm failed to rasterize PDF")?;

        let mut out = String::new();
        let mut failed = 0;
        for page in 1..=page_limit {
            let page_text = match find_page_image(temp_dir.path(), page) {
                Some(image) => match self.run_tesseract(&image) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(page, error = %e, "OCR failed for page");
                        failed += 1;
                        OCR_ERROR_MARKER.to_string()
                    }
                },
                None => {
                    warn!(page, "No rasterized image for page");
                    failed += 1;
                    OCR_ERROR_MARKER.to_string()
                }
            };
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("{PAGE_MARKER} {page} ---\n{}", page_text.trim()));
        }

        if failed == page_limit {
            return Err(NormalizeError::DecodeError(format!(
                "OCR failed on all {page_limit} pages"
            )));
        }
        debug!(pages = page_limit, failed, "PDF OCR complete");
        Ok(out)
    }

    fn ocr_image(&self, path: &Path) -> Result<String, NormalizeError> {
        let text = self.run_tesseract(path)?;
        if text.trim().is_empty() {
            return Err(NormalizeError::DecodeError(
                "OCR produced no text for image".to_string(),
            ));
        }
        Ok(text)
    }

    fn run_tesseract(&self, image_path: &Path) -> Result<String, NormalizeError> {
        let output = Command::new("tesseract")
            .arg(image_path)
            .arg("stdout")
            .args(["-l", &self.config.ocr_language, "--oem", "3", "--psm", "6"])
            .output();

        match output {
            Ok(output) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(NormalizeError::DecodeError(format!("tesseract failed: {stderr}")))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NormalizeError::ToolNotFound("tesseract".to_string()))
            }
            Err(e) => Err(NormalizeError::Io(e)),
        }
    }

    fn normalize_spreadsheet(&self, path: &Path) -> Result<NormalizedDocument, NormalizeError> {
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));

        let (headers, rows) = if is_csv {
            read_csv(path)?
        } else {
            read_workbook(path)?
        };

        let text = render_table(&headers, &rows, self.config.spreadsheet_max_rows);
        Ok(NormalizedDocument::new(text, NormalizeMethod::Spreadsheet, 1))
    }
}

/// Read a file, distinguishing a missing path from an empty upload.
fn read_source(path: &Path) -> Result<Vec<u8>, NormalizeError> {
    if !path.exists() {
        return Err(NormalizeError::FileNotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    if bytes.is_empty() {
        return Err(NormalizeError::EmptyFile(path.to_path_buf()));
    }
    Ok(bytes)
}

/// Page count from lopdf, text from pdf-extract. Only the amount of
/// embedded text decides between native and OCR; page layout is not consulted.
pub fn extract_pdf_text(pdf_bytes: &[u8], min_chars: usize) -> PdfContent {
    let pages = match Document::load_mem(pdf_bytes) {
        Ok(d) => d.get_pages().len().max(1),
        Err(e) => return PdfContent::Error(format!("Failed to parse PDF: {e}")),
    };

    match pdf_extract::extract_text_from_mem(pdf_bytes) {
        Ok(text) => {
            let chars = text.trim().chars().count();
            if chars < min_chars {
                info!(chars, pages, "Embedded text below threshold");
                PdfContent::Sparse { text, pages }
            } else {
                debug!(chars, pages, "Embedded text accepted");
                PdfContent::Text { text, pages }
            }
        }
        Err(e) => {
            warn!(error = %e, "pdf-extract failed, treating as scanned");
            PdfContent::ScannedImage { pages }
        }
    }
}

/// Classify a file for diagnostics without running OCR.
pub fn detect_file_type(path: &Path, min_native_chars: usize) -> DetectedType {
    match FileKind::from_path(path) {
        Ok(FileKind::Image) => DetectedType::Image,
        Ok(FileKind::Spreadsheet) => DetectedType::Spreadsheet,
        Ok(FileKind::Pdf) => match std::fs::read(path) {
            Ok(bytes) => match extract_pdf_text(&bytes, min_native_chars) {
                PdfContent::Text { .. } => DetectedType::PdfNative,
                PdfContent::Sparse { .. } | PdfContent::ScannedImage { .. } => {
                    DetectedType::PdfScanned
                }
                PdfContent::Error(_) => DetectedType::Unknown,
            },
            Err(_) => DetectedType::Unknown,
        },
        Err(_) => DetectedType::Unknown,
    }
}

fn check_status(
    result: std::io::Result<std::process::ExitStatus>,
    tool: &str,
    message: &str,
) -> Result<(), NormalizeError> {
    match result {
        Ok(s) if s.success() => Ok(()),
        Ok(_) => Err(NormalizeError::DecodeError(message.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(NormalizeError::ToolNotFound(tool.to_string()))
        }
        Err(e) => Err(NormalizeError::Io(e)),
    }
}

/// pdftoppm pads page numbers to the width of the page count.
fn find_page_image(dir: &Path, page: usize) -> Option<PathBuf> {
    [1, 2, 3, 4]
        .into_iter()
        .map(|width| dir.join(format!("page-{page:0width$}.png")))
        .find(|p| p.exists())
}

type Table = (Vec<String>, Vec<Vec<String>>);

fn read_csv(path: &Path) -> Result<Table, NormalizeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| NormalizeError::DecodeError(format!("Could not open CSV: {e}")))?;

    let headers = reader
        .headers()
        .map_err(|e| NormalizeError::DecodeError(format!("Could not read CSV header: {e}")))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| NormalizeError::DecodeError(format!("Bad CSV row: {e}")))?;
        rows.push(record.iter().map(|c| c.trim().to_string()).collect());
    }
    Ok((headers, rows))
}

fn read_workbook(path: &Path) -> Result<Table, NormalizeError> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| NormalizeError::DecodeError(format!("Could not open workbook: {e}")))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| NormalizeError::DecodeError("Workbook has no sheets".to_string()))?;
    let range = workbook
        .worksheet_range(&sheet)
        .map_err(|e| NormalizeError::DecodeError(format!("Sheet not readable: {e}")))?;

    let mut rows = range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string().trim().to_string()).collect::<Vec<_>>());
    let headers = rows.next().unwrap_or_default();
    Ok((headers, rows.collect()))
}

/// Render a header + rows table as the text summary fed to the cleaner.
pub fn render_table(headers: &[String], rows: &[Vec<String>], max_rows: usize) -> String {
    let mut out = format!("Columns: {}\nRows: {}\n\n", headers.join(", "), rows.len());
    out.push_str(&headers.join("\t"));
    for row in rows.iter().take(max_rows) {
        out.push('\n');
        out.push_str(&row.join("\t"));
    }
    if rows.len() > max_rows {
        out.push_str(&format!("\n... ({} more rows)", rows.len() - max_rows));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn normalizer() -> Normalizer {
        Normalizer::new(NormalizerConfig::default())
    }

    const BILL_LINES: &[&str] = &[
        "Southern California Edison",
        "Service account 8001053647",
        "SERVICE ADDRESS: 1151 OLYMPIC DR, CORONA CA 92881",
        "Total electricity you used this month in kWh 160,474",
        "Amount due $37,225.88",
    ];

    /// Four scanned-looking pages (an image, no fonts) followed by one page
    /// with a real text layer.
    fn image_heavy_pdf(lines: &[&str]) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{Object, Stream, dictionary};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        // a 1x1 grey pixel; the byte doubles as an empty content stream
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 1,
                "Height" => 1,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![b' '],
        ));
        let draw_image = vec![
            Operation::new("q", vec![]),
            Operation::new("cm", vec![500.into(), 0.into(), 0.into(), 700.into(), 50.into(), 50.into()]),
            Operation::new("Do", vec!["Im1".into()]),
            Operation::new("Q", vec![]),
        ];

        let mut kids: Vec<Object> = Vec::new();
        for _ in 0..4 {
            let content = Content { operations: draw_image.clone() };
            let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => dictionary! { "XObject" => dictionary! { "Im1" => image_id } },
            });
            kids.push(page_id.into());
        }

        let mut operations = draw_image.clone();
        operations.push(Operation::new("BT", vec![]));
        operations.push(Operation::new("Tf", vec!["F1".into(), 10.into()]));
        operations.push(Operation::new("Td", vec![60.into(), 750.into()]));
        for line in lines {
            operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
            operations.push(Operation::new("Td", vec![0.into(), (-14).into()]));
        }
        operations.push(Operation::new("ET", vec![]));
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            Content { operations }.encode().unwrap(),
        ));
        let text_page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
                "XObject" => dictionary! { "Im1" => image_id },
            },
        });
        kids.push(text_page_id.into());

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Count" => kids.len() as i64,
                "Kids" => kids,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_image_heavy_pdf_with_text_stays_native() {
        let bytes = image_heavy_pdf(BILL_LINES);
        match extract_pdf_text(&bytes, 100) {
            PdfContent::Text { text, pages } => {
                assert_eq!(pages, 5);
                assert!(text.contains("Edison"));
            }
            other => panic!("expected native text, got {other:?}"),
        }

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scanned_with_text.pdf");
        std::fs::write(&path, &bytes).unwrap();
        let doc = normalizer().normalize_native_only(&path).unwrap();
        assert_eq!(doc.method, NormalizeMethod::PdfNative);
        assert!(doc.text.contains("Amount due"));
        assert_eq!(detect_file_type(&path, 100), DetectedType::PdfNative);
    }

    #[test]
    fn test_thin_text_layer_is_sparse() {
        let bytes = image_heavy_pdf(&["Page 1 of 1"]);
        assert!(matches!(
            extract_pdf_text(&bytes, 100),
            PdfContent::Sparse { pages: 5, .. }
        ));
    }

    #[test]
    fn test_garbage_bytes() {
        let result = extract_pdf_text(b"this is not a pdf", 100);
        assert!(matches!(result, PdfContent::Error(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bill.docx");
        std::fs::write(&path, b"content").unwrap();
        let err = normalizer().normalize(&path).unwrap_err();
        assert!(matches!(err, NormalizeError::UnsupportedType(ext) if ext == ".docx"));
    }

    #[test]
    fn test_missing_and_empty_files() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.pdf");
        assert!(matches!(
            normalizer().normalize(&missing),
            Err(NormalizeError::FileNotFound(_))
        ));

        let empty = dir.path().join("empty.pdf");
        std::fs::File::create(&empty).unwrap();
        assert!(matches!(
            normalizer().normalize(&empty),
            Err(NormalizeError::EmptyFile(_))
        ));
    }

    #[test]
    fn test_corrupt_pdf_is_decode_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"this is not a pdf").unwrap();
        assert!(matches!(
            normalizer().normalize_native_only(&path),
            Err(NormalizeError::DecodeError(_))
        ));
    }

    #[test]
    fn test_native_only_image_is_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scan.PNG");
        std::fs::write(&path, b"\x89PNG fake").unwrap();
        let doc = normalizer().normalize_native_only(&path).unwrap();
        assert_eq!(doc.method, NormalizeMethod::ImageNoNative);
        assert!(doc.text.is_empty());
        assert_eq!(doc.confidence, 0.0);
    }

    #[test]
    fn test_csv_renders_table_summary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "Meter, kWh, Amount").unwrap();
        writeln!(f, "V349N-002081,160474,37225.88").unwrap();
        writeln!(f, "V349N-002082,1200,310.00").unwrap();
        drop(f);

        let doc = normalizer().normalize(&path).unwrap();
        assert_eq!(doc.method, NormalizeMethod::Spreadsheet);
        assert!(doc.text.starts_with("Columns: Meter, kWh, Amount\nRows: 2\n\n"));
        assert!(doc.text.contains("V349N-002081\t160474\t37225.88"));
        assert_eq!(detect_file_type(&path, 100), DetectedType::Spreadsheet);
    }

    #[test]
    fn test_render_table_truncates_rows() {
        let headers = vec!["a".to_string()];
        let rows: Vec<Vec<String>> = (0..5).map(|i| vec![i.to_string()]).collect();
        let text = render_table(&headers, &rows, 2);
        assert!(text.contains("Rows: 5"));
        assert!(text.ends_with("... (3 more rows)"));
        assert!(!text.contains("\n4"));
    }

    #[test]
    fn test_confidence_per_method() {
        assert_eq!(NormalizeMethod::PdfNative.confidence(), 1.0);
        assert_eq!(NormalizeMethod::PdfOcr.confidence(), 0.85);
        assert_eq!(NormalizeMethod::ImageOcr.confidence(), 0.80);
        assert!(NormalizeMethod::ImageOcr.is_ocr());
    }
}
