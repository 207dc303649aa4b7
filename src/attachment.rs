use std::path::Path;

use bytes::Bytes;
use reqwest::multipart::Part;

use crate::error::{ChatError, ChatResult};

const CSV_MIME: &str = "text/csv";
const XLS_MIME: &str = "application/vnd.ms-excel";
const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// A dataset file sent along with chat requests.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_for(&file_name).to_string();
        Self {
            file_name,
            mime_type,
            data: data.into(),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> ChatResult<Self> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| ChatError::InvalidRequest(format!("{} is not a file", path.display())))?;
        let data = tokio::fs::read(path).await?;
        Ok(Self::new(file_name, data))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_valid_file_type(&self) -> bool {
        is_valid_file_type(&self.file_name, &self.mime_type)
    }

    pub fn is_csv(&self) -> bool {
        is_csv_file(&self.file_name, &self.mime_type)
    }

    /// Chat sessions only accept CSV data.
    pub fn ensure_chat_compatible(&self) -> ChatResult<()> {
        if self.is_csv() {
            Ok(())
        } else {
            Err(ChatError::UnsupportedFile(self.file_name.clone()))
        }
    }

    /// Multipart part sharing the attachment's buffer; the file is not
    /// copied per request.
    pub(crate) fn to_part(&self) -> ChatResult<Part> {
        Part::stream_with_length(self.data.clone(), self.data.len() as u64)
            .file_name(self.file_name.clone())
            .mime_str(&self.mime_type)
            .map_err(ChatError::from)
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".csv") {
        CSV_MIME
    } else if lower.ends_with(".xlsx") {
        XLSX_MIME
    } else if lower.ends_with(".xls") {
        XLS_MIME
    } else {
        "application/octet-stream"
    }
}

pub fn is_csv_file(file_name: &str, mime_type: &str) -> bool {
    file_name.to_ascii_lowercase().ends_with(".csv") || mime_type == CSV_MIME
}

pub fn is_excel_file(file_name: &str, mime_type: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower.ends_with(".xlsx")
        || lower.ends_with(".xls")
        || mime_type == XLSX_MIME
        || mime_type == XLS_MIME
}

/// Spreadsheet formats the analysis backend accepts.
pub fn is_valid_file_type(file_name: &str, mime_type: &str) -> bool {
    is_csv_file(file_name, mime_type) || is_excel_file(file_name, mime_type)
}

/// Human-readable size, e.g. `"1.5 KB"`.
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    let mut exponent = 0;
    let mut scaled = bytes;
    while scaled >= 1024 && exponent < UNITS.len() - 1 {
        scaled /= 1024;
        exponent += 1;
    }
    let value = bytes as f64 / 1024f64.powi(exponent as i32);
    let rounded = (value * 100.0).round() / 100.0;

    // Trailing zeros trimmed: 1.50 -> 1.5, 2.00 -> 2.
    format!("{} {}", rounded, UNITS[exponent])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_spreadsheet_types() {
        assert!(is_valid_file_type("sales.csv", ""));
        assert!(is_valid_file_type("Report.XLSX", ""));
        assert!(is_valid_file_type("upload", XLS_MIME));
        assert!(!is_valid_file_type("notes.txt", "text/plain"));

        assert!(is_csv_file("upload", CSV_MIME));
        assert!(!is_csv_file("book.xls", XLS_MIME));
        assert!(is_excel_file("book.xls", ""));
    }

    #[test]
    fn attachment_guesses_mime_type() {
        let attachment = Attachment::new("sales.csv", "a,b\n1,2\n");
        assert_eq!(attachment.mime_type, CSV_MIME);
        assert_eq!(attachment.len(), 8);
        assert!(attachment.ensure_chat_compatible().is_ok());

        let excel = Attachment::new("book.xlsx", Vec::<u8>::new());
        assert!(excel.is_valid_file_type());
        assert!(matches!(
            excel.ensure_chat_compatible(),
            Err(ChatError::UnsupportedFile(name)) if name == "book.xlsx"
        ));
    }

    #[test]
    fn formats_file_sizes() {
        assert_eq!(format_file_size(0), "0 Bytes");
        assert_eq!(format_file_size(512), "512 Bytes");
        assert_eq!(format_file_size(1024), "1 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5 MB");
        assert_eq!(format_file_size(1_234_567_890), "1.15 GB");
    }

    #[tokio::test]
    async fn loads_attachment_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, "x,y\n").unwrap();

        let attachment = Attachment::from_path(&path).await.unwrap();
        assert_eq!(attachment.file_name, "data.csv");
        assert_eq!(&attachment.data[..], b"x,y\n");
    }
}
