//! MIME type detection for fetched content
//!
//! Magic bytes win when the `infer` crate recognizes them. Otherwise the file
//! name extension is consulted, then the head of the content is checked for
//! UTF-8 text.

/// Bytes of content looked at for detection.
pub const SNIFF_LENGTH: usize = 8 * 1024;

pub const OCTET_STREAM: &str = "application/octet-stream";
pub const TEXT_PLAIN: &str = "text/plain";

/// Detect the MIME type of a file from its name and header bytes
///
/// # Example
///
/// ```
/// use sharecrawl_smb::mime::detect_mime_type;
///
/// let png_header = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
/// assert_eq!(detect_mime_type("picture", png_header), "image/png");
/// assert_eq!(detect_mime_type("notes.txt", b"x"), "text/plain");
/// ```
pub fn detect_mime_type(name: &str, header: &[u8]) -> String {
    if let Some(kind) = infer::get(header) {
        return kind.mime_type().to_string();
    }
    if let Some(mime) = mime_from_extension(name) {
        return mime.to_string();
    }
    if looks_like_text(header) {
        return TEXT_PLAIN.to_string();
    }
    OCTET_STREAM.to_string()
}

/// MIME type implied by the file name extension, case-insensitively
pub fn mime_from_extension(name: &str) -> Option<&'static str> {
    let (_, ext) = name.rsplit_once('.')?;
    let mime = match ext.to_ascii_lowercase().as_str() {
        "txt" | "log" | "ini" | "cfg" | "conf" => "text/plain",
        "csv" => "text/csv",
        "htm" | "html" => "text/html",
        "css" => "text/css",
        "md" => "text/markdown",
        "xml" => "application/xml",
        "json" => "application/json",
        "js" => "text/javascript",
        "rtf" => "application/rtf",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "odt" => "application/vnd.oasis.opendocument.text",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => return None,
    };
    Some(mime)
}

/// Valid UTF-8 without control characters other than whitespace.
///
/// A multi-byte sequence cut off at the end of the sniffed window still
/// counts as text.
fn looks_like_text(header: &[u8]) -> bool {
    if header.is_empty() {
        return false;
    }
    let text = match std::str::from_utf8(header) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => {
            // Truncated trailing sequence; the prefix up to it is valid.
            match std::str::from_utf8(&header[..e.valid_up_to()]) {
                Ok(text) => text,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    !text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t' | '\u{c}'))
}
