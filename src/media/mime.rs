use super::MediaKind;

/// File extension for a downloaded media body.
///
/// Audio is always saved as mp3 whatever the server declares.
pub fn extension_for(kind: MediaKind, content_type: &str) -> &'static str {
    match kind {
        MediaKind::Audio => "mp3",
        MediaKind::Image => {
            let essence = content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            match essence.as_str() {
                "image/jpeg" | "image/jpg" => "jpg",
                "image/png" => "png",
                "image/gif" => "gif",
                "image/webp" => "webp",
                _ => {
                    tracing::warn!(
                        "Unrecognized image content type '{}', falling back to jpg",
                        content_type
                    );
                    "jpg"
                }
            }
        }
    }
}

/// Quoted `filename="..."` value from a Content-Disposition header.
pub fn filename_from_disposition(header: &str) -> Option<String> {
    let start = header.find("filename=\"")? + "filename=\"".len();
    let rest = &header[start..];
    let end = rest.find('"')?;
    let name = sanitize_filename(&rest[..end]);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Keep only the final path component so names cannot escape the download dir.
fn sanitize_filename(raw: &str) -> String {
    raw.rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .trim()
        .trim_start_matches('.')
        .to_string()
}

/// Replace whatever extension `name` has with `ext`.
pub fn with_extension(name: &str, ext: &str) -> String {
    let stem = match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    };
    format!("{}.{}", stem, ext)
}

/// Upload MIME type derived from the file extension, e.g. `application/pdf`.
///
/// Extensions that are not a valid MIME subtype token fall back to
/// `application/octet-stream`.
pub fn upload_mime(extension: &str) -> String {
    let is_token = !extension.is_empty()
        && extension
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "!#$&-^_.+".contains(c));
    if is_token {
        format!("application/{}", extension.to_ascii_lowercase())
    } else {
        "application/octet-stream".to_string()
    }
}
