//! `multipart/form-data` bodies
//!
//! Parsing is delegated to `multer`, driven to completion on the connection
//! thread. Text fields are collected in memory under a combined limit; the
//! `file` part is spooled to a temporary file, but only once the fields in
//! front of it have been admitted and only up to the admitted size.

use crate::error::{FilegateError, Result};
use crate::protocol::param;
use crate::server::UploadedFile;
use futures::stream::{self, Stream};
use multer::{Constraints, Multipart, SizeLimit};
use std::io::{self, Read, Write};
use tempfile::NamedTempFile;
use tracing::debug;

const READ_SIZE: usize = 64 * 1024;

/// Parsed multipart body
#[derive(Debug, Default)]
pub struct MultipartForm {
    /// Text fields in body order
    pub fields: Vec<(String, String)>,
    /// Binary part, if one was admitted
    pub file: Option<UploadedFile>,
}

/// Size ceilings for one body
#[derive(Debug, Clone, Copy)]
pub struct MultipartLimits {
    /// Combined size of all text fields
    pub max_fields: u64,
    /// Size of the binary part
    pub max_file: u64,
}

/// Boundary from a `multipart/form-data; boundary=...` content type
pub fn boundary_of(content_type: &str) -> Option<String> {
    multer::parse_boundary(content_type).ok()
}

/// Read a whole multipart body
///
/// `admit` sees the text fields collected before the `file` part and
/// returns the number of bytes that part may hold, or `None` to discard it
/// unread into storage. The returned limit is clamped to
/// [`MultipartLimits::max_file`].
pub fn read_multipart<R, F>(reader: R, boundary: &str, limits: MultipartLimits, admit: F) -> Result<MultipartForm>
where
    R: Read + Send,
    F: FnMut(&[(String, String)]) -> Option<u64>,
{
    futures::executor::block_on(read_form(body_stream(reader), boundary, limits, admit))
}

async fn read_form<'r, S, F>(body: S, boundary: &str, limits: MultipartLimits, mut admit: F) -> Result<MultipartForm>
where
    S: Stream<Item = io::Result<Vec<u8>>> + Send + 'r,
    F: FnMut(&[(String, String)]) -> Option<u64>,
{
    let constraints = Constraints::new().size_limit(
        SizeLimit::new()
            .per_field(limits.max_fields)
            .for_field(param::FILE, limits.max_file),
    );
    let mut multipart = Multipart::with_constraints(body, boundary.to_string(), constraints);
    let mut form = MultipartForm::default();
    let mut field_bytes = 0u64;

    while let Some(mut field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();

        if let (true, Some(file_name)) = (name == param::FILE, field.file_name().map(str::to_string)) {
            let Some(allowed) = admit(&form.fields) else {
                debug!("Discarding unadmitted upload part '{}'", file_name);
                while field.chunk().await.map_err(malformed)?.is_some() {}
                continue;
            };
            let allowed = allowed.min(limits.max_file);

            let mut content = NamedTempFile::new()?;
            let mut written = 0u64;
            while let Some(chunk) = field.chunk().await.map_err(malformed)? {
                written += chunk.len() as u64;
                if written > allowed {
                    return Err(FilegateError::invalid(format!(
                        "upload part exceeds {} bytes",
                        allowed
                    )));
                }
                content.as_file_mut().write_all(&chunk)?;
            }
            content.as_file_mut().flush()?;
            form.file = Some(UploadedFile { file_name, content });
            continue;
        }

        let value = field.bytes().await.map_err(malformed)?;
        field_bytes += value.len() as u64;
        if field_bytes > limits.max_fields {
            return Err(FilegateError::invalid("form fields too large"));
        }
        let value = String::from_utf8(value.to_vec())
            .map_err(|_| FilegateError::invalid(format!("field '{}' is not UTF-8", name)))?;
        form.fields.push((name, value));
    }

    Ok(form)
}

fn malformed(err: multer::Error) -> FilegateError {
    match err {
        multer::Error::FieldSizeExceeded { field_name, .. } => FilegateError::invalid(format!(
            "multipart field '{}' too large",
            field_name.unwrap_or_default()
        )),
        other => FilegateError::protocol(format!("malformed multipart body: {}", other)),
    }
}

fn body_stream<R: Read + Send>(reader: R) -> impl Stream<Item = io::Result<Vec<u8>>> + Send {
    stream::try_unfold(reader, |mut reader| async move {
        let mut buf = vec![0u8; READ_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some((buf, reader)));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    })
}
