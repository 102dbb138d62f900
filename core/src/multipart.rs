//! Form and multipart request-body encoding.
//!
//! Text `form` fields alone go out URL-encoded; any `files` entry upgrades
//! the whole body to `multipart/form-data`. File contents are read through
//! tokio's fs so a worker assembling an attachment never blocks the runtime.

use std::collections::HashMap;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::EngineError;

/// A fully assembled request body and its content type.
#[derive(Debug)]
pub(crate) struct EncodedForm {
    pub content_type: String,
    pub body: Bytes,
}

/// Encode form fields as `application/x-www-form-urlencoded`.
pub(crate) fn urlencode(form: &HashMap<String, serde_json::Value>) -> EncodedForm {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in form {
        serializer.append_pair(name, &stringify(value));
    }
    EncodedForm {
        content_type: "application/x-www-form-urlencoded".to_string(),
        body: Bytes::from(serializer.finish()),
    }
}

/// Encode form fields plus file attachments as `multipart/form-data`.
///
/// A file that cannot be read fails the request, not the engine.
pub(crate) async fn multipart(
    form: Option<&HashMap<String, serde_json::Value>>,
    files: &HashMap<String, String>,
) -> Result<EncodedForm, EngineError> {
    let boundary = format!("courier-{}", Uuid::new_v4().simple());
    let mut body: Vec<u8> = Vec::new();
    if let Some(fields) = form {
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(stringify(value).as_bytes());
            body.extend_from_slice(b"\r\n");
        }
    }
    for (name, path) in files {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|err| EngineError::Transport(format!("file {path}: {err}")))?;
        let filename = std::path::Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"; \
                 filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(&contents);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    Ok(EncodedForm {
        content_type: format!("multipart/form-data; boundary={boundary}"),
        body: Bytes::from(body),
    })
}

/// Host-supplied field values are arbitrary JSON; strings pass through,
/// everything else uses its JSON rendering.
pub(crate) fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
