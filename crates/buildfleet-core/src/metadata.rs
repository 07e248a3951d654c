//! Build metadata file.
//!
//! Exporter response values that are base64-encoded JSON objects are expanded
//! in place; everything else stays a string. The file is replaced atomically.

use std::io::{self, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::error::{BuildError, Result};
use crate::node::ExporterResponse;

/// Expand base64+JSON values of an exporter response.
pub fn decode_exporter_response(response: &ExporterResponse) -> Map<String, Value> {
    response
        .iter()
        .map(|(key, raw)| (key.clone(), decode_value(raw)))
        .collect()
}

fn decode_value(raw: &str) -> Value {
    let Ok(bytes) = STANDARD.decode(raw) else {
        return Value::String(raw.to_string());
    };
    match serde_json::from_slice::<Map<String, Value>>(&bytes) {
        Ok(obj) if !obj.is_empty() => Value::Object(obj),
        _ => Value::String(raw.to_string()),
    }
}

/// Write the decoded `response` to `path` as indented JSON.
pub fn write_metadata_file(path: &Path, response: &ExporterResponse) -> Result<()> {
    let doc = Value::Object(decode_exporter_response(response));
    let bytes = serde_json::to_vec_pretty(&doc)?;
    atomic_write(path, &bytes).map_err(|source| BuildError::Persistence {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `path` with `data` via a temp file in the same directory.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    atomic_write_with(path, |f| f.write_all(data))
}

fn atomic_write_with<F>(path: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut NamedTempFile) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    // an early return drops tmp, which removes it
    fill(&mut tmp)?;
    tmp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoded(v: &Value) -> String {
        STANDARD.encode(serde_json::to_vec(v).unwrap())
    }

    #[test]
    fn test_decode_expands_json_objects_only() {
        let descriptor = json!({"mediaType": "application/vnd.oci.image.index.v1+json", "size": 481});
        let mut resp = ExporterResponse::new();
        resp.insert("containerimage.descriptor".to_string(), encoded(&descriptor));
        resp.insert("containerimage.digest".to_string(), "sha256:abc".to_string());
        resp.insert("empty".to_string(), encoded(&json!({})));
        resp.insert("list".to_string(), encoded(&json!([1, 2])));

        let doc = decode_exporter_response(&resp);
        assert_eq!(doc["containerimage.descriptor"], descriptor);
        assert_eq!(doc["containerimage.digest"], "sha256:abc");
        assert_eq!(doc["empty"], Value::String(resp["empty"].clone()));
        assert_eq!(doc["list"], Value::String(resp["list"].clone()));
    }

    #[test]
    fn test_redecoding_is_stable() {
        let nested = json!({"a": {"b": [1, 2, 3]}, "c": "d"});
        let mut resp = ExporterResponse::new();
        resp.insert("k".to_string(), encoded(&nested));
        let first = decode_exporter_response(&resp);

        let mut again = ExporterResponse::new();
        again.insert("k".to_string(), encoded(&first["k"]));
        assert_eq!(decode_exporter_response(&again)["k"], nested);
    }

    #[test]
    fn test_write_metadata_file_is_indented_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let mut resp = ExporterResponse::new();
        resp.insert("image.name".to_string(), "example.com/app:1".to_string());
        write_metadata_file(&path, &resp).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"image.name\""));
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["image.name"], "example.com/app:1");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
        }
    }

    #[test]
    fn test_interrupted_write_keeps_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        std::fs::write(&path, b"{\"old\": true}").unwrap();

        let err = atomic_write_with(&path, |f| {
            f.write_all(b"{\"new\": tr")?;
            Err(io::Error::new(io::ErrorKind::Interrupted, "killed"))
        })
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"old\": true}");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_interrupted_first_write_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        let _ = atomic_write_with(&path, |_| Err(io::Error::other("killed")));
        assert!(!path.exists());
    }

    #[test]
    fn test_persistence_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("meta.json");
        let err = write_metadata_file(&path, &ExporterResponse::new()).unwrap_err();
        assert!(matches!(err, BuildError::Persistence { .. }));
        assert!(err.to_string().contains("missing"));
    }
}
