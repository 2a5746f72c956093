//! Radiograph files and detection overlays.
//!
//! Image bytes live behind [`RadiographStore`]; the database only keeps
//! metadata and the content hash used as storage key.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ApiError;
use crate::odontogram::Tooth;

pub const MAX_DETECTIONS: usize = 500;
const MAX_LABEL_LEN: usize = 64;
const MAX_FILE_NAME_LEN: usize = 200;

pub const CONTENT_TYPE_PNG: &str = "image/png";
pub const CONTENT_TYPE_JPEG: &str = "image/jpeg";
pub const CONTENT_TYPE_DICOM: &str = "application/dicom";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object {0} not found")]
    NotFound(String),
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RadiographError {
    #[error("uploaded file is empty")]
    EmptyFile,
    #[error("file exceeds the {limit} byte upload limit")]
    TooLarge { limit: usize },
    #[error("unsupported content type {0:?}; expected PNG, JPEG or DICOM")]
    UnsupportedType(String),
    #[error("at most {MAX_DETECTIONS} detections per radiograph")]
    TooManyDetections,
    #[error("detection #{index}: {reason}")]
    InvalidDetection { index: usize, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RadiographError> for ApiError {
    fn from(e: RadiographError) -> Self {
        match e {
            RadiographError::TooLarge { .. } => ApiError::PayloadTooLarge(e.to_string()),
            RadiographError::UnsupportedType(_) => {
                ApiError::BadRequest("UNSUPPORTED_MEDIA_TYPE", e.to_string())
            }
            RadiographError::Store(StoreError::NotFound(_)) => {
                ApiError::NotFound("FILE_NOT_FOUND", e.to_string())
            }
            RadiographError::Store(_) => {
                tracing::error!(error = %e, "radiograph store failure");
                ApiError::Internal(e.to_string())
            }
            _ => ApiError::validation(e.to_string()),
        }
    }
}

/* -------------------------
   Kinds + sources
--------------------------*/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RadiographKind {
    Periapical,
    Bitewing,
    Panoramic,
    Cephalometric,
    Occlusal,
    Other,
}

impl RadiographKind {
    pub const ALL: [RadiographKind; 6] = [
        RadiographKind::Periapical,
        RadiographKind::Bitewing,
        RadiographKind::Panoramic,
        RadiographKind::Cephalometric,
        RadiographKind::Occlusal,
        RadiographKind::Other,
    ];

    pub fn code(self) -> i16 {
        match self {
            RadiographKind::Periapical => 0,
            RadiographKind::Bitewing => 1,
            RadiographKind::Panoramic => 2,
            RadiographKind::Cephalometric => 3,
            RadiographKind::Occlusal => 4,
            RadiographKind::Other => 5,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        RadiographKind::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase())).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Model,
    Manual,
}

impl DetectionSource {
    pub fn code(self) -> i16 {
        match self {
            DetectionSource::Model => 0,
            DetectionSource::Manual => 1,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(DetectionSource::Model),
            1 => Some(DetectionSource::Manual),
            _ => None,
        }
    }
}

/* -------------------------
   Upload validation
--------------------------*/

fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(CONTENT_TYPE_PNG)
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(CONTENT_TYPE_JPEG)
    } else if bytes.len() >= 132 && &bytes[128..132] == b"DICM" {
        Some(CONTENT_TYPE_DICOM)
    } else {
        None
    }
}

/// Decide the stored content type. Magic bytes win over the declared
/// header; a declared supported type is accepted when sniffing is
/// inconclusive (e.g. DICOM streams without preamble).
pub fn resolve_content_type(
    declared: Option<&str>,
    bytes: &[u8],
) -> Result<&'static str, RadiographError> {
    if let Some(sniffed) = sniff_content_type(bytes) {
        return Ok(sniffed);
    }
    let declared = declared
        .map(|d| d.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
        .unwrap_or_default();
    match declared.as_str() {
        CONTENT_TYPE_PNG => Ok(CONTENT_TYPE_PNG),
        CONTENT_TYPE_JPEG | "image/jpg" => Ok(CONTENT_TYPE_JPEG),
        CONTENT_TYPE_DICOM => Ok(CONTENT_TYPE_DICOM),
        "" => Err(RadiographError::UnsupportedType("unknown".into())),
        other => Err(RadiographError::UnsupportedType(other.to_string())),
    }
}

pub fn check_size(len: usize, limit: usize) -> Result<(), RadiographError> {
    if len == 0 {
        return Err(RadiographError::EmptyFile);
    }
    if len > limit {
        return Err(RadiographError::TooLarge { limit });
    }
    Ok(())
}

/// Keep only the final path component of a client-supplied name, without
/// control characters, bounded in length.
pub fn sanitize_file_name(raw: Option<&str>) -> String {
    let base = raw
        .unwrap_or("")
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_FILE_NAME_LEN)
        .collect::<String>();
    let base = base.trim();
    if base.is_empty() || base == "." || base == ".." {
        "radiograph".to_string()
    } else {
        base.to_string()
    }
}

/* -------------------------
   Detections
--------------------------*/

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionInput {
    pub label: String,
    pub confidence: f64,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub tooth: Option<i16>,
}

/// Boxes are normalized to the image: origin top-left, all edges in [0, 1].
pub fn validate_detections(items: &[DetectionInput]) -> Result<(), RadiographError> {
    if items.len() > MAX_DETECTIONS {
        return Err(RadiographError::TooManyDetections);
    }
    for (index, d) in items.iter().enumerate() {
        let fail = |reason: &str| RadiographError::InvalidDetection {
            index,
            reason: reason.to_string(),
        };
        let label = d.label.trim();
        if label.is_empty() || label.chars().count() > MAX_LABEL_LEN {
            return Err(fail("label must be 1..64 characters"));
        }
        let values = [d.confidence, d.x, d.y, d.w, d.h];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(fail("values must be finite numbers"));
        }
        if !(0.0..=1.0).contains(&d.confidence) {
            return Err(fail("confidence must be within [0, 1]"));
        }
        if d.x < 0.0 || d.y < 0.0 || d.w <= 0.0 || d.h <= 0.0 {
            return Err(fail("box origin must be >= 0 and size > 0"));
        }
        if d.x + d.w > 1.0 + f64::EPSILON || d.y + d.h > 1.0 + f64::EPSILON {
            return Err(fail("box must lie inside the image"));
        }
        if let Some(t) = d.tooth {
            Tooth::new(t).map_err(|e| fail(&e.to_string()))?;
        }
    }
    Ok(())
}

/* -------------------------
   Storage
--------------------------*/

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub sha256: String,
    pub size_bytes: i64,
}

#[async_trait]
pub trait RadiographStore: Send + Sync {
    /// Store bytes under their content hash. Storing the same bytes twice
    /// yields the same key.
    async fn put(&self, bytes: &[u8]) -> Result<StoredObject, StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Missing objects are not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Content-addressed files under `root/<first two hex chars>/<sha256>`.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_for(sha256: &str) -> String {
        format!("{}/{}", &sha256[..2], sha256)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let valid = key.len() == 67
            && key.as_bytes()[2] == b'/'
            && key
                .chars()
                .enumerate()
                .all(|(i, c)| i == 2 || c.is_ascii_hexdigit())
            && key[..2] == key[3..5];
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(&key[..2]).join(&key[3..]))
    }
}

#[async_trait]
impl RadiographStore for LocalFileStore {
    async fn put(&self, bytes: &[u8]) -> Result<StoredObject, StoreError> {
        let sha256 = hex::encode(Sha256::digest(bytes));
        let key = Self::key_for(&sha256);
        let path = self.path_for(&key)?;
        let object = StoredObject {
            key,
            sha256,
            size_bytes: bytes.len() as i64,
        };

        if tokio::fs::try_exists(&path).await? {
            return Ok(object);
        }
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tracing::debug!(key = %object.key, size = object.size_bytes, "stored radiograph");
        Ok(object)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn det(x: f64, y: f64, w: f64, h: f64) -> DetectionInput {
        DetectionInput {
            label: "caries".into(),
            confidence: 0.8,
            x,
            y,
            w,
            h,
            tooth: Some(36),
        }
    }

    #[test]
    fn magic_bytes_beat_declared_type() {
        assert_eq!(
            resolve_content_type(Some("application/octet-stream"), PNG_HEADER).unwrap(),
            CONTENT_TYPE_PNG
        );
        assert_eq!(
            resolve_content_type(Some("image/png"), &[0xFF, 0xD8, 0xFF, 0xE0]).unwrap(),
            CONTENT_TYPE_JPEG
        );
        let mut dicom = vec![0u8; 128];
        dicom.extend_from_slice(b"DICM");
        assert_eq!(resolve_content_type(None, &dicom).unwrap(), CONTENT_TYPE_DICOM);
    }

    #[test]
    fn declared_type_is_used_when_sniffing_fails() {
        assert_eq!(
            resolve_content_type(Some("application/dicom; charset=binary"), b"raw").unwrap(),
            CONTENT_TYPE_DICOM
        );
        assert_eq!(resolve_content_type(Some("image/JPG"), b"??").unwrap(), CONTENT_TYPE_JPEG);
        assert!(matches!(
            resolve_content_type(Some("application/pdf"), b"%PDF-1.7"),
            Err(RadiographError::UnsupportedType(t)) if t == "application/pdf"
        ));
        assert!(resolve_content_type(None, b"plain").is_err());
    }

    #[test]
    fn size_limits() {
        assert!(matches!(check_size(0, 10), Err(RadiographError::EmptyFile)));
        assert!(matches!(check_size(11, 10), Err(RadiographError::TooLarge { limit: 10 })));
        assert!(check_size(10, 10).is_ok());
    }

    #[test]
    fn file_names_lose_their_directories() {
        assert_eq!(sanitize_file_name(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_file_name(Some("C:\\scans\\pano.png")), "pano.png");
        assert_eq!(sanitize_file_name(Some("bad\u{0}name.png")), "badname.png");
        assert_eq!(sanitize_file_name(Some("..")), "radiograph");
        assert_eq!(sanitize_file_name(None), "radiograph");
    }

    #[test]
    fn kinds_parse_case_insensitively() {
        assert_eq!(RadiographKind::parse("Panoramic"), Some(RadiographKind::Panoramic));
        assert_eq!(RadiographKind::parse("mri"), None);
        for k in RadiographKind::ALL {
            assert_eq!(RadiographKind::from_code(k.code()), Some(k));
        }
    }

    #[test]
    fn detection_boxes_must_fit_the_image() {
        assert!(validate_detections(&[det(0.0, 0.0, 1.0, 1.0), det(0.5, 0.25, 0.25, 0.5)]).is_ok());

        let err = validate_detections(&[det(0.1, 0.1, 0.1, 0.1), det(0.8, 0.1, 0.3, 0.1)]).unwrap_err();
        assert!(matches!(err, RadiographError::InvalidDetection { index: 1, .. }));

        assert!(validate_detections(&[det(0.1, 0.1, 0.0, 0.1)]).is_err());
        assert!(validate_detections(&[det(-0.1, 0.1, 0.1, 0.1)]).is_err());
        assert!(validate_detections(&[det(f64::NAN, 0.1, 0.1, 0.1)]).is_err());
    }

    #[test]
    fn detection_confidence_label_and_tooth_are_checked() {
        let mut d = det(0.1, 0.1, 0.1, 0.1);
        d.confidence = 1.5;
        assert!(validate_detections(&[d]).is_err());

        let mut d = det(0.1, 0.1, 0.1, 0.1);
        d.label = "   ".into();
        assert!(validate_detections(&[d]).is_err());

        let mut d = det(0.1, 0.1, 0.1, 0.1);
        d.tooth = Some(19);
        assert!(validate_detections(&[d]).is_err());

        let many = vec![det(0.1, 0.1, 0.1, 0.1); MAX_DETECTIONS + 1];
        assert!(matches!(validate_detections(&many), Err(RadiographError::TooManyDetections)));
    }

    #[tokio::test]
    async fn local_store_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());

        let a = store.put(PNG_HEADER).await.unwrap();
        let b = store.put(PNG_HEADER).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.size_bytes, PNG_HEADER.len() as i64);
        assert_eq!(&a.key[..2], &a.sha256[..2]);
        assert!(dir.path().join(&a.key[..2]).join(&a.sha256).exists());

        assert_eq!(store.get(&a.key).await.unwrap(), PNG_HEADER);
    }

    #[tokio::test]
    async fn local_store_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        let obj = store.put(b"bytes").await.unwrap();

        store.delete(&obj.key).await.unwrap();
        store.delete(&obj.key).await.unwrap();
        assert!(matches!(store.get(&obj.key).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn local_store_rejects_path_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(matches!(store.get("../../etc/passwd").await, Err(StoreError::InvalidKey(_))));
        let bogus = format!("zz/{}", "a".repeat(64));
        assert!(matches!(store.delete(&bogus).await, Err(StoreError::InvalidKey(_))));
    }
}
