use std::fmt;
use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Fixed buffer size for the streaming download reader.
const DOWNLOAD_BUFFER_SIZE: usize = 1024 * 1024;

/// Typed error carrying the integer status code and decoded payload.
/// `message` falls back to the first 2000 characters of the raw body when
/// it isn't valid JSON.
#[derive(Debug)]
pub struct ApiError {
    pub status_code: u16,
    pub payload: serde_json::Value,
}

impl ApiError {
    /// True when this status code should trigger adaptive chunk halving
    /// during upload.
    pub fn is_transient_upload_error(&self) -> bool {
        matches!(self.status_code, 408 | 413 | 500 | 502 | 503 | 504)
    }

    fn message(&self) -> String {
        self.payload
            .get("message")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.payload.to_string())
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "APIError {}: {}", self.status_code, self.message())
    }
}

impl std::error::Error for ApiError {}

/// A single page of the remote change log.
#[derive(Debug, Deserialize)]
pub struct ChangesPage {
    pub changes: Vec<RemoteChange>,
}

/// Tagged change variant, decoded explicitly from the wire's flat
/// `action`-discriminated JSON rather than passed around as a loose map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    Upsert {
        change_id: i64,
        rel_path: String,
        rev: i64,
        size: i64,
        mtime: i64,
        crc32: u32,
        device_id: Option<String>,
    },
    Delete {
        change_id: i64,
        rel_path: String,
        rev: i64,
        deleted_size: Option<i64>,
        deleted_crc32: Option<u32>,
        device_id: Option<String>,
    },
    /// An action this client doesn't recognize, or a change missing
    /// `rel_path`; these are skipped by the pull loop.
    Unknown { change_id: i64 },
}

impl RemoteChange {
    pub fn change_id(&self) -> i64 {
        match self {
            RemoteChange::Upsert { change_id, .. }
            | RemoteChange::Delete { change_id, .. }
            | RemoteChange::Unknown { change_id } => *change_id,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            RemoteChange::Upsert { device_id, .. } | RemoteChange::Delete { device_id, .. } => {
                device_id.as_deref()
            }
            RemoteChange::Unknown { .. } => None,
        }
    }

    pub fn rel_path(&self) -> Option<&str> {
        match self {
            RemoteChange::Upsert { rel_path, .. } | RemoteChange::Delete { rel_path, .. } => {
                Some(rel_path.as_str())
            }
            RemoteChange::Unknown { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawChange {
    change_id: i64,
    action: Option<String>,
    rel_path: Option<String>,
    #[serde(default)]
    rev: i64,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    mtime: i64,
    #[serde(default, deserialize_with = "de_crc32_opt")]
    crc32: Option<u32>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    deleted_size: Option<i64>,
    #[serde(default, deserialize_with = "de_crc32_opt")]
    deleted_crc32: Option<u32>,
}

impl<'de> Deserialize<'de> for RemoteChange {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawChange::deserialize(deserializer)?;
        let Some(rel_path) = raw.rel_path else {
            return Ok(RemoteChange::Unknown {
                change_id: raw.change_id,
            });
        };
        match raw.action.as_deref() {
            Some("upsert") => Ok(RemoteChange::Upsert {
                change_id: raw.change_id,
                rel_path,
                rev: raw.rev,
                size: raw.size,
                mtime: raw.mtime,
                crc32: raw.crc32.unwrap_or(0),
                device_id: raw.device_id,
            }),
            Some("delete") => Ok(RemoteChange::Delete {
                change_id: raw.change_id,
                rel_path,
                rev: raw.rev,
                deleted_size: raw.deleted_size,
                deleted_crc32: raw.deleted_crc32,
                device_id: raw.device_id,
            }),
            _ => Ok(RemoteChange::Unknown {
                change_id: raw.change_id,
            }),
        }
    }
}

fn de_crc32_opt<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Num(u32),
        Null,
    }
    match Option::<StrOrNum>::deserialize(deserializer)? {
        None | Some(StrOrNum::Null) => Ok(None),
        Some(StrOrNum::Num(n)) => Ok(Some(n)),
        Some(StrOrNum::Str(s)) => s
            .parse::<u32>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// CRC32 values are transmitted as decimal strings on the wire, avoiding
/// integer-size ambiguity in JSON.
pub fn serialize_crc32<S: Serializer>(v: &u32, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&v.to_string())
}

#[derive(Debug, Serialize)]
pub struct UploadInitRequest<'a> {
    pub rel_path: &'a str,
    pub size: i64,
    pub mtime: i64,
    #[serde(serialize_with = "serialize_crc32")]
    pub crc32: u32,
    pub base_rev: i64,
    pub device_id: &'a str,
    pub device_label: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct UploadInitResponse {
    pub upload_id: String,
    /// The path the server has decided this upload will land at if finalized,
    /// when it differs from the requested `rel_path` (an early signal of the
    /// conflict rename `upload_finalize` will confirm). `None` when the
    /// server omits the field or it equals the requested path.
    #[serde(default)]
    pub decided_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UploadFinalizeResponse {
    pub rel_path: String,
    pub rev: i64,
}

/// The engine's view of the remote API. A trait so tests can inject a fake
/// that replays scripted changes and records calls.
pub trait WpDriveApi: Send + Sync {
    fn changes(&self, since: i64, limit: i64) -> Result<ChangesPage>;

    fn upload_init(
        &self,
        rel_path: &str,
        size: i64,
        mtime: i64,
        crc32: u32,
        base_rev: i64,
        device_id: &str,
        device_label: &str,
    ) -> Result<UploadInitResponse>;

    fn upload_chunk(&self, upload_id: &str, offset: i64, bytes: &[u8]) -> Result<()>;

    fn upload_finalize(&self, upload_id: &str) -> Result<UploadFinalizeResponse>;

    fn delete(&self, rel_path: &str, device_id: &str) -> Result<()>;

    /// Streams remote content for `rel_path` into `sink`, writing through a
    /// fixed 1 MiB buffer.
    fn download_stream(&self, rel_path: &str, sink: &mut dyn Write) -> Result<()>;
}

/// Production implementation over HTTP Basic auth.
pub struct HttpWpDriveApi {
    base: String,
    user: String,
    app_password: String,
    http: Client,
}

impl HttpWpDriveApi {
    pub fn new(url: &str, user: &str, app_password: &str, timeout_seconds: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("build http client")?;
        Ok(Self {
            base: format!("{}/wp-json/wpdrive/v1", url.trim_end_matches('/')),
            user: user.to_string(),
            app_password: app_password.to_string(),
            http,
        })
    }

    fn req(&self, builder: reqwest::blocking::RequestBuilder) -> Result<Response> {
        builder
            .basic_auth(&self.user, Some(&self.app_password))
            .send()
            .context("send request")
    }

    fn check_status(resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.as_u16() >= 400 {
            let payload = decode_error_payload(resp);
            return Err(ApiError {
                status_code: status.as_u16(),
                payload,
            }
            .into());
        }
        Ok(resp)
    }
}

fn decode_error_payload(resp: Response) -> serde_json::Value {
    let text = resp.text().unwrap_or_default();
    serde_json::from_str(&text).unwrap_or_else(|_| {
        let truncated: String = text.chars().take(2000).collect();
        serde_json::json!({ "message": truncated })
    })
}

impl WpDriveApi for HttpWpDriveApi {
    fn changes(&self, since: i64, limit: i64) -> Result<ChangesPage> {
        let url = format!("{}/changes", self.base);
        let resp = self.req(
            self.http
                .get(url)
                .query(&[("since", since), ("limit", limit)]),
        )?;
        let resp = Self::check_status(resp)?;
        resp.json::<ChangesPage>().context("decode changes page")
    }

    fn upload_init(
        &self,
        rel_path: &str,
        size: i64,
        mtime: i64,
        crc32: u32,
        base_rev: i64,
        device_id: &str,
        device_label: &str,
    ) -> Result<UploadInitResponse> {
        let url = format!("{}/upload/init", self.base);
        let body = UploadInitRequest {
            rel_path,
            size,
            mtime,
            crc32,
            base_rev,
            device_id,
            device_label,
        };
        let resp = self.req(self.http.post(url).json(&body))?;
        let resp = Self::check_status(resp)?;
        resp.json::<UploadInitResponse>().context("decode upload_init")
    }

    fn upload_chunk(&self, upload_id: &str, offset: i64, bytes: &[u8]) -> Result<()> {
        let url = format!("{}/upload/chunk", self.base);
        let resp = self.req(
            self.http
                .post(url)
                .query(&[("upload_id", upload_id), ("offset", &offset.to_string())])
                .header("Content-Type", "application/octet-stream")
                .body(bytes.to_vec()),
        )?;
        Self::check_status(resp)?;
        Ok(())
    }

    fn upload_finalize(&self, upload_id: &str) -> Result<UploadFinalizeResponse> {
        let url = format!("{}/upload/finalize", self.base);
        let resp = self.req(
            self.http
                .post(url)
                .json(&serde_json::json!({ "upload_id": upload_id })),
        )?;
        let resp = Self::check_status(resp)?;
        resp.json::<UploadFinalizeResponse>()
            .context("decode upload_finalize")
    }

    fn delete(&self, rel_path: &str, device_id: &str) -> Result<()> {
        let url = format!("{}/delete", self.base);
        let resp = self.req(
            self.http
                .post(url)
                .json(&serde_json::json!({ "rel_path": rel_path, "device_id": device_id })),
        )?;
        Self::check_status(resp)?;
        Ok(())
    }

    fn download_stream(&self, rel_path: &str, sink: &mut dyn Write) -> Result<()> {
        let url = format!("{}/download", self.base);
        let mut resp = self.req(self.http.get(url).query(&[("path", rel_path)]))?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            let payload = decode_error_payload(resp);
            return Err(ApiError {
                status_code: status.as_u16(),
                payload,
            }
            .into());
        }
        let mut buf = vec![0u8; DOWNLOAD_BUFFER_SIZE];
        loop {
            use std::io::Read;
            let n = resp.read(&mut buf).context("read download stream")?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n]).context("write download chunk")?;
        }
        Ok(())
    }
}
