use std::fmt;
use std::time::Duration;

use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, RANGE};
use serde::Deserialize;

use crate::credentials::{CredentialError, GoogleAuth};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const LIST_PAGE_SIZE: u32 = 100;
const LIST_TIMEOUT_SECS: u64 = 60;
/// Matches the chunk size of Google's own media downloader.
pub const DOWNLOAD_CHUNK_BYTES: u64 = 100 * 1024 * 1024;
const DOWNLOAD_CHUNK_TIMEOUT_SECS: u64 = 10 * 60;

/// Errors that can occur while talking to the Drive API.
#[derive(Debug)]
pub enum DriveError {
    Http(reqwest::Error),
    Auth(CredentialError),
    UnexpectedStatus { status: StatusCode, body: String },
    InvalidResponse(String),
}

impl fmt::Display for DriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveError::Http(err) => write!(f, "http error: {err}"),
            DriveError::Auth(err) => write!(f, "authorization error: {err}"),
            DriveError::UnexpectedStatus { status, body } => {
                write!(f, "unexpected status {status}: {body}")
            }
            DriveError::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
        }
    }
}

impl std::error::Error for DriveError {}

impl From<reqwest::Error> for DriveError {
    fn from(value: reqwest::Error) -> Self {
        DriveError::Http(value)
    }
}

impl From<CredentialError> for DriveError {
    fn from(value: CredentialError) -> Self {
        DriveError::Auth(value)
    }
}

impl DriveError {
    /// Failures that will hit every following request too.
    pub fn is_auth(&self) -> bool {
        matches!(self, DriveError::Auth(_))
            || matches!(
                self,
                DriveError::UnexpectedStatus { status, .. } if *status == StatusCode::UNAUTHORIZED
            )
    }

    /// Failures a later attempt may not hit: transport errors, server errors
    /// and rate limiting. Other 4xx answers and malformed transfers repeat.
    pub fn is_transient(&self) -> bool {
        match self {
            DriveError::Http(_) => true,
            DriveError::UnexpectedStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            DriveError::Auth(_) | DriveError::InvalidResponse(_) => false,
        }
    }
}

/// An image file living in the watched folder.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteImage {
    pub id: String,
    pub name: String,
}

/// Source of images to inspect.
pub trait ImageStore {
    /// All image entries directly inside `folder_id`.
    fn list_images(&self, folder_id: &str) -> Result<Vec<RemoteImage>, DriveError>;

    /// Full content of one entry.
    fn download(&self, id: &str) -> Result<Vec<u8>, DriveError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListPage {
    #[serde(default)]
    files: Vec<RemoteImage>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Blocking Drive v3 client bound to an authorized Google session.
#[derive(Debug)]
pub struct DriveClient {
    base_url: String,
    http: Client,
    auth: GoogleAuth,
}

impl DriveClient {
    pub fn new(auth: GoogleAuth) -> Result<Self, DriveError> {
        Self::with_base_url(DRIVE_API_BASE, auth)
    }

    pub fn with_base_url(base_url: impl Into<String>, auth: GoogleAuth) -> Result<Self, DriveError> {
        let http = Client::builder().build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            auth,
        })
    }

    fn list_page(&self, query: &str, page_token: Option<&str>) -> Result<FileListPage, DriveError> {
        let url = format!("{}/files", self.base_url);
        let page_size = LIST_PAGE_SIZE.to_string();
        let mut params = vec![
            ("q", query),
            ("fields", "nextPageToken, files(id, name)"),
            ("pageSize", page_size.as_str()),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let request = self
            .http
            .get(url)
            .query(&params)
            .timeout(Duration::from_secs(LIST_TIMEOUT_SECS));
        let response = Self::check(self.send(request)?)?;
        response.json().map_err(DriveError::from)
    }

    /// Unchecked, so the caller can tell an empty file's 416 from a failure.
    fn download_chunk(&self, id: &str, start: u64) -> Result<Response, DriveError> {
        let url = format!("{}/files/{}", self.base_url, id);
        let end = start + DOWNLOAD_CHUNK_BYTES - 1;
        let request = self
            .http
            .get(url)
            .query(&[("alt", "media"), ("supportsAllDrives", "true")])
            .header(RANGE, format!("bytes={start}-{end}"))
            .timeout(Duration::from_secs(DOWNLOAD_CHUNK_TIMEOUT_SECS));
        self.send(request)
    }

    /// Sends with the current bearer token. A 401 on a token we believed valid
    /// gets one forced refresh and one resend.
    fn send(&self, request: RequestBuilder) -> Result<Response, DriveError> {
        let retry = request.try_clone();
        let token = self.auth.access_token()?;
        let response = authorized(request, &token).send()?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(retry) = retry else {
            return Ok(response);
        };

        warn!("Drive rejected the access token, refreshing");
        let token = self.auth.force_refresh()?;
        Ok(authorized(retry, &token).send()?)
    }

    fn check(response: Response) -> Result<Response, DriveError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().unwrap_or_default();
        Err(DriveError::UnexpectedStatus { status, body })
    }
}

fn authorized(request: RequestBuilder, token: &str) -> RequestBuilder {
    request.header(AUTHORIZATION, format!("Bearer {token}"))
}

impl ImageStore for DriveClient {
    fn list_images(&self, folder_id: &str) -> Result<Vec<RemoteImage>, DriveError> {
        let query = folder_image_query(folder_id);
        let mut images = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self.list_page(&query, page_token.as_deref())?;
            images.extend(page.files);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        debug!("Listed {} images in folder {}", images.len(), folder_id);
        Ok(images)
    }

    fn download(&self, id: &str) -> Result<Vec<u8>, DriveError> {
        let mut buffer = Vec::new();
        loop {
            let response = self.download_chunk(id, buffer.len() as u64)?;
            let range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);

            // Asking for byte 0 of an empty file is unsatisfiable.
            if response.status() == StatusCode::RANGE_NOT_SATISFIABLE
                && range.as_deref().and_then(unsatisfied_length) == Some(buffer.len() as u64)
            {
                break;
            }

            let response = Self::check(response)?;
            let partial = response.status() == StatusCode::PARTIAL_CONTENT;
            let chunk = response.bytes()?;
            buffer.extend_from_slice(&chunk);

            // A plain 200 carries the whole file.
            if !partial {
                break;
            }
            let range = range.ok_or_else(|| {
                DriveError::InvalidResponse("partial content without Content-Range".into())
            })?;
            let range = ContentRange::parse(&range).ok_or_else(|| {
                DriveError::InvalidResponse(format!("unparsable Content-Range `{range}`"))
            })?;
            if range.is_complete() {
                break;
            }
            if chunk.is_empty() {
                return Err(DriveError::InvalidResponse(
                    "download stalled before the reported size".into(),
                ));
            }
            debug!(
                "Downloaded {}/{} bytes of {}",
                buffer.len(),
                range.total.map_or_else(|| "?".into(), |t| t.to_string()),
                id
            );
        }
        Ok(buffer)
    }
}

/// Drive search expression for images directly inside `folder_id`.
pub fn folder_image_query(folder_id: &str) -> String {
    let escaped = folder_id.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}' in parents and mimeType contains 'image/' and trashed = false")
}

/// Total length from the `bytes */<total>` form sent with a 416.
fn unsatisfied_length(value: &str) -> Option<u64> {
    value.trim().strip_prefix("bytes */")?.trim().parse().ok()
}

/// `Content-Range: bytes <first>-<last>/<total>` from a ranged media response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContentRange {
    last: u64,
    total: Option<u64>,
}

impl ContentRange {
    fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes ")?;
        let (span, total) = rest.split_once('/')?;
        let (_, last) = span.split_once('-')?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse().ok()?),
        };
        Some(Self {
            last: last.trim().parse().ok()?,
            total,
        })
    }

    /// Unknown totals end the transfer once the current chunk arrives.
    fn is_complete(&self) -> bool {
        self.total.is_none_or(|total| self.last + 1 >= total)
    }
}
