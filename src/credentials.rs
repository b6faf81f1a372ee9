//! Google OAuth credentials for the Drive client.
//!
//! Tokens are persisted in the "authorized user" JSON layout the Google client
//! libraries write, so an existing `token.json` keeps working. When no usable
//! token is on disk an installed-app consent flow runs against a loopback
//! redirect, protected with PKCE and a random `state`.

use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
/// Refresh this long before the provider's expiry to avoid racing it.
const EXPIRY_SKEW_SECS: i64 = 60;
const HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug)]
pub enum CredentialError {
    Io(io::Error),
    TokenFile(String),
    MissingClientSecrets(PathBuf),
    InvalidClientSecrets(String),
    ConsentDenied(String),
    StateMismatch,
    Redirect(String),
    NoRefreshToken,
    Http(reqwest::Error),
    TokenEndpoint { status: StatusCode, body: String },
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::Io(err) => write!(f, "filesystem error: {err}"),
            CredentialError::TokenFile(msg) => write!(f, "{msg}"),
            CredentialError::MissingClientSecrets(path) => write!(
                f,
                "OAuth client secrets not found at {}. Download them from the Google Cloud console.",
                path.display()
            ),
            CredentialError::InvalidClientSecrets(msg) => {
                write!(f, "invalid OAuth client secrets: {msg}")
            }
            CredentialError::ConsentDenied(reason) => {
                write!(f, "authorization was not granted: {reason}")
            }
            CredentialError::StateMismatch => {
                write!(f, "authorization response did not match the request state")
            }
            CredentialError::Redirect(msg) => write!(f, "bad authorization redirect: {msg}"),
            CredentialError::NoRefreshToken => {
                write!(f, "access token expired and no refresh token is stored")
            }
            CredentialError::Http(err) => write!(f, "http error: {err}"),
            CredentialError::TokenEndpoint { status, body } => {
                write!(f, "token endpoint returned {status}: {body}")
            }
        }
    }
}

impl std::error::Error for CredentialError {}

impl From<io::Error> for CredentialError {
    fn from(value: io::Error) -> Self {
        CredentialError::Io(value)
    }
}

impl From<reqwest::Error> for CredentialError {
    fn from(value: reqwest::Error) -> Self {
        CredentialError::Http(value)
    }
}

/// OAuth client registration, read from the `installed` (or `web`) section of
/// the client secrets file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ClientSecrets {
    pub fn load(path: &Path) -> Result<Self, CredentialError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CredentialError::MissingClientSecrets(path.to_path_buf()));
            }
            Err(err) => return Err(CredentialError::from(err)),
        };
        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, CredentialError> {
        let file: ClientSecretsFile = serde_json::from_str(contents)
            .map_err(|err| CredentialError::InvalidClientSecrets(err.to_string()))?;
        file.installed.or(file.web).ok_or_else(|| {
            CredentialError::InvalidClientSecrets(
                "expected an `installed` or `web` client section".into(),
            )
        })
    }
}

/// Persisted OAuth token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl StoredToken {
    /// Tokens without a recorded expiry are treated as still valid.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry
            .is_some_and(|expiry| expiry - chrono::Duration::seconds(EXPIRY_SKEW_SECS) <= now)
    }

    fn covers_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == scope)
    }

    fn apply(&mut self, response: TokenResponse, now: DateTime<Utc>) {
        self.token = response.access_token;
        self.expiry = response
            .expires_in
            .map(|secs| now + chrono::Duration::seconds(secs));
        if response.refresh_token.is_some() {
            self.refresh_token = response.refresh_token;
        }
        if let Some(scope) = response.scope {
            self.scopes = scope.split_whitespace().map(str::to_owned).collect();
        }
    }

    fn load(path: &Path) -> Result<Option<Self>, CredentialError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CredentialError::from(err)),
        };
        serde_json::from_str(&contents).map(Some).map_err(|err| {
            CredentialError::TokenFile(format!(
                "failed to parse token file {}: {err}",
                path.display()
            ))
        })
    }

    fn save(&self, path: &Path) -> Result<(), CredentialError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_string_pretty(self).map_err(|err| {
            CredentialError::TokenFile(format!(
                "failed to serialize token for {}: {err}",
                path.display()
            ))
        })?;
        fs::write(path, payload).map_err(CredentialError::from)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Authorized session: hands out bearer tokens and refreshes them on expiry.
#[derive(Debug)]
pub struct GoogleAuth {
    http: Client,
    token: Mutex<StoredToken>,
    token_path: PathBuf,
}

impl GoogleAuth {
    pub(crate) fn new(http: Client, token: StoredToken, token_path: PathBuf) -> Self {
        Self {
            http,
            token: Mutex::new(token),
            token_path,
        }
    }

    /// Returns a bearer token that is valid for at least the refresh skew.
    pub fn access_token(&self) -> Result<String, CredentialError> {
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_expired(Utc::now()) {
            debug!("Access token expired, refreshing");
            self.refresh_and_persist(&mut token)?;
        }
        Ok(token.token.clone())
    }

    /// Refreshes even if the recorded expiry says the token is still good.
    /// For tokens the API has just rejected.
    pub fn force_refresh(&self) -> Result<String, CredentialError> {
        let mut token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        self.refresh_and_persist(&mut token)?;
        Ok(token.token.clone())
    }

    fn refresh_and_persist(&self, token: &mut StoredToken) -> Result<(), CredentialError> {
        refresh(&self.http, token)?;
        if let Err(err) = token.save(&self.token_path) {
            warn!("Refreshed token could not be persisted: {err}");
        }
        Ok(())
    }
}

/// Loads the persisted token, refreshing or re-consenting as needed.
pub fn authorize(token_path: &Path, secrets_path: &Path) -> Result<GoogleAuth, CredentialError> {
    let http = Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()?;

    match StoredToken::load(token_path) {
        Ok(Some(mut stored)) if stored.covers_scope(DRIVE_READONLY_SCOPE) => {
            if !stored.is_expired(Utc::now()) {
                info!("Using stored Google token from {}", token_path.display());
                return Ok(GoogleAuth::new(http, stored, token_path.to_path_buf()));
            }
            match refresh(&http, &mut stored) {
                Ok(()) => {
                    stored.save(token_path)?;
                    info!("Refreshed stored Google token");
                    return Ok(GoogleAuth::new(http, stored, token_path.to_path_buf()));
                }
                Err(err) => warn!("Stored token could not be refreshed ({err}), asking for consent"),
            }
        }
        Ok(Some(_)) => warn!("Stored token lacks Drive read access, asking for consent"),
        Ok(None) => info!("No stored Google token at {}", token_path.display()),
        Err(err) => warn!("{err}; asking for consent"),
    }

    let secrets = ClientSecrets::load(secrets_path)?;
    let stored = run_consent_flow(&http, &secrets)?;
    stored.save(token_path)?;
    info!("Saved Google token to {}", token_path.display());
    Ok(GoogleAuth::new(http, stored, token_path.to_path_buf()))
}

fn refresh(http: &Client, token: &mut StoredToken) -> Result<(), CredentialError> {
    let refresh_token = token
        .refresh_token
        .clone()
        .ok_or(CredentialError::NoRefreshToken)?;
    let params = [
        ("client_id", token.client_id.as_str()),
        ("client_secret", token.client_secret.as_str()),
        ("refresh_token", refresh_token.as_str()),
        ("grant_type", "refresh_token"),
    ];
    let response = request_token(http, &token.token_uri, &params)?;
    token.apply(response, Utc::now());
    Ok(())
}

fn request_token(
    http: &Client,
    token_uri: &str,
    params: &[(&str, &str)],
) -> Result<TokenResponse, CredentialError> {
    let resp = http.post(token_uri).form(params).send()?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        return Err(CredentialError::TokenEndpoint { status, body });
    }
    resp.json().map_err(CredentialError::from)
}

#[derive(Debug)]
struct AuthorizeRequest {
    url: String,
    state: String,
    code_verifier: String,
}

impl AuthorizeRequest {
    fn new(secrets: &ClientSecrets, redirect_uri: &str, scopes: &[&str]) -> Result<Self, CredentialError> {
        let state = generate_state();
        let (code_verifier, code_challenge) = generate_pkce();
        let scope = scopes.join(" ");
        let url = Url::parse_with_params(
            &secrets.auth_uri,
            &[
                ("response_type", "code"),
                ("client_id", secrets.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("code_challenge", code_challenge.as_str()),
                ("code_challenge_method", "S256"),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|err| CredentialError::InvalidClientSecrets(format!("auth_uri: {err}")))?;

        Ok(Self {
            url: url.into(),
            state,
            code_verifier,
        })
    }
}

/// PKCE code verifier and its S256 challenge.
fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let code_verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    let code_challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize());

    (code_verifier, code_challenge)
}

fn generate_state() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn run_consent_flow(http: &Client, secrets: &ClientSecrets) -> Result<StoredToken, CredentialError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    let redirect_uri = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());
    let request = AuthorizeRequest::new(secrets, &redirect_uri, &[DRIVE_READONLY_SCOPE])?;

    info!("Open this URL in a browser to grant Drive access:\n{}", request.url);
    open_browser(&request.url);

    let code = wait_for_redirect(&listener)?.into_code(&request.state)?;
    let params = [
        ("code", code.as_str()),
        ("client_id", secrets.client_id.as_str()),
        ("client_secret", secrets.client_secret.as_str()),
        ("redirect_uri", redirect_uri.as_str()),
        ("grant_type", "authorization_code"),
        ("code_verifier", request.code_verifier.as_str()),
    ];
    let response = request_token(http, &secrets.token_uri, &params)?;

    let mut stored = StoredToken {
        token: String::new(),
        refresh_token: None,
        token_uri: secrets.token_uri.clone(),
        client_id: secrets.client_id.clone(),
        client_secret: secrets.client_secret.clone(),
        scopes: vec![DRIVE_READONLY_SCOPE.to_string()],
        expiry: None,
    };
    stored.apply(response, Utc::now());
    Ok(stored)
}

fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let result = Command::new("open").arg(url).status();
    #[cfg(target_os = "windows")]
    let result = Command::new("cmd").args(["/C", "start", "", url]).status();
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let result = Command::new("xdg-open").arg(url).status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => debug!("Browser launcher exited with {status}"),
        Err(err) => debug!("No browser launcher available: {err}"),
    }
}

/// Query parameters Google appends to the loopback redirect.
#[derive(Debug, Default, PartialEq)]
struct RedirectParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

impl RedirectParams {
    /// Parses an HTTP request line such as `GET /?code=..&state=.. HTTP/1.1`.
    /// Returns `None` for requests that are not the OAuth callback.
    fn from_request_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        if parts.next()? != "GET" {
            return None;
        }
        let target = parts.next()?;
        let url = Url::parse(&format!("http://127.0.0.1{target}")).ok()?;

        let mut params = RedirectParams::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => params.code = Some(value.into_owned()),
                "state" => params.state = Some(value.into_owned()),
                "error" => params.error = Some(value.into_owned()),
                _ => {}
            }
        }
        (params.code.is_some() || params.error.is_some()).then_some(params)
    }

    fn into_code(self, expected_state: &str) -> Result<String, CredentialError> {
        if let Some(error) = self.error {
            return Err(CredentialError::ConsentDenied(error));
        }
        if self.state.as_deref() != Some(expected_state) {
            return Err(CredentialError::StateMismatch);
        }
        self.code
            .ok_or_else(|| CredentialError::Redirect("missing authorization code".into()))
    }
}

fn wait_for_redirect(listener: &TcpListener) -> Result<RedirectParams, CredentialError> {
    for stream in listener.incoming() {
        let mut stream = stream?;
        let line = read_request_head(&stream)?;
        match RedirectParams::from_request_line(&line) {
            Some(params) => {
                respond(
                    &mut stream,
                    "200 OK",
                    "Authorization received. You can close this tab and return to whalewatch.",
                );
                return Ok(params);
            }
            None => respond(&mut stream, "404 Not Found", "Not the authorization callback."),
        }
    }
    Err(CredentialError::Redirect("listener closed before the callback arrived".into()))
}

/// Returns the request line after consuming the headers up to the blank line.
/// Answering before the browser finished sending makes it see a reset.
fn read_request_head(stream: &TcpStream) -> Result<String, CredentialError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    let mut header = String::new();
    loop {
        header.clear();
        if reader.read_line(&mut header)? == 0 || header.trim_end().is_empty() {
            break;
        }
    }
    Ok(line)
}

fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    if let Err(err) = stream.write_all(response.as_bytes()) {
        debug!("Failed to answer browser: {err}");
    }
}
