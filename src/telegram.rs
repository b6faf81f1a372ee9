use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response, multipart};
use serde::{Deserialize, Serialize};

const HTTP_TIMEOUT_SECS: u64 = 60;

/// Errors that can occur while delivering an alert.
#[derive(Debug)]
pub enum TelegramError {
    Http(reqwest::Error),
    Api {
        status: StatusCode,
        description: String,
    },
}

impl fmt::Display for TelegramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelegramError::Http(err) => write!(f, "http error: {err}"),
            TelegramError::Api {
                status,
                description,
            } => write!(f, "Telegram API error ({status}): {description}"),
        }
    }
}

impl std::error::Error for TelegramError {}

impl From<reqwest::Error> for TelegramError {
    fn from(value: reqwest::Error) -> Self {
        TelegramError::Http(value)
    }
}

/// Receives an alert for every confirmed whale.
pub trait Notifier {
    /// Sends `caption` as a message, then the image as a photo.
    fn notify(&self, caption: &str, image: &[u8], file_name: &str) -> Result<(), TelegramError>;
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Blocking Bot API client posting to one fixed chat.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    base_url: String,
    chat_id: String,
    http: Client,
}

impl TelegramNotifier {
    pub fn new(
        api_url: &str,
        bot_token: &str,
        chat_id: impl Into<String>,
    ) -> Result<Self, TelegramError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            base_url: bot_base_url(api_url, bot_token),
            chat_id: chat_id.into(),
            http,
        })
    }

    pub fn send_message(&self, text: &str) -> Result<(), TelegramError> {
        let url = format!("{}/sendMessage", self.base_url);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text,
        };
        let response = self.http.post(url).json(&body).send()?;
        Self::handle_response(response)
    }

    pub fn send_photo(&self, image: &[u8], file_name: &str) -> Result<(), TelegramError> {
        let url = format!("{}/sendPhoto", self.base_url);
        let part = multipart::Part::bytes(image.to_vec()).file_name(file_name.to_string());
        let form = multipart::Form::new()
            .text("chat_id", self.chat_id.clone())
            .part("photo", part);
        let response = self.http.post(url).multipart(form).send()?;
        Self::handle_response(response)
    }

    fn handle_response(response: Response) -> Result<(), TelegramError> {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        check_reply(status, &body)
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, caption: &str, image: &[u8], file_name: &str) -> Result<(), TelegramError> {
        self.send_message(caption)?;
        self.send_photo(image, file_name)
    }
}

fn bot_base_url(api_url: &str, bot_token: &str) -> String {
    format!("{}/bot{}", api_url.trim_end_matches('/'), bot_token)
}

/// Telegram reports failures both through the status and the `ok` flag.
fn check_reply(status: StatusCode, body: &str) -> Result<(), TelegramError> {
    let parsed: Option<BotResponse> = serde_json::from_str(body).ok();
    match parsed {
        Some(reply) if status.is_success() && reply.ok => Ok(()),
        Some(reply) => Err(TelegramError::Api {
            status,
            description: reply
                .description
                .unwrap_or_else(|| "request was not ok".into()),
        }),
        None => Err(TelegramError::Api {
            status,
            description: if body.is_empty() {
                "empty response".into()
            } else {
                body.to_string()
            },
        }),
    }
}
