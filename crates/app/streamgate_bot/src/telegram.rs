//! Minimal Telegram Bot API client.
//!
//! Long-polls `getUpdates` and exposes the handful of methods the bot
//! needs. Core notifications go through [`TelegramNotifier`], which maps
//! transport failures into the engine's `DeliveryError` so a blocked user
//! never affects subscription state.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use streamgate_core::notify::{Button, DeliveryError, Keyboard, Notifier};

/// Telegram API errors.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telegram api error: {0}")]
    Api(String),
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<TgUser>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TgUser {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: TgUser,
    pub message: Option<Message>,
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Clone)]
pub struct Bot {
    client: reqwest::Client,
    base: String,
}

impl Bot {
    pub fn new(token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("https://api.telegram.org/bot{token}"),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &serde_json::Value,
    ) -> Result<T, TelegramError> {
        let response: ApiResponse<T> = self
            .client
            .post(format!("{}/{method}", self.base))
            .json(payload)
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            return Err(TelegramError::Api(
                response
                    .description
                    .unwrap_or_else(|| "unknown error".into()),
            ));
        }
        response
            .result
            .ok_or_else(|| TelegramError::Api("missing result".into()))
    }

    /// Long-poll for updates after `offset`.
    pub async fn get_updates(
        &self,
        offset: i64,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            &serde_json::json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<Message, TelegramError> {
        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = reply_markup(keyboard);
        }
        self.call("sendMessage", &payload).await
    }

    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<(), TelegramError> {
        let mut payload = serde_json::json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(keyboard) = keyboard {
            payload["reply_markup"] = reply_markup(keyboard);
        }
        self.call::<serde_json::Value>("editMessageText", &payload)
            .await
            .map(|_| ())
    }

    pub async fn answer_callback_query(
        &self,
        callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TelegramError> {
        let mut payload = serde_json::json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            payload["text"] = serde_json::Value::String(text.to_string());
        }
        self.call::<bool>("answerCallbackQuery", &payload)
            .await
            .map(|_| ())
    }
}

/// Render core buttons as an `InlineKeyboardMarkup` payload.
fn reply_markup(keyboard: &Keyboard) -> serde_json::Value {
    let rows: Vec<Vec<serde_json::Value>> = keyboard
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| match button {
                    Button::Callback { label, data } => {
                        serde_json::json!({ "text": label, "callback_data": data })
                    }
                    Button::Url { label, url } => {
                        serde_json::json!({ "text": label, "url": url })
                    }
                })
                .collect()
        })
        .collect();
    serde_json::json!({ "inline_keyboard": rows })
}

/// Core notification sink over the Bot API.
pub struct TelegramNotifier {
    bot: Bot,
}

impl TelegramNotifier {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(
        &self,
        user_id: i64,
        text: &str,
        buttons: Option<Keyboard>,
    ) -> Result<(), DeliveryError> {
        match self.bot.send_message(user_id, text, buttons.as_ref()).await {
            Ok(_) => Ok(()),
            // "Forbidden: bot was blocked by the user" and friends.
            Err(TelegramError::Api(description)) if description.contains("blocked") => {
                Err(DeliveryError::Unreachable(user_id))
            }
            Err(err) => Err(DeliveryError::Transport(err.to_string())),
        }
    }
}
