use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::config::MatrixConfig;
use crate::error::ChatError;

/// A rendered message ready to be posted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub msgtype: String,
    pub body: String,
    pub formatted_body: Option<String>,
}

impl Message {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            msgtype: "m.text".to_string(),
            body: body.into(),
            formatted_body: None,
        }
    }

    fn content(&self) -> Value {
        let mut content = json!({
            "msgtype": self.msgtype,
            "body": self.body,
        });
        if let Some(html) = &self.formatted_body {
            content["format"] = json!("org.matrix.custom.html");
            content["formatted_body"] = json!(html);
        }
        content
    }
}

/// The chat-protocol primitives the bridge relies on.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn resolve_alias(&self, alias: &str) -> Result<String, ChatError>;

    /// Joining a room the account is already in succeeds.
    async fn join_room(&self, room_id: &str) -> Result<(), ChatError>;

    /// `txn_id` must be reused when retrying the same message.
    async fn send_message(
        &self,
        room_id: &str,
        txn_id: &str,
        message: &Message,
    ) -> Result<(), ChatError>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    retry_after_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolveAliasResponse {
    room_id: String,
}

/// Client-server API (v3) over HTTP.
#[derive(Debug)]
pub struct MatrixClient {
    http: Client,
    homeserver: Url,
    username: String,
    device_name: String,
    access_token: RwLock<Option<String>>,
}

impl MatrixClient {
    pub fn new(config: &MatrixConfig, request_timeout: Duration) -> Result<Self, ChatError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Self::with_client(http, config)
    }

    pub fn with_client(http: Client, config: &MatrixConfig) -> Result<Self, ChatError> {
        let homeserver = Url::parse(&config.server)
            .map_err(|e| ChatError::Malformed(format!("homeserver URL: {e}")))?;
        Ok(Self {
            http,
            homeserver,
            username: config.username.clone(),
            device_name: config.device_name.clone(),
            access_token: RwLock::new(config.access_token.clone()),
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.token().is_some()
    }

    /// Password login. Stores the returned access token for later calls.
    pub async fn login(&self, password: &str) -> Result<(), ChatError> {
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": self.username },
            "password": password,
            "initial_device_display_name": self.device_name,
        });
        let url = self.endpoint(&["login"])?;
        let response = self.http.post(url).json(&body).send().await?;
        let login: LoginResponse = decode(response).await?;
        info!(
            user_id = login.user_id.as_deref().unwrap_or(&self.username),
            homeserver = %self.homeserver,
            "logged in"
        );
        self.set_token(login.access_token);
        Ok(())
    }

    fn token(&self) -> Option<String> {
        self.access_token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_token(&self, token: String) {
        *self
            .access_token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token);
    }

    /// `/_matrix/client/v3/<segments...>`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.homeserver.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ChatError::Malformed("homeserver URL cannot be a base".into()))?;
            path.pop_if_empty().extend(["_matrix", "client", "v3"]);
            path.extend(segments);
        }
        Ok(url)
    }

    fn authed(&self, method: Method, url: Url) -> Result<RequestBuilder, ChatError> {
        let token = self.token().ok_or(ChatError::NotLoggedIn)?;
        Ok(self.http.request(method, url).bearer_auth(token))
    }
}

#[async_trait]
impl ChatClient for MatrixClient {
    async fn resolve_alias(&self, alias: &str) -> Result<String, ChatError> {
        let url = self.endpoint(&["directory", "room", alias])?;
        let response = self.authed(Method::GET, url)?.send().await?;
        let resolved: ResolveAliasResponse = decode(response).await?;
        debug!(alias, room_id = %resolved.room_id, "resolved alias");
        Ok(resolved.room_id)
    }

    async fn join_room(&self, room_id: &str) -> Result<(), ChatError> {
        let url = self.endpoint(&["join", room_id])?;
        let response = self.authed(Method::POST, url)?.json(&json!({})).send().await?;
        let _: Value = decode(response).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        room_id: &str,
        txn_id: &str,
        message: &Message,
    ) -> Result<(), ChatError> {
        let url = self.endpoint(&["rooms", room_id, "send", "m.room.message", txn_id])?;
        let response = self
            .authed(Method::PUT, url)?
            .json(&message.content())
            .send()
            .await?;
        let _: Value = decode(response).await?;
        Ok(())
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ChatError> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if status.is_success() {
        return serde_json::from_slice(&bytes).map_err(|e| ChatError::Malformed(e.to_string()));
    }
    let body: ErrorBody = serde_json::from_slice(&bytes).unwrap_or(ErrorBody {
        errcode: String::new(),
        error: String::from_utf8_lossy(&bytes).into_owned(),
        retry_after_ms: None,
    });
    if status.as_u16() == 429 || body.errcode == "M_LIMIT_EXCEEDED" {
        return Err(ChatError::RateLimited {
            retry_after: body.retry_after_ms.map(Duration::from_millis),
        });
    }
    Err(ChatError::Api {
        status: status.as_u16(),
        errcode: body.errcode,
        error: body.error,
    })
}
