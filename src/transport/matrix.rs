//! Matrix relay over the client-server HTTP API.
//!
//! Envelopes are posted as plain `m.text` messages into one room. Receiving
//! pages through the room timeline from a cursor persisted on disk.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use super::{Checkpoint, Fetched, Result, Transport, TransportError};
use crate::config::Config;
use crate::protocol::envelope::{decode, is_envelope};
use crate::protocol::Envelope;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size for the first poll when there is no cursor yet.
const INITIAL_PAGE: &str = "50";

/// Page size for forward polls.
const FORWARD_PAGE: &str = "100";

/// Contents of the credentials file.
#[derive(Debug, Clone, Deserialize)]
pub struct MatrixCredentials {
    #[serde(alias = "homeserverUrl", alias = "homeserver")]
    pub homeserver_url: String,
    #[serde(alias = "accessToken")]
    pub access_token: String,
}

#[derive(Serialize)]
struct TextMessage<'a> {
    msgtype: &'static str,
    body: &'a str,
}

/// `/rooms/{roomId}/messages` response.
#[derive(Debug, Deserialize, Default)]
pub struct MessagesPage {
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(default)]
    pub chunk: Vec<RoomEvent>,
}

#[derive(Debug, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

pub struct MatrixTransport {
    /// `None` when the HTTP client could not be built (TLS setup failure).
    client: Option<Client>,
    room_id: Option<String>,
    credentials_file: PathBuf,
    cursor_file: PathBuf,
}

impl MatrixTransport {
    pub fn new(
        room_id: Option<String>,
        credentials_file: impl Into<PathBuf>,
        cursor_file: impl Into<PathBuf>,
    ) -> Self {
        let client = match Client::builder().timeout(REQUEST_TIMEOUT).build() {
            Ok(client) => Some(client),
            Err(e) => {
                tracing::warn!("Matrix HTTP client unavailable: {}", e);
                None
            }
        };
        Self {
            client,
            room_id,
            credentials_file: credentials_file.into(),
            cursor_file: cursor_file.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.settings.matrix.room_id.clone(),
            config.matrix_credentials_file(),
            config.matrix_cursor_file(),
        )
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| TransportError::NotAvailable("no HTTP client".to_string()))
    }

    fn room_id(&self) -> Result<&str> {
        self.room_id
            .as_deref()
            .ok_or_else(|| TransportError::NotConfigured("no Matrix room id".to_string()))
    }

    fn load_credentials(&self) -> Result<MatrixCredentials> {
        if !self.credentials_file.is_file() {
            return Err(TransportError::NotAvailable(format!(
                "credentials file {} missing",
                self.credentials_file.display()
            )));
        }
        let content = std::fs::read_to_string(&self.credentials_file)?;
        serde_json::from_str(&content).map_err(|e| {
            TransportError::Parse(format!(
                "{}: {}",
                self.credentials_file.display(),
                e
            ))
        })
    }

    /// `{homeserver}/_matrix/client/v3/rooms/{room}/{tail...}` with every
    /// segment percent-encoded.
    fn room_url(&self, credentials: &MatrixCredentials, tail: &[&str]) -> Result<Url> {
        room_url(&credentials.homeserver_url, self.room_id()?, tail)
    }

    fn read_cursor(&self) -> Option<String> {
        std::fs::read_to_string(&self.cursor_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> Result<MessagesPage> {
        let credentials = self.load_credentials()?;
        let mut url = self.room_url(&credentials, &["messages"])?;
        {
            let mut query = url.query_pairs_mut();
            match cursor {
                Some(from) => {
                    query
                        .append_pair("dir", "f")
                        .append_pair("from", from)
                        .append_pair("limit", FORWARD_PAGE);
                }
                None => {
                    query.append_pair("dir", "b").append_pair("limit", INITIAL_PAGE);
                }
            }
        }

        let response = self
            .client()?
            .get(url)
            .bearer_auth(&credentials.access_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Api(format!("HTTP {}: {}", status, text)));
        }

        Ok(response.json::<MessagesPage>().await?)
    }
}

pub fn room_url(homeserver: &str, room_id: &str, tail: &[&str]) -> Result<Url> {
    let mut url = Url::parse(homeserver)
        .map_err(|e| TransportError::Parse(format!("homeserver url '{}': {}", homeserver, e)))?;
    url.path_segments_mut()
        .map_err(|_| TransportError::Parse(format!("homeserver url '{}' cannot be a base", homeserver)))?
        .pop_if_empty()
        .extend(["_matrix", "client", "v3", "rooms", room_id])
        .extend(tail);
    Ok(url)
}

/// Envelope bodies of plain-text room messages, oldest first.
pub fn envelopes_from_page(page: &MessagesPage, backwards: bool) -> Vec<Envelope> {
    let mut envelopes: Vec<Envelope> = page
        .chunk
        .iter()
        .filter(|event| event.kind == "m.room.message")
        .filter(|event| event.content.get("msgtype").and_then(|v| v.as_str()) == Some("m.text"))
        .filter_map(|event| event.content.get("body").and_then(|v| v.as_str()))
        .filter(|body| is_envelope(body))
        .filter_map(decode)
        .collect();
    if backwards {
        envelopes.reverse();
    }
    envelopes
}

/// Position to resume from after `page`. A forward page continues from its
/// `end`; the initial backward page starts at the live edge, its `start`.
pub fn next_cursor(previous: Option<&str>, page: &MessagesPage) -> Option<String> {
    let token = match previous {
        Some(_) => page.end.clone(),
        None => page.start.clone(),
    };
    token.or_else(|| previous.map(str::to_string))
}

#[async_trait]
impl Transport for MatrixTransport {
    fn name(&self) -> &str {
        "matrix"
    }

    fn available(&self) -> bool {
        self.client.is_some() && self.room_id.is_some() && self.credentials_file.is_file()
    }

    fn describe(&self) -> String {
        format!(
            "room {}; credentials {}",
            self.room_id.as_deref().unwrap_or("(unset)"),
            self.credentials_file.display()
        )
    }

    async fn send(&self, envelope: &str) -> Result<()> {
        let credentials = self.load_credentials()?;
        let txn_id = ulid::Ulid::new().to_string();
        let url = self.room_url(&credentials, &["send", "m.room.message", &txn_id])?;

        let response = self
            .client()?
            .put(url)
            .bearer_auth(&credentials.access_token)
            .json(&TextMessage {
                msgtype: "m.text",
                body: envelope,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Api(format!("HTTP {}: {}", status, text)));
        }
        tracing::debug!("Relayed envelope to Matrix room {}", self.room_id()?);
        Ok(())
    }

    async fn fetch_new(&self) -> Result<Fetched> {
        let cursor = self.read_cursor();
        let page = self.fetch_page(cursor.as_deref()).await?;
        let envelopes = envelopes_from_page(&page, cursor.is_none());
        let checkpoint = next_cursor(cursor.as_deref(), &page)
            .map(Checkpoint::Cursor)
            .unwrap_or_default();

        Ok(Fetched {
            envelopes,
            checkpoint,
        })
    }

    async fn commit(&self, checkpoint: Checkpoint) -> Result<()> {
        if let Checkpoint::Cursor(token) = checkpoint {
            if let Some(parent) = self.cursor_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&self.cursor_file, token)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode, MessageType, Priority};
    use httpmock::Method::{GET, PUT};
    use httpmock::MockServer;
    use tempfile::TempDir;

    fn envelope(id: &str) -> Envelope {
        Envelope {
            id: id.to_string(),
            from_agent: "remote".to_string(),
            to_agent: "agent-b".to_string(),
            message_type: MessageType::StatusReport,
            priority: Priority::Low,
            convoy: "none".to_string(),
            payload: "done".to_string(),
        }
    }

    fn page(json: serde_json::Value) -> MessagesPage {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_room_url_encodes_room_id() {
        let url = room_url(
            "https://matrix.example.org/",
            "!abc:example.org",
            &["send", "m.room.message", "txn1"],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!abc:example.org/send/m.room.message/txn1"
        );
        assert!(room_url("not a url", "!abc:example.org", &[]).is_err());
    }

    #[test]
    fn test_extracts_only_text_envelopes() {
        let page = page(serde_json::json!({
            "start": "t2",
            "end": "t0",
            "chunk": [
                {"type": "m.room.message", "content": {"msgtype": "m.text", "body": encode(&envelope("msg-2"))}},
                {"type": "m.room.message", "content": {"msgtype": "m.text", "body": "just chatting"}},
                {"type": "m.room.message", "content": {"msgtype": "m.notice", "body": encode(&envelope("msg-x"))}},
                {"type": "m.room.member", "content": {"membership": "join"}},
                {"type": "m.room.message", "content": {"msgtype": "m.text", "body": encode(&envelope("msg-1"))}}
            ]
        }));

        let ids: Vec<String> = envelopes_from_page(&page, true)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["msg-1", "msg-2"]);
    }

    #[test]
    fn test_cursor_advances() {
        let initial = page(serde_json::json!({"start": "s1", "end": "e1", "chunk": []}));
        assert_eq!(next_cursor(None, &initial), Some("s1".to_string()));

        let forward = page(serde_json::json!({"start": "s1", "end": "e2", "chunk": []}));
        assert_eq!(next_cursor(Some("s1"), &forward), Some("e2".to_string()));

        let exhausted = page(serde_json::json!({"start": "e2", "chunk": []}));
        assert_eq!(next_cursor(Some("e2"), &exhausted), Some("e2".to_string()));
    }

    #[tokio::test]
    async fn test_availability_and_cursor_commit() {
        let temp_dir = TempDir::new().unwrap();
        let creds = temp_dir.path().join("creds.json");
        let cursor = temp_dir.path().join("state").join("cursor");

        let unconfigured = MatrixTransport::new(None, &creds, &cursor);
        assert!(!unconfigured.available());

        std::fs::write(
            &creds,
            r#"{"homeserverUrl": "https://matrix.example.org", "accessToken": "secret"}"#,
        )
        .unwrap();
        let transport = MatrixTransport::new(Some("!room:example.org".to_string()), &creds, &cursor);
        assert!(transport.available());
        assert_eq!(transport.load_credentials().unwrap().access_token, "secret");

        transport
            .commit(Checkpoint::Cursor("tok-9".to_string()))
            .await
            .unwrap();
        assert_eq!(transport.read_cursor().as_deref(), Some("tok-9"));
    }

    const ROOM: &str = "!room:example.org";
    const MESSAGES_PATH: &str = "/_matrix/client/v3/rooms/!room:example.org/messages";

    fn transport_for(server: &MockServer, temp_dir: &TempDir) -> MatrixTransport {
        let creds = temp_dir.path().join("creds.json");
        std::fs::write(
            &creds,
            serde_json::json!({"homeserver_url": server.base_url(), "access_token": "secret"})
                .to_string(),
        )
        .unwrap();
        MatrixTransport::new(Some(ROOM.to_string()), creds, temp_dir.path().join("cursor"))
    }

    #[tokio::test]
    async fn test_send_puts_text_message_with_bearer_token() {
        let server = MockServer::start_async().await;
        let put = server
            .mock_async(|when, then| {
                when.method(PUT)
                    .path_contains("/_matrix/client/v3/rooms/!room:example.org/send/m.room.message/")
                    .header("authorization", "Bearer secret")
                    .json_body(serde_json::json!({"msgtype": "m.text", "body": "AIMAIL:1|x"}));
                then.status(200).json_body(serde_json::json!({"event_id": "$ev1"}));
            })
            .await;
        let temp_dir = TempDir::new().unwrap();
        let transport = transport_for(&server, &temp_dir);

        transport.send("AIMAIL:1|x").await.unwrap();
        put.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_fetch_pages_backward_then_forward_from_cursor() {
        let server = MockServer::start_async().await;
        let body = encode(&envelope("msg-1"));
        let backward = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(MESSAGES_PATH)
                    .query_param("dir", "b")
                    .query_param("limit", "50")
                    .header("authorization", "Bearer secret");
                then.status(200).json_body(serde_json::json!({
                    "start": "s1",
                    "end": "e1",
                    "chunk": [
                        {"type": "m.room.message", "content": {"msgtype": "m.text", "body": body}}
                    ]
                }));
            })
            .await;
        let temp_dir = TempDir::new().unwrap();
        let transport = transport_for(&server, &temp_dir);

        let first = transport.fetch_new().await.unwrap();
        assert_eq!(first.envelopes.len(), 1);
        assert_eq!(first.envelopes[0].id, "msg-1");
        assert_eq!(first.checkpoint, Checkpoint::Cursor("s1".to_string()));
        backward.assert_hits_async(1).await;
        transport.commit(first.checkpoint).await.unwrap();

        let forward = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(MESSAGES_PATH)
                    .query_param("dir", "f")
                    .query_param("from", "s1")
                    .query_param("limit", "100");
                then.status(200)
                    .json_body(serde_json::json!({"start": "s1", "end": "e2", "chunk": []}));
            })
            .await;

        let second = transport.fetch_new().await.unwrap();
        assert!(second.envelopes.is_empty());
        assert_eq!(second.checkpoint, Checkpoint::Cursor("e2".to_string()));
        forward.assert_hits_async(1).await;
        backward.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_error_status_is_an_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(PUT);
                then.status(403).body("forbidden");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(MESSAGES_PATH);
                then.status(500).body("boom");
            })
            .await;
        let temp_dir = TempDir::new().unwrap();
        let transport = transport_for(&server, &temp_dir);

        assert!(matches!(
            transport.send("AIMAIL:1|x").await,
            Err(TransportError::Api(msg)) if msg.contains("403")
        ));
        assert!(matches!(
            transport.fetch_new().await,
            Err(TransportError::Api(msg)) if msg.contains("500")
        ));
        assert!(transport.read_cursor().is_none());
    }

    #[tokio::test]
    async fn test_missing_client_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let creds = temp_dir.path().join("creds.json");
        std::fs::write(
            &creds,
            r#"{"homeserver_url": "https://matrix.example.org", "access_token": "secret"}"#,
        )
        .unwrap();
        let transport = MatrixTransport {
            client: None,
            room_id: Some(ROOM.to_string()),
            credentials_file: creds,
            cursor_file: temp_dir.path().join("cursor"),
        };

        assert!(!transport.available());
        assert!(matches!(
            transport.send("AIMAIL:1|x").await,
            Err(TransportError::NotAvailable(_))
        ));
    }
}
