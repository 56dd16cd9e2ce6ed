//! Push delivery.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use skypush_atproto::{EventKind, FirehoseEvent};

/// Expo's public push endpoint.
pub const DEFAULT_PUSH_URL: &str = "https://exp.host/--/api/v2/push/send";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A failed delivery. Any of these invalidates the token it was sent to.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("push service rejected token: {reason}")]
    Rejected { reason: String },

    #[error("unexpected push service response: {0}")]
    InvalidResponse(String),
}

/// Delivers one event to one device.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, token: &str, event: &FirehoseEvent) -> Result<(), PushError>;
}

/// The JSON body posted for each delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushMessage<'a> {
    pub to: &'a str,
    pub title: String,
    pub body: String,
    pub data: &'a FirehoseEvent,
}

impl<'a> PushMessage<'a> {
    pub fn new(token: &'a str, event: &'a FirehoseEvent) -> Self {
        let (title, verb) = match event.kind {
            EventKind::Like => ("New like", "liked your post"),
            EventKind::Reply => ("New reply", "replied to your post"),
            EventKind::Quote => ("New quote", "quoted your post"),
            EventKind::Repost => ("New repost", "reposted your post"),
            EventKind::Mention => ("New mention", "mentioned you"),
            EventKind::Follow => ("New follower", "followed you"),
        };
        Self {
            to: token,
            title: title.to_string(),
            body: format!("{} {}", event.from_did, verb),
            data: event,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Ticket {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<TicketDetails>,
}

#[derive(Debug, Deserialize)]
struct TicketDetails {
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Tickets {
    One(Ticket),
    Many(Vec<Ticket>),
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    data: Tickets,
}

impl Ticket {
    fn into_result(self) -> Result<(), PushError> {
        if self.status != "error" {
            return Ok(());
        }
        let reason = self
            .details
            .and_then(|d| d.error)
            .or(self.message)
            .unwrap_or_else(|| "unknown error".to_string());
        Err(PushError::Rejected { reason })
    }
}

/// [`PushSender`] for Expo-compatible push services.
#[derive(Debug, Clone)]
pub struct ExpoPushSender {
    client: reqwest::Client,
    url: String,
    access_token: Option<String>,
}

impl ExpoPushSender {
    pub fn new(url: impl Into<String>, access_token: Option<String>) -> Result<Self, PushError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            access_token,
        })
    }
}

#[async_trait]
impl PushSender for ExpoPushSender {
    #[instrument(skip(self, token, event), fields(kind = %event.kind))]
    async fn send(&self, token: &str, event: &FirehoseEvent) -> Result<(), PushError> {
        let mut request = self
            .client
            .post(&self.url)
            .header("accept", "application/json")
            .json(&PushMessage::new(token, event));
        if let Some(access_token) = &self.access_token {
            request = request.bearer_auth(access_token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PushError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: PushResponse = response
            .json()
            .await
            .map_err(|e| PushError::InvalidResponse(e.to_string()))?;

        match body.data {
            Tickets::One(ticket) => ticket.into_result()?,
            Tickets::Many(tickets) => {
                for ticket in tickets {
                    ticket.into_result()?;
                }
            }
        }

        debug!("push delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn like() -> FirehoseEvent {
        serde_json::from_value(json!({
            "type": "like",
            "fromDid": "didA",
            "toDid": "didB",
            "postUri": "at://didB/app.bsky.feed.post/1",
        }))
        .unwrap()
    }

    async fn sender(server: &MockServer, token: Option<&str>) -> ExpoPushSender {
        ExpoPushSender::new(
            format!("{}/--/api/v2/push/send", server.uri()),
            token.map(str::to_string),
        )
        .unwrap()
    }

    #[test]
    fn test_message_shape() {
        let event = like();
        let message = serde_json::to_value(PushMessage::new("ExponentPushToken[x]", &event)).unwrap();
        assert_eq!(
            message,
            json!({
                "to": "ExponentPushToken[x]",
                "title": "New like",
                "body": "didA liked your post",
                "data": {
                    "type": "like",
                    "fromDid": "didA",
                    "toDid": "didB",
                    "postUri": "at://didB/app.bsky.feed.post/1",
                },
            })
        );
    }

    #[tokio::test]
    async fn test_send_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/--/api/v2/push/send"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"to": "tok", "data": {"type": "like"}})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"data": {"status": "ok", "id": "1"}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        sender(&server, Some("secret"))
            .await
            .send("tok", &like())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_ticket_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "status": "error",
                    "message": "not a registered push token",
                    "details": {"error": "DeviceNotRegistered"},
                }
            })))
            .mount(&server)
            .await;

        let err = sender(&server, None).await.send("tok", &like()).await.unwrap_err();
        match err {
            PushError::Rejected { reason } => assert_eq!(reason, "DeviceNotRegistered"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_ticket_list_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"status": "ok", "id": "1"}, {"status": "error", "message": "bad"}]
            })))
            .mount(&server)
            .await;

        let err = sender(&server, None).await.send("tok", &like()).await.unwrap_err();
        assert!(matches!(err, PushError::Rejected { reason } if reason == "bad"));
    }

    #[tokio::test]
    async fn test_http_error_status_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = sender(&server, None).await.send("tok", &like()).await.unwrap_err();
        assert!(matches!(err, PushError::Status { status: 500, .. }));
    }
}
