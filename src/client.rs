use crate::error::SendError;
use crate::protocol::{ChatRequest, ErrorBody, WireMessage};
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Client as HttpClient, StatusCode};

/// Response body of the proxy, chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

pub struct ClientConfig {
    pub base_url: String,
}

/// HTTP client for the chat proxy.
#[derive(Clone)]
pub struct ChatClient {
    base_url: String,
    http: HttpClient,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            base_url: normalize_base_url(&config.base_url),
            http: HttpClient::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Posts the conversation and returns the NDJSON body as a byte stream.
    pub async fn open_stream(
        &self,
        messages: &[WireMessage],
    ) -> Result<ByteStream, SendError> {
        let request = ChatRequest {
            messages: messages.to_vec(),
        };

        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        if status == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Err(SendError::NoBody);
        }

        Ok(response.bytes_stream().boxed())
    }
}

pub(crate) fn normalize_base_url(value: &str) -> String {
    value.trim_end_matches('/').to_string()
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            message: Some(message),
            ..
        }) => message,
        Ok(ErrorBody { error, .. }) => error,
        Err(_) => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ChatClient {
        ChatClient::new(ClientConfig {
            base_url: format!("{}/", server.uri()),
        })
    }

    #[tokio::test]
    async fn posts_history_and_streams_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_json(json!({"messages": [{"role": "user", "content": "Hello"}]})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("{\"message\":{\"content\":\"Hi\"}}\n", "application/x-ndjson"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let messages = vec![WireMessage {
            role: Role::User,
            content: "Hello".into(),
        }];
        let stream = client(&server).open_stream(&messages).await.unwrap();
        let chunks: Vec<Bytes> = stream.map(|chunk| chunk.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"{\"message\":{\"content\":\"Hi\"}}\n");
    }

    #[tokio::test]
    async fn error_status_uses_json_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": "Invalid messages format",
                "message": "message 0 has an invalid role"
            })))
            .mount(&server)
            .await;

        let err = client(&server).open_stream(&[]).await.err().unwrap();
        match err {
            SendError::Status { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "message 0 has an invalid role");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_content_is_no_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let err = client(&server).open_stream(&[]).await.err().unwrap();
        assert!(matches!(err, SendError::NoBody));
    }

    #[tokio::test]
    async fn zero_length_body_is_no_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("", "application/x-ndjson"))
            .mount(&server)
            .await;

        let err = client(&server).open_stream(&[]).await.err().unwrap();
        assert!(matches!(err, SendError::NoBody));
    }

    #[tokio::test]
    async fn unreachable_server_is_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ChatClient::new(ClientConfig {
            base_url: format!("http://{addr}"),
        });
        let err = client.open_stream(&[]).await.err().unwrap();
        assert!(matches!(err, SendError::Transport(_)));
    }

    #[test]
    fn error_message_falls_back_to_raw_body() {
        assert_eq!(error_message("{\"error\":\"No response body from server\"}"), "No response body from server");
        assert_eq!(error_message(" gateway down \n"), "gateway down");
    }
}
