use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Stream;

use crate::assembler::{self, AssemblerEvents};
use crate::attachment::{Attachment, compose_user_content};
use crate::client::ChatClient;
use crate::conversation::SharedConversation;
use crate::error::SendError;
use crate::history::HistoryStore;
use crate::protocol::ChatMessage;

/// Runs sends for one conversation, at most one at a time.
pub struct ChatSession {
    client: ChatClient,
    conversation: SharedConversation,
    history: Arc<dyn HistoryStore>,
    in_flight: AtomicBool,
}

// Seals any open reply and releases the in-flight flag however the send
// ends, including when the send future is dropped mid-stream.
struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
    conversation: &'a SharedConversation,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.conversation.seal();
        self.flag.store(false, Ordering::Release);
    }
}

struct ConversationUpdates<'a> {
    session: &'a ChatSession,
}

impl AssemblerEvents for ConversationUpdates<'_> {
    fn on_update(&mut self, accumulated: &str) {
        let updated = self
            .session
            .conversation
            .update_last_message(|message| message.content = accumulated.to_string());
        if updated {
            self.session.persist();
        }
    }
}

impl ChatSession {
    pub fn new(
        client: ChatClient,
        conversation: SharedConversation,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        Self {
            client,
            conversation,
            history,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn conversation(&self) -> &SharedConversation {
        &self.conversation
    }

    pub fn client(&self) -> &ChatClient {
        &self.client
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Loads stored history into the conversation. Unreadable history is
    /// logged and treated as empty.
    pub fn restore(&self) -> usize {
        match self.history.load() {
            Ok(messages) => {
                let count = messages.len();
                self.conversation.replace(messages);
                count
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to load chat history");
                0
            }
        }
    }

    pub fn clear(&self) {
        self.conversation.clear();
        self.persist();
    }

    /// Sends `input` (plus any attachment) and streams the reply into the
    /// conversation.
    ///
    /// Blank input and overlapping sends are rejected without touching the
    /// conversation. Every other failure ends up as a sealed assistant
    /// message flagged as an error, and is also returned.
    pub async fn send(
        &self,
        input: &str,
        attachment: Option<Attachment>,
    ) -> Result<(), SendError> {
        if input.trim().is_empty() {
            return Err(SendError::EmptyInput);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SendError::Busy);
        }
        let _guard = InFlightGuard {
            flag: &self.in_flight,
            conversation: &self.conversation,
        };

        let (content, reference) = match attachment {
            Some(attachment) => (
                compose_user_content(input, attachment.extracted_text.as_deref()),
                Some(attachment.reference),
            ),
            None => (compose_user_content(input, None), None),
        };
        self.conversation
            .append_message(ChatMessage::user(content).with_attachment(reference));
        self.persist();

        let history = self.conversation.wire_history();
        tracing::debug!(messages = history.len(), "sending chat request");

        let result = match self.client.open_stream(&history).await {
            Ok(stream) => self.stream_reply(stream).await,
            Err(err) => {
                tracing::error!(error = %err, "chat request failed");
                self.conversation
                    .append_message(ChatMessage::error(err.to_string()));
                Err(err)
            }
        };

        self.persist();
        result
    }

    /// Streams one reply into a freshly opened assistant message and seals it.
    async fn stream_reply<S, B, E>(&self, stream: S) -> Result<(), SendError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::error::Error + 'static,
    {
        self.conversation.open_assistant();
        let mut updates = ConversationUpdates { session: self };

        let result = match assembler::consume(stream, &mut updates).await {
            Ok(content) => {
                tracing::debug!(chars = content.chars().count(), "reply complete");
                Ok(())
            }
            Err(interrupted) => {
                tracing::error!(error = %interrupted.source, "reply stream interrupted");
                let err = SendError::Interrupted(interrupted.source.to_string());
                let text = err.to_string();
                self.conversation.update_last_message(|message| {
                    if message.content.is_empty() {
                        message.content = text;
                    }
                    message.is_error = true;
                });
                Err(err)
            }
        };

        self.conversation.seal();
        result
    }

    fn persist(&self) {
        let messages = self.conversation.snapshot();
        if let Err(err) = self.history.save(&messages) {
            tracing::error!(error = %err, "failed to save chat history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::history::MemoryHistoryStore;
    use crate::protocol::Role;
    use crate::testing::{AfterRecords, spawn_chunked_upstream};
    use futures::stream;
    use serde_json::json;
    use std::io;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session(base_url: String) -> (ChatSession, Arc<MemoryHistoryStore>) {
        let history = Arc::new(MemoryHistoryStore::new());
        let session = ChatSession::new(
            ChatClient::new(ClientConfig { base_url }),
            SharedConversation::default(),
            history.clone(),
        );
        (session, history)
    }

    fn ndjson(lines: &[&str]) -> String {
        lines
            .iter()
            .map(|content| format!("{}\n", json!({"message": {"content": content}})))
            .collect()
    }

    #[tokio::test]
    async fn hello_streams_into_one_assistant_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_json(json!({"messages": [{"role": "user", "content": "Hello"}]})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(ndjson(&["Hi ", "there"]), "application/x-ndjson"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (session, history) = session(server.uri());
        session.send("Hello", None).await.unwrap();

        let messages = session.conversation().snapshot();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], ChatMessage::user("Hello"));
        assert_eq!(messages[1], ChatMessage::assistant("Hi there"));
        assert!(!session.is_busy());
        assert_eq!(history.load().unwrap(), messages);
    }

    #[tokio::test]
    async fn follow_up_send_includes_earlier_turns() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_json(json!({"messages": [
                {"role": "user", "content": "Hello"},
                {"role": "assistant", "content": "Hi"},
                {"role": "user", "content": "How are you?"}
            ]})))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(ndjson(&["Fine"]), "application/x-ndjson"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (session, _) = session(server.uri());
        session.conversation().replace(vec![
            ChatMessage::user("Hello"),
            ChatMessage::assistant("Hi"),
        ]);
        session.send("  How are you?  ", None).await.unwrap();
        assert_eq!(session.conversation().snapshot()[3].content, "Fine");
    }

    #[tokio::test]
    async fn attachment_text_and_reference_go_on_the_user_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(ndjson(&["ok"]), "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let (session, _) = session(server.uri());
        let attachment = Attachment {
            name: "notes.txt".into(),
            reference: "file:///tmp/notes.txt".into(),
            extracted_text: Some("alpha\nbeta".into()),
        };
        session.send("Summarize", Some(attachment)).await.unwrap();

        let user = &session.conversation().snapshot()[0];
        assert_eq!(user.role, Role::User);
        assert!(user.content.starts_with("Summarize\n\n"));
        assert!(user.content.ends_with("\n\nalpha\nbeta"));
        assert_eq!(user.attachment.as_deref(), Some("file:///tmp/notes.txt"));
    }

    #[tokio::test]
    async fn transport_failure_becomes_error_message() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (session, _) = session(format!("http://{addr}"));
        let err = session.send("Hello", None).await.unwrap_err();
        assert!(matches!(err, SendError::Transport(_)));

        let messages = session.conversation().snapshot();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].is_error);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, err.to_string());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn missing_body_has_its_own_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let (session, _) = session(server.uri());
        let err = session.send("Hello", None).await.unwrap_err();
        assert!(matches!(err, SendError::NoBody));
        assert_eq!(
            session.conversation().snapshot()[1],
            ChatMessage::error("response has no body")
        );
    }

    #[tokio::test]
    async fn blank_input_is_rejected_untouched() {
        let (session, history) = session("http://127.0.0.1:9".into());
        let err = session.send("   ", None).await.unwrap_err();
        assert!(err.is_rejection());
        assert!(session.conversation().snapshot().is_empty());
        assert!(history.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_busy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(ndjson(&["slow"]), "application/x-ndjson")
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (session, _) = session(server.uri());
        let first = session.send("one", None);
        let second = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            session.send("two", None).await
        };
        let (first, second) = tokio::join!(first, second);

        assert!(first.is_ok());
        assert!(matches!(second, Err(SendError::Busy)));
        let messages = session.conversation().snapshot();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "slow");
    }

    #[tokio::test]
    async fn interrupted_stream_keeps_partial_content_flagged() {
        let (session, _) = session("http://127.0.0.1:9".into());
        session.conversation().append_message(ChatMessage::user("Hello"));

        let chunks: Vec<Result<String, io::Error>> = vec![
            Ok(ndjson(&["Hi ", "the"])),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")),
        ];
        let err = session.stream_reply(stream::iter(chunks)).await.unwrap_err();
        assert!(matches!(err, SendError::Interrupted(_)));

        let reply = session.conversation().snapshot().pop().unwrap();
        assert_eq!(reply.content, "Hi the");
        assert!(reply.is_error);
        assert!(!session.conversation().update_last_message(|m| m.content.clear()));
    }

    #[tokio::test]
    async fn interrupted_before_content_shows_the_error() {
        let (session, _) = session("http://127.0.0.1:9".into());
        let chunks: Vec<Result<String, io::Error>> =
            vec![Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))];
        session.stream_reply(stream::iter(chunks)).await.unwrap_err();

        let reply = session.conversation().snapshot().pop().unwrap();
        assert!(reply.is_error);
        assert_eq!(reply.content, "response was interrupted: reset");
    }

    #[tokio::test]
    async fn dropped_send_keeps_saved_partial_reply_and_seals_it() {
        let upstream = spawn_chunked_upstream(
            vec![format!("{}\n", json!({"message": {"content": "Hi "}}))],
            AfterRecords::Stall,
        )
        .await;
        let (session, history) = session(upstream);

        let sending = session.send("Hello", None);
        let outcome = tokio::time::timeout(Duration::from_millis(500), sending).await;
        assert!(outcome.is_err());

        assert!(!session.is_busy());
        assert!(!session.conversation().update_last_message(|m| m.content.clear()));
        let saved = history.load().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[1].content, "Hi ");
    }

    #[tokio::test]
    async fn restore_loads_saved_history() {
        let (session, history) = session("http://127.0.0.1:9".into());
        history
            .save(&[ChatMessage::user("earlier"), ChatMessage::assistant("reply")])
            .unwrap();
        assert_eq!(session.restore(), 2);
        assert_eq!(session.conversation().snapshot()[1].content, "reply");

        session.clear();
        assert!(history.load().unwrap().is_empty());
    }
}
