use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocol::{ChatMessage, Role, WireMessage};

/// Owner of the message list.
///
/// At most one message is open for streamed updates, and it is always the
/// last assistant message. Appending anything seals it.
#[derive(Debug, Default, Clone)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
    open: bool,
}

impl Conversation {
    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            open: false,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn append_message(&mut self, message: ChatMessage) {
        self.open = false;
        self.messages.push(message);
    }

    /// Appends an empty assistant message that receives streamed content.
    pub fn open_assistant(&mut self) {
        self.append_message(ChatMessage::assistant(String::new()));
        self.open = true;
    }

    /// Applies `mutator` to the open message. Returns false, leaving the
    /// conversation unchanged, when every message is sealed.
    pub fn update_last_message<F>(&mut self, mutator: F) -> bool
    where
        F: FnOnce(&mut ChatMessage),
    {
        if !self.open {
            return false;
        }
        match self.messages.last_mut() {
            Some(message) => {
                mutator(message);
                true
            }
            None => false,
        }
    }

    pub fn seal(&mut self) {
        self.open = false;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.open = false;
    }

    pub fn last_assistant(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::Assistant && !message.is_error)
    }

    /// Role and content of every message, in order, as sent to the proxy.
    pub fn wire_history(&self) -> Vec<WireMessage> {
        self.messages.iter().map(ChatMessage::to_wire).collect()
    }
}

/// Handle to a conversation shared between the UI and a send task.
///
/// Each call holds the lock only for its own duration.
#[derive(Debug, Clone, Default)]
pub struct SharedConversation {
    inner: Arc<Mutex<Conversation>>,
}

impl SharedConversation {
    fn lock(&self) -> MutexGuard<'_, Conversation> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append_message(&self, message: ChatMessage) {
        self.lock().append_message(message);
    }

    pub fn open_assistant(&self) {
        self.lock().open_assistant();
    }

    pub fn update_last_message<F>(&self, mutator: F) -> bool
    where
        F: FnOnce(&mut ChatMessage),
    {
        self.lock().update_last_message(mutator)
    }

    pub fn seal(&self) {
        self.lock().seal();
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn replace(&self, messages: Vec<ChatMessage>) {
        *self.lock() = Conversation::from_messages(messages);
    }

    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.lock().messages().to_vec()
    }

    pub fn wire_history(&self) -> Vec<WireMessage> {
        self.lock().wire_history()
    }

    pub fn last_assistant_content(&self) -> Option<String> {
        self.lock()
            .last_assistant()
            .map(|message| message.content.clone())
    }
}
