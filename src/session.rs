//! One-to-one conversation tracking.
//!
//! A `MessageSession` claims the messages of a single peer (full or
//! bare JID), optionally pinned to a message thread and to a set of
//! message subtypes. Dispatch offers every inbound message to the
//! registered sessions before any global handler sees it; a consuming
//! session is exclusive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::handler::MessageHandler;
use crate::jid::Jid;
use crate::stanza::{Message, MessageType};

/// A per-peer conversation.
pub struct MessageSession {
    target: Jid,
    /// Thread id; adopted from the first inbound message when the
    /// session was created without one.
    thread: Mutex<String>,
    /// Bitmask of accepted [`MessageType`]s; `0` accepts every type.
    types: i32,
    honor_thread: AtomicBool,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
}

impl MessageSession {
    pub fn new(target: Jid, types: i32, honor_thread: bool) -> MessageSession {
        MessageSession {
            target,
            thread: Mutex::new(String::new()),
            types,
            honor_thread: AtomicBool::new(honor_thread),
            handler: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &Jid {
        &self.target
    }

    pub fn thread_id(&self) -> String {
        self.thread.lock().unwrap().clone()
    }

    pub fn set_thread_id(&self, thread: &str) {
        *self.thread.lock().unwrap() = thread.to_string();
    }

    pub fn types(&self) -> i32 {
        self.types
    }

    pub fn honor_thread_id(&self) -> bool {
        self.honor_thread.load(Ordering::Relaxed)
    }

    pub fn set_honor_thread_id(&self, honor: bool) {
        self.honor_thread.store(honor, Ordering::Relaxed);
    }

    pub fn register_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn remove_message_handler(&self) {
        *self.handler.lock().unwrap() = None;
    }

    /// Whether this session claims the given message. `bare` selects
    /// the second dispatch pass, which matches on the bare JID.
    pub(crate) fn matches(&self, msg: &Message, bare: bool) -> bool {
        let jid_match = if bare {
            self.target.bare() == msg.from.bare()
        } else {
            self.target.full() == msg.from.full()
        };
        if !jid_match {
            return false;
        }
        let thread = self.thread_id();
        let thread_match = msg.thread.is_empty() || thread == msg.thread || !self.honor_thread_id();
        if !thread_match {
            return false;
        }
        self.types == 0 || self.types & msg.subtype as i32 != 0
    }

    /// Deliver a claimed message: adopt its thread when none is pinned
    /// yet, then forward to the session handler.
    pub(crate) fn handle_message(&self, msg: &Message) {
        if !msg.thread.is_empty() {
            let mut thread = self.thread.lock().unwrap();
            if thread.is_empty() {
                *thread = msg.thread.clone();
            }
        }
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler.handle_message(msg);
        }
    }

    /// Prepare an outbound message addressed to this session's peer,
    /// carrying the session thread.
    pub fn build_message(&self, subtype: MessageType, body: &str) -> Message {
        let mut msg = Message::new(subtype, self.target.clone(), body);
        msg.thread = self.thread_id();
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder(AtomicUsize);

    impl MessageHandler for Recorder {
        fn handle_message(&self, _msg: &Message) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn chat_from(from: &str, thread: &str) -> Message {
        let mut msg = Message::new(MessageType::Chat, Jid::new("me@example.org"), "hi");
        msg.from = Jid::new(from);
        msg.thread = thread.to_string();
        msg
    }

    #[test]
    fn test_full_then_bare_matching() {
        let session = MessageSession::new(Jid::new("romeo@example.org/balcony"), 0, true);
        let msg = chat_from("romeo@example.org/garden", "");
        assert!(!session.matches(&msg, false));
        assert!(session.matches(&msg, true));
    }

    #[test]
    fn test_thread_pinning() {
        let session = MessageSession::new(Jid::new("romeo@example.org"), 0, true);
        let first = chat_from("romeo@example.org", "t1");
        assert!(session.matches(&first, true));
        session.handle_message(&first);
        assert_eq!(session.thread_id(), "t1");

        // A different thread no longer matches while threads are
        // honored.
        let other = chat_from("romeo@example.org", "t2");
        assert!(!session.matches(&other, true));

        session.set_honor_thread_id(false);
        assert!(session.matches(&other, true));
    }

    #[test]
    fn test_type_filter() {
        let session = MessageSession::new(Jid::new("romeo@example.org"), MessageType::Chat as i32, true);
        let mut msg = chat_from("romeo@example.org", "");
        assert!(session.matches(&msg, true));
        msg.subtype = MessageType::Headline;
        assert!(!session.matches(&msg, true));
    }

    #[test]
    fn test_handler_receives_claimed_messages() {
        let session = MessageSession::new(Jid::new("romeo@example.org"), 0, true);
        let recorder = Arc::new(Recorder(AtomicUsize::new(0)));
        session.register_message_handler(recorder.clone());
        session.handle_message(&chat_from("romeo@example.org", ""));
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_build_message_carries_thread_and_target() {
        let session = MessageSession::new(Jid::new("romeo@example.org/balcony"), 0, true);
        session.set_thread_id("t9");
        let msg = session.build_message(MessageType::Chat, "hello");
        assert_eq!(msg.to.full(), "romeo@example.org/balcony");
        assert_eq!(msg.thread, "t9");
    }
}
