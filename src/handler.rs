//! Handler seams and the registration tables behind stanza dispatch.
//!
//! Handlers are trait objects held as `Arc`s; removal matches by
//! `Arc::ptr_eq`, so the token an application registered with is the
//! token it removes with. Only the tables that can be touched from a
//! send while dispatch runs (the IQ id map, the IQ extension multimap)
//! are lock-protected; every other table is mutated through `&mut`
//! access on the owning session and is single-threaded by
//! construction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::ConnectionError;
use crate::extension::ErrorExt;
use crate::jid::Jid;
use crate::session::MessageSession;
use crate::stanza::{Iq, Message, MessageType, Presence, Subscription};
use crate::tag::Tag;
use crate::tls::CertInfo;
use crate::{Statistics, StreamEvent};

/// Receiver of IQ stanzas: requests by registered extension type, and
/// responses correlated by id.
pub trait IqHandler: Send + Sync {
    /// An incoming `get`/`set` carrying an extension this handler
    /// registered for. Return `true` once consumed; an unconsumed
    /// request is answered with `service-unavailable` by the engine.
    fn handle_iq(&self, iq: &Iq) -> bool;

    /// The `result`/`error` answering an id this handler was attached
    /// to at send time. Fires exactly once per tracked id.
    fn handle_iq_id(&self, iq: &Iq, context: i32);
}

pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, msg: &Message);
}

pub trait PresenceHandler: Send + Sync {
    fn handle_presence(&self, presence: &Presence);
}

pub trait SubscriptionHandler: Send + Sync {
    fn handle_subscription(&self, subscription: &Subscription);
}

/// Receiver of depth-1 elements in a foreign namespace, matched by
/// `(name, xmlns)`.
pub trait TagHandler: Send + Sync {
    fn handle_tag(&self, tag: &Tag);
}

/// Lifecycle notifications for the connection as a whole.
pub trait ConnectionListener: Send + Sync {
    fn on_connect(&self) {}

    fn on_disconnect(&self, _reason: &ConnectionError) {}

    /// Inspect the peer certificate; return `false` to abort the
    /// connection.
    fn on_tls_connect(&self, _info: &CertInfo) -> bool {
        true
    }

    fn on_resource_bind(&self, _resource: &str) {}

    fn on_resource_bind_error(&self, _error: Option<&ErrorExt>) {}

    fn on_session_create_error(&self, _error: Option<&ErrorExt>) {}

    fn on_stream_event(&self, _event: StreamEvent) {}
}

pub trait StatisticsHandler: Send + Sync {
    fn handle_statistics(&self, stats: &Statistics);
}

/// A mediated MUC invitation (XEP-0045 §7.8.2), surfaced without any
/// room-protocol dependency.
#[derive(Debug, Clone)]
pub struct MucInvitation {
    /// The room the invitation points at.
    pub room: Jid,
    /// Who extended the invitation.
    pub from: Jid,
    pub reason: String,
    pub body: String,
    pub password: String,
    pub continued: bool,
    pub thread: String,
}

pub trait MucInvitationHandler: Send + Sync {
    fn handle_invitation(&self, invitation: &MucInvitation);
}

/// Notified when the engine opens a [`MessageSession`] for a peer that
/// has no matching session yet.
pub trait MessageSessionHandler: Send + Sync {
    fn handle_message_session(&self, session: &Arc<MessageSession>);
}

/// An id-tracked IQ in flight.
pub(crate) struct IqTrack {
    pub handler: Arc<dyn IqHandler>,
    pub context: i32,
}

pub(crate) struct TagHandlerEntry {
    pub name: String,
    pub xmlns: String,
    pub handler: Arc<dyn TagHandler>,
}

/// Index into the per-subtype message-session-handler slots.
fn session_handler_slot(subtype: MessageType) -> Option<usize> {
    match subtype {
        MessageType::Chat => Some(0),
        MessageType::Normal => Some(1),
        MessageType::Groupchat => Some(2),
        MessageType::Headline => Some(3),
        _ => None,
    }
}

/// All registration tables of one session.
#[derive(Default)]
pub struct HandlerRegistry {
    pub(crate) iq_id_handlers: Mutex<HashMap<String, IqTrack>>,
    pub(crate) iq_ext_handlers: Mutex<Vec<(i32, Arc<dyn IqHandler>)>>,
    pub(crate) message_handlers: Vec<Arc<dyn MessageHandler>>,
    pub(crate) presence_handlers: Vec<Arc<dyn PresenceHandler>>,
    pub(crate) presence_jid_handlers: Vec<(Jid, Arc<dyn PresenceHandler>)>,
    pub(crate) subscription_handlers: Vec<Arc<dyn SubscriptionHandler>>,
    pub(crate) tag_handlers: Vec<TagHandlerEntry>,
    pub(crate) connection_listeners: Vec<Arc<dyn ConnectionListener>>,
    pub(crate) message_sessions: Vec<Arc<MessageSession>>,
    pub(crate) message_session_handlers: [Option<Arc<dyn MessageSessionHandler>>; 4],
    pub(crate) statistics_handler: Option<Arc<dyn StatisticsHandler>>,
    pub(crate) muc_invitation_handler: Option<Arc<dyn MucInvitationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    /// Track an outbound IQ id. May be called while dispatch runs.
    pub fn track_iq_id(&self, id: &str, handler: Arc<dyn IqHandler>, context: i32) {
        let mut map = self.iq_id_handlers.lock().unwrap();
        map.insert(id.to_string(), IqTrack { handler, context });
    }

    /// Drop every tracked id pointing at this handler.
    pub fn remove_id_handler(&self, handler: &Arc<dyn IqHandler>) {
        let mut map = self.iq_id_handlers.lock().unwrap();
        map.retain(|_, track| !Arc::ptr_eq(&track.handler, handler));
    }

    /// Register an IQ handler for an extension type. Multiple handlers
    /// per type are allowed and asked in registration order;
    /// re-registering the same pair is a no-op.
    pub fn register_iq_handler(&self, handler: Arc<dyn IqHandler>, ext_type: i32) {
        let mut list = self.iq_ext_handlers.lock().unwrap();
        if list.iter().any(|(t, h)| *t == ext_type && Arc::ptr_eq(h, &handler)) {
            return;
        }
        list.push((ext_type, handler));
    }

    pub fn remove_iq_handler(&self, handler: &Arc<dyn IqHandler>, ext_type: i32) {
        let mut list = self.iq_ext_handlers.lock().unwrap();
        list.retain(|(t, h)| *t != ext_type || !Arc::ptr_eq(h, handler));
    }

    pub fn register_message_handler(&mut self, handler: Arc<dyn MessageHandler>) {
        self.message_handlers.push(handler);
    }

    pub fn remove_message_handler(&mut self, handler: &Arc<dyn MessageHandler>) {
        self.message_handlers.retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn register_presence_handler(&mut self, handler: Arc<dyn PresenceHandler>) {
        self.presence_handlers.push(handler);
    }

    pub fn remove_presence_handler(&mut self, handler: &Arc<dyn PresenceHandler>) {
        self.presence_handlers.retain(|h| !Arc::ptr_eq(h, handler));
    }

    /// Register a presence handler for one bare JID. Matching
    /// per-JID handlers shadow the global list.
    pub fn register_presence_jid_handler(&mut self, jid: &Jid, handler: Arc<dyn PresenceHandler>) {
        self.presence_jid_handlers.push((Jid::new(jid.bare()), handler));
    }

    /// Remove per-JID presence registrations. A `None` handler removes
    /// every registration for the JID.
    pub fn remove_presence_jid_handler(&mut self, jid: &Jid, handler: Option<&Arc<dyn PresenceHandler>>) {
        self.presence_jid_handlers.retain(|(j, h)| {
            j.bare() != jid.bare() || handler.map(|hh| !Arc::ptr_eq(h, hh)).unwrap_or(false)
        });
    }

    pub fn register_subscription_handler(&mut self, handler: Arc<dyn SubscriptionHandler>) {
        self.subscription_handlers.push(handler);
    }

    pub fn remove_subscription_handler(&mut self, handler: &Arc<dyn SubscriptionHandler>) {
        self.subscription_handlers.retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn register_tag_handler(&mut self, handler: Arc<dyn TagHandler>, name: &str, xmlns: &str) {
        if name.is_empty() {
            return;
        }
        self.tag_handlers.push(TagHandlerEntry {
            name: name.to_string(),
            xmlns: xmlns.to_string(),
            handler,
        });
    }

    pub fn remove_tag_handler(&mut self, handler: &Arc<dyn TagHandler>, name: &str, xmlns: &str) {
        self.tag_handlers
            .retain(|e| e.name != name || e.xmlns != xmlns || !Arc::ptr_eq(&e.handler, handler));
    }

    pub fn register_connection_listener(&mut self, listener: Arc<dyn ConnectionListener>) {
        self.connection_listeners.push(listener);
    }

    pub fn remove_connection_listener(&mut self, listener: &Arc<dyn ConnectionListener>) {
        self.connection_listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn register_message_session(&mut self, session: Arc<MessageSession>) {
        self.message_sessions.push(session);
    }

    pub fn dispose_message_session(&mut self, session: &Arc<MessageSession>) {
        self.message_sessions.retain(|s| !Arc::ptr_eq(s, session));
    }

    /// Install a session opener for the subtypes in `types` (a
    /// [`MessageType`] bitmask; `0` selects every subtype).
    pub fn register_message_session_handler(&mut self, handler: Arc<dyn MessageSessionHandler>, types: i32) {
        for (slot, subtype) in [
            MessageType::Chat,
            MessageType::Normal,
            MessageType::Groupchat,
            MessageType::Headline,
        ]
        .into_iter()
        .enumerate()
        {
            if types == 0 || types & subtype as i32 != 0 {
                self.message_session_handlers[slot] = Some(handler.clone());
            }
        }
    }

    pub(crate) fn message_session_handler(&self, subtype: MessageType) -> Option<Arc<dyn MessageSessionHandler>> {
        session_handler_slot(subtype).and_then(|slot| self.message_session_handlers[slot].clone())
    }

    pub fn register_statistics_handler(&mut self, handler: Arc<dyn StatisticsHandler>) {
        self.statistics_handler = Some(handler);
    }

    pub fn remove_statistics_handler(&mut self) {
        self.statistics_handler = None;
    }

    pub fn register_muc_invitation_handler(&mut self, handler: Arc<dyn MucInvitationHandler>) {
        self.muc_invitation_handler = Some(handler);
    }

    pub fn remove_muc_invitation_handler(&mut self) {
        self.muc_invitation_handler = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingIq;

    impl IqHandler for CountingIq {
        fn handle_iq(&self, _iq: &Iq) -> bool {
            true
        }
        fn handle_iq_id(&self, _iq: &Iq, _context: i32) {}
    }

    #[test]
    fn test_iq_ext_registration_is_idempotent_per_pair() {
        let registry = HandlerRegistry::new();
        let handler: Arc<dyn IqHandler> = Arc::new(CountingIq);
        registry.register_iq_handler(handler.clone(), 7);
        registry.register_iq_handler(handler.clone(), 7);
        assert_eq!(registry.iq_ext_handlers.lock().unwrap().len(), 1);

        registry.register_iq_handler(handler.clone(), 8);
        assert_eq!(registry.iq_ext_handlers.lock().unwrap().len(), 2);

        registry.remove_iq_handler(&handler, 7);
        let list = registry.iq_ext_handlers.lock().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].0, 8);
    }

    #[test]
    fn test_remove_id_handler_drops_all_tracked_ids() {
        let registry = HandlerRegistry::new();
        let handler: Arc<dyn IqHandler> = Arc::new(CountingIq);
        let other: Arc<dyn IqHandler> = Arc::new(CountingIq);
        registry.track_iq_id("a", handler.clone(), 0);
        registry.track_iq_id("b", handler.clone(), 1);
        registry.track_iq_id("c", other.clone(), 2);

        registry.remove_id_handler(&handler);
        let map = registry.iq_id_handlers.lock().unwrap();
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("c"));
    }

    #[test]
    fn test_session_handler_types_mask() {
        struct Opener;
        impl MessageSessionHandler for Opener {
            fn handle_message_session(&self, _session: &Arc<MessageSession>) {}
        }

        let mut registry = HandlerRegistry::new();
        let opener: Arc<dyn MessageSessionHandler> = Arc::new(Opener);
        registry.register_message_session_handler(opener, MessageType::Chat as i32 | MessageType::Normal as i32);

        assert!(registry.message_session_handler(MessageType::Chat).is_some());
        assert!(registry.message_session_handler(MessageType::Normal).is_some());
        assert!(registry.message_session_handler(MessageType::Groupchat).is_none());
        assert!(registry.message_session_handler(MessageType::Error).is_none());
    }

    #[test]
    fn test_presence_jid_handler_removal_by_jid_only() {
        struct P;
        impl PresenceHandler for P {
            fn handle_presence(&self, _presence: &Presence) {}
        }

        let mut registry = HandlerRegistry::new();
        let h1: Arc<dyn PresenceHandler> = Arc::new(P);
        let h2: Arc<dyn PresenceHandler> = Arc::new(P);
        let jid = Jid::new("juliet@example.com/anywhere");
        registry.register_presence_jid_handler(&jid, h1);
        registry.register_presence_jid_handler(&jid, h2);
        assert_eq!(registry.presence_jid_handlers.len(), 2);
        // Registrations store the bare form.
        assert_eq!(registry.presence_jid_handlers[0].0.full(), "juliet@example.com");

        registry.remove_presence_jid_handler(&jid, None);
        assert!(registry.presence_jid_handlers.is_empty());
    }
}
