//! The three stanza families plus presence subscriptions, with their
//! subtype taxonomies and wire conversions.

use crate::extension::{StanzaExtension, EXT_ERROR};
use crate::extension::ErrorExt;
use crate::jid::Jid;
use crate::tag::Tag;

/// IQ semantics (RFC 6120 §8.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
    Invalid,
}

impl IqType {
    fn from_attr(s: Option<&str>) -> IqType {
        match s {
            Some("get") => IqType::Get,
            Some("set") => IqType::Set,
            Some("result") => IqType::Result,
            Some("error") => IqType::Error,
            _ => IqType::Invalid,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
            IqType::Invalid => "",
        }
    }
}

/// Message classes (RFC 6121 §5.2.2). The discriminants form a bitmask
/// so message-session type filters can combine them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageType {
    Chat = 1,
    Error = 2,
    Groupchat = 4,
    Headline = 8,
    Normal = 16,
    Invalid = 0,
}

impl MessageType {
    fn from_attr(s: Option<&str>) -> MessageType {
        match s {
            Some("chat") => MessageType::Chat,
            Some("error") => MessageType::Error,
            Some("groupchat") => MessageType::Groupchat,
            Some("headline") => MessageType::Headline,
            // RFC 6121: no 'type' attribute means normal.
            Some("normal") | None => MessageType::Normal,
            _ => MessageType::Invalid,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::Error => "error",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Normal => "normal",
            MessageType::Invalid => "",
        }
    }
}

/// Presence kinds, with `<show/>` folded in the way clients consume
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Chat,
    Away,
    Dnd,
    Xa,
    Unavailable,
    Probe,
    Error,
    Invalid,
}

impl PresenceType {
    fn from_tag(tag: &Tag) -> PresenceType {
        match tag.attribute("type") {
            Some("unavailable") => return PresenceType::Unavailable,
            Some("probe") => return PresenceType::Probe,
            Some("error") => return PresenceType::Error,
            Some(_) => return PresenceType::Invalid,
            None => {}
        }
        match tag.find_child("show").map(|s| s.cdata()) {
            Some("chat") => PresenceType::Chat,
            Some("away") => PresenceType::Away,
            Some("dnd") => PresenceType::Dnd,
            Some("xa") => PresenceType::Xa,
            Some(_) => PresenceType::Invalid,
            None => PresenceType::Available,
        }
    }

    fn show_str(self) -> Option<&'static str> {
        match self {
            PresenceType::Chat => Some("chat"),
            PresenceType::Away => Some("away"),
            PresenceType::Dnd => Some("dnd"),
            PresenceType::Xa => Some("xa"),
            _ => None,
        }
    }

    fn type_attr(self) -> Option<&'static str> {
        match self {
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Error => Some("error"),
            _ => None,
        }
    }
}

/// Presence subscription management (RFC 6121 §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionType {
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Invalid,
}

impl SubscriptionType {
    pub fn from_attr(s: Option<&str>) -> SubscriptionType {
        match s {
            Some("subscribe") => SubscriptionType::Subscribe,
            Some("subscribed") => SubscriptionType::Subscribed,
            Some("unsubscribe") => SubscriptionType::Unsubscribe,
            Some("unsubscribed") => SubscriptionType::Unsubscribed,
            _ => SubscriptionType::Invalid,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            SubscriptionType::Subscribe => "subscribe",
            SubscriptionType::Subscribed => "subscribed",
            SubscriptionType::Unsubscribe => "unsubscribe",
            SubscriptionType::Unsubscribed => "unsubscribed",
            SubscriptionType::Invalid => "",
        }
    }
}

fn common_attrs(tag: &mut Tag, from: &Jid, to: &Jid, id: &str, lang: &str) {
    if !to.is_empty() {
        tag.set_attribute("to", to.full());
    }
    if !from.is_empty() {
        tag.set_attribute("from", from.full());
    }
    if !id.is_empty() {
        tag.set_attribute("id", id);
    }
    if !lang.is_empty() {
        tag.set_attribute("xml:lang", lang);
    }
}

fn jid_attr(tag: &Tag, key: &str) -> Jid {
    tag.attribute(key).map(Jid::new).unwrap_or_default()
}

/// Request/response stanza.
#[derive(Debug)]
pub struct Iq {
    pub subtype: IqType,
    pub from: Jid,
    pub to: Jid,
    pub id: String,
    pub lang: String,
    /// The payload child for outbound IQs built by hand; inbound
    /// payloads surface through `extensions`.
    pub payload: Option<Tag>,
    pub extensions: Vec<Box<dyn StanzaExtension>>,
}

impl Iq {
    pub fn new(subtype: IqType, to: Jid, id: &str) -> Iq {
        Iq {
            subtype,
            from: Jid::default(),
            to,
            id: id.to_string(),
            lang: String::new(),
            payload: None,
            extensions: Vec::new(),
        }
    }

    pub fn from_tag(tag: &Tag) -> Iq {
        Iq {
            subtype: IqType::from_attr(tag.attribute("type")),
            from: jid_attr(tag, "from"),
            to: jid_attr(tag, "to"),
            id: tag.attribute("id").unwrap_or_default().to_string(),
            lang: tag.attribute("xml:lang").unwrap_or_default().to_string(),
            payload: None,
            extensions: Vec::new(),
        }
    }

    pub fn add_extension(&mut self, ext: Box<dyn StanzaExtension>) {
        self.extensions.push(ext);
    }

    /// First extension of the given type, downcast by the caller.
    pub fn find_extension(&self, ext_type: i32) -> Option<&dyn StanzaExtension> {
        self.extensions
            .iter()
            .find(|e| e.extension_type() == ext_type)
            .map(Box::as_ref)
    }

    /// The stanza error payload, when `subtype` is `Error`.
    pub fn error(&self) -> Option<&ErrorExt> {
        self.find_extension(EXT_ERROR)
            .and_then(|e| e.as_any().downcast_ref::<ErrorExt>())
    }

    pub fn tag(&self) -> Tag {
        let mut tag = Tag::new("iq");
        common_attrs(&mut tag, &self.from, &self.to, &self.id, &self.lang);
        if self.subtype != IqType::Invalid {
            tag.set_attribute("type", self.subtype.as_str());
        }
        if let Some(payload) = &self.payload {
            tag.add_child(payload.clone());
        }
        for ext in &self.extensions {
            tag.add_child(ext.tag());
        }
        tag
    }
}

/// One-to-one or broadcast message.
#[derive(Debug)]
pub struct Message {
    pub subtype: MessageType,
    pub from: Jid,
    pub to: Jid,
    pub id: String,
    pub lang: String,
    pub body: String,
    pub subject: String,
    pub thread: String,
    pub extensions: Vec<Box<dyn StanzaExtension>>,
}

impl Message {
    pub fn new(subtype: MessageType, to: Jid, body: &str) -> Message {
        Message {
            subtype,
            from: Jid::default(),
            to,
            id: String::new(),
            lang: String::new(),
            body: body.to_string(),
            subject: String::new(),
            thread: String::new(),
            extensions: Vec::new(),
        }
    }

    pub fn from_tag(tag: &Tag) -> Message {
        Message {
            subtype: MessageType::from_attr(tag.attribute("type")),
            from: jid_attr(tag, "from"),
            to: jid_attr(tag, "to"),
            id: tag.attribute("id").unwrap_or_default().to_string(),
            lang: tag.attribute("xml:lang").unwrap_or_default().to_string(),
            body: tag.find_child("body").map(|b| b.cdata().to_string()).unwrap_or_default(),
            subject: tag.find_child("subject").map(|s| s.cdata().to_string()).unwrap_or_default(),
            thread: tag.find_child("thread").map(|t| t.cdata().to_string()).unwrap_or_default(),
            extensions: Vec::new(),
        }
    }

    pub fn add_extension(&mut self, ext: Box<dyn StanzaExtension>) {
        self.extensions.push(ext);
    }

    pub fn tag(&self) -> Tag {
        let mut tag = Tag::new("message");
        common_attrs(&mut tag, &self.from, &self.to, &self.id, &self.lang);
        if self.subtype != MessageType::Invalid && self.subtype != MessageType::Normal {
            tag.set_attribute("type", self.subtype.as_str());
        }
        if !self.subject.is_empty() {
            let mut subject = Tag::new("subject");
            subject.set_cdata(&self.subject);
            tag.add_child(subject);
        }
        if !self.body.is_empty() {
            let mut body = Tag::new("body");
            body.set_cdata(&self.body);
            tag.add_child(body);
        }
        if !self.thread.is_empty() {
            let mut thread = Tag::new("thread");
            thread.set_cdata(&self.thread);
            tag.add_child(thread);
        }
        for ext in &self.extensions {
            tag.add_child(ext.tag());
        }
        tag
    }
}

/// Availability broadcast.
#[derive(Debug)]
pub struct Presence {
    pub subtype: PresenceType,
    pub from: Jid,
    pub to: Jid,
    pub id: String,
    pub lang: String,
    pub status: String,
    pub priority: i8,
    pub extensions: Vec<Box<dyn StanzaExtension>>,
}

impl Presence {
    pub fn new(subtype: PresenceType, to: Jid, status: &str, priority: i8) -> Presence {
        Presence {
            subtype,
            from: Jid::default(),
            to,
            id: String::new(),
            lang: String::new(),
            status: status.to_string(),
            priority,
            extensions: Vec::new(),
        }
    }

    pub fn from_tag(tag: &Tag) -> Presence {
        Presence {
            subtype: PresenceType::from_tag(tag),
            from: jid_attr(tag, "from"),
            to: jid_attr(tag, "to"),
            id: tag.attribute("id").unwrap_or_default().to_string(),
            lang: tag.attribute("xml:lang").unwrap_or_default().to_string(),
            status: tag.find_child("status").map(|s| s.cdata().to_string()).unwrap_or_default(),
            priority: tag
                .find_child("priority")
                .and_then(|p| p.cdata().parse().ok())
                .unwrap_or(0),
            extensions: Vec::new(),
        }
    }

    pub fn add_extension(&mut self, ext: Box<dyn StanzaExtension>) {
        self.extensions.push(ext);
    }

    pub fn tag(&self) -> Tag {
        let mut tag = Tag::new("presence");
        common_attrs(&mut tag, &self.from, &self.to, &self.id, &self.lang);
        if let Some(t) = self.subtype.type_attr() {
            tag.set_attribute("type", t);
        }
        if let Some(show) = self.subtype.show_str() {
            let mut s = Tag::new("show");
            s.set_cdata(show);
            tag.add_child(s);
        }
        if !self.status.is_empty() {
            let mut status = Tag::new("status");
            status.set_cdata(&self.status);
            tag.add_child(status);
        }
        if self.priority != 0 {
            let mut priority = Tag::new("priority");
            priority.set_cdata(&self.priority.to_string());
            tag.add_child(priority);
        }
        for ext in &self.extensions {
            tag.add_child(ext.tag());
        }
        tag
    }
}

/// Subscription-state presence, split from plain presence the way the
/// dispatch layer treats it.
#[derive(Debug)]
pub struct Subscription {
    pub subtype: SubscriptionType,
    pub from: Jid,
    pub to: Jid,
    pub id: String,
    pub lang: String,
    pub status: String,
    pub extensions: Vec<Box<dyn StanzaExtension>>,
}

impl Subscription {
    pub fn new(subtype: SubscriptionType, to: Jid, status: &str) -> Subscription {
        Subscription {
            subtype,
            from: Jid::default(),
            to,
            id: String::new(),
            lang: String::new(),
            status: status.to_string(),
            extensions: Vec::new(),
        }
    }

    pub fn from_tag(tag: &Tag) -> Subscription {
        Subscription {
            subtype: SubscriptionType::from_attr(tag.attribute("type")),
            from: jid_attr(tag, "from"),
            to: jid_attr(tag, "to"),
            id: tag.attribute("id").unwrap_or_default().to_string(),
            lang: tag.attribute("xml:lang").unwrap_or_default().to_string(),
            status: tag.find_child("status").map(|s| s.cdata().to_string()).unwrap_or_default(),
            extensions: Vec::new(),
        }
    }

    pub fn tag(&self) -> Tag {
        let mut tag = Tag::new("presence");
        common_attrs(&mut tag, &self.from, &self.to, &self.id, &self.lang);
        if self.subtype != SubscriptionType::Invalid {
            tag.set_attribute("type", self.subtype.as_str());
        }
        if !self.status.is_empty() {
            let mut status = Tag::new("status");
            status.set_cdata(&self.status);
            tag.add_child(status);
        }
        for ext in &self.extensions {
            tag.add_child(ext.tag());
        }
        tag
    }
}
