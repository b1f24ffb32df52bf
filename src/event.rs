//! High-level events yielded by [`Client::recv`](crate::Client::recv).

use crate::stanza;

#[derive(Debug, Clone)]
pub enum Event {
    /// An incoming message
    Chat(Chat),
    /// An incoming presence update
    Presence(Presence),
}

/// A chat message, incoming or outgoing
#[derive(Debug, Clone, Default)]
pub struct Chat {
    /// The other side of the conversation
    pub remote: String,
    /// chat, groupchat, headline, normal, or error
    pub type_: String,
    /// Body text
    pub text: String,
    /// Character data of message children outside the standard set
    pub other: Vec<String>,
}

/// A presence update as seen by the session layer
#[derive(Debug, Clone, Default)]
pub struct Presence {
    pub from: String,
    pub to: String,
    pub type_: String,
    pub show: String,
}

impl From<stanza::Message> for Chat {
    fn from(message: stanza::Message) -> Self {
        Chat {
            remote: message.from,
            type_: message.type_,
            text: message.body,
            other: message.other,
        }
    }
}

impl From<stanza::Presence> for Presence {
    fn from(presence: stanza::Presence) -> Self {
        Presence {
            from: presence.from,
            to: presence.to,
            type_: presence.type_,
            show: presence.show,
        }
    }
}
