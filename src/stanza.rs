//! Typed views over the fixed family of stream-level elements, selected
//! by `(namespace, local-name)` through a single decode function.

use minidom::Element;

use crate::error::ProtocolError;
use crate::ns;

/// Everything a server may legally send at the top level of a stream.
#[derive(Debug)]
pub enum Stanza {
    StreamFeatures(StreamFeatures),
    StreamError(StreamError),
    StartTls(StartTls),
    TlsProceed,
    TlsFailure,
    SaslMechanisms(Vec<String>),
    /// Base64 text content of a `<challenge/>`
    SaslChallenge(String),
    SaslSuccess,
    SaslFailure(SaslFailure),
    Bind(Bind),
    Message(Message),
    Presence(Presence),
    Iq(Iq),
    StanzaError(StanzaError),
}

impl Stanza {
    /// Decode a top-level element into its typed variant. Anything
    /// outside the table is an unexpected stanza.
    pub fn decode(el: &Element) -> Result<Stanza, ProtocolError> {
        match (el.ns().as_str(), el.name()) {
            (ns::STREAM, "features") => Ok(Stanza::StreamFeatures(StreamFeatures::parse(el))),
            (ns::STREAM, "error") => Ok(Stanza::StreamError(StreamError::parse(el))),
            (ns::TLS, "starttls") => Ok(Stanza::StartTls(StartTls::parse(el))),
            (ns::TLS, "proceed") => Ok(Stanza::TlsProceed),
            (ns::TLS, "failure") => Ok(Stanza::TlsFailure),
            (ns::SASL, "mechanisms") => Ok(Stanza::SaslMechanisms(parse_mechanisms(el))),
            (ns::SASL, "challenge") => Ok(Stanza::SaslChallenge(el.text())),
            (ns::SASL, "success") => Ok(Stanza::SaslSuccess),
            (ns::SASL, "failure") => Ok(Stanza::SaslFailure(SaslFailure::parse(el))),
            (ns::BIND, "bind") => Ok(Stanza::Bind(Bind::parse(el))),
            (ns::CLIENT, "message") => Ok(Stanza::Message(Message::parse(el))),
            (ns::CLIENT, "presence") => Ok(Stanza::Presence(Presence::parse(el))),
            (ns::CLIENT, "iq") => Ok(Stanza::Iq(Iq::parse(el))),
            (ns::CLIENT, "error") => Ok(Stanza::StanzaError(StanzaError::parse(el))),
            (other_ns, other_name) => Err(ProtocolError::UnexpectedStanza {
                ns: other_ns.to_owned(),
                name: other_name.to_owned(),
            }),
        }
    }
}

/// `<stream:features/>`, advertised after every stream open
#[derive(Debug, Clone, Default)]
pub struct StreamFeatures {
    pub starttls: Option<StartTls>,
    pub mechanisms: Vec<String>,
    pub bind: bool,
    pub session: bool,
}

impl StreamFeatures {
    pub fn parse(el: &Element) -> Self {
        StreamFeatures {
            starttls: el.get_child("starttls", ns::TLS).map(StartTls::parse),
            mechanisms: el
                .get_child("mechanisms", ns::SASL)
                .map(parse_mechanisms)
                .unwrap_or_default(),
            bind: el.has_child("bind", ns::BIND),
            session: el.has_child("session", ns::SESSION),
        }
    }

    pub fn can_starttls(&self) -> bool {
        self.starttls.is_some()
    }

    pub fn starttls_required(&self) -> bool {
        self.starttls.as_ref().map(|s| s.required).unwrap_or(false)
    }
}

fn parse_mechanisms(el: &Element) -> Vec<String> {
    el.children()
        .filter(|child| child.is("mechanism", ns::SASL))
        .map(|child| child.text())
        .collect()
}

/// `<starttls/>` inside stream features
#[derive(Debug, Clone)]
pub struct StartTls {
    pub required: bool,
}

impl StartTls {
    fn parse(el: &Element) -> Self {
        StartTls {
            required: el.has_child("required", ns::TLS),
        }
    }
}

/// `<stream:error/>`
#[derive(Debug, Clone)]
pub struct StreamError {
    /// Local name of the defined condition
    pub condition: String,
    pub text: String,
}

impl StreamError {
    fn parse(el: &Element) -> Self {
        let condition = el
            .children()
            .find(|child| child.name() != "text")
            .map(|child| child.name().to_owned())
            .unwrap_or_default();
        let text = el
            .children()
            .find(|child| child.name() == "text")
            .map(|child| child.text())
            .unwrap_or_default();
        StreamError { condition, text }
    }
}

/// `<failure/>` in the SASL namespace
#[derive(Debug, Clone)]
pub struct SaslFailure {
    /// Local name of the inner element, describing what failed
    pub condition: Option<String>,
}

impl SaslFailure {
    fn parse(el: &Element) -> Self {
        SaslFailure {
            condition: el.children().next().map(|child| child.name().to_owned()),
        }
    }
}

/// `<bind/>` payload of a bind IQ
#[derive(Debug, Clone, Default)]
pub struct Bind {
    pub jid: String,
    pub resource: String,
}

impl Bind {
    fn parse(el: &Element) -> Self {
        Bind {
            jid: el
                .get_child("jid", ns::BIND)
                .map(|child| child.text())
                .unwrap_or_default(),
            resource: el
                .get_child("resource", ns::BIND)
                .map(|child| child.text())
                .unwrap_or_default(),
        }
    }
}

/// `<message/>` (RFC 3921 B.1)
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub from: String,
    pub id: String,
    pub to: String,
    /// chat, error, groupchat, headline, or normal
    pub type_: String,
    pub subject: String,
    pub body: String,
    pub thread: String,
    /// Character data of children outside the known set
    pub other: Vec<String>,
}

impl Message {
    fn parse(el: &Element) -> Self {
        let mut message = Message {
            from: attr(el, "from"),
            id: attr(el, "id"),
            to: attr(el, "to"),
            type_: attr(el, "type"),
            ..Message::default()
        };
        for child in el.children() {
            match (child.ns().as_str(), child.name()) {
                (ns::CLIENT, "subject") => message.subject = child.text(),
                (ns::CLIENT, "body") => message.body = child.text(),
                (ns::CLIENT, "thread") => message.thread = child.text(),
                _ => message.other.push(child.text()),
            }
        }
        message
    }
}

/// `<presence/>` (RFC 3921 B.1)
#[derive(Debug, Clone, Default)]
pub struct Presence {
    pub from: String,
    pub id: String,
    pub to: String,
    /// error, probe, subscribe, subscribed, unavailable, unsubscribe,
    /// unsubscribed, or empty for available
    pub type_: String,
    /// away, chat, dnd, xa
    pub show: String,
    pub status: String,
    pub priority: String,
    pub error: Option<StanzaError>,
}

impl Presence {
    fn parse(el: &Element) -> Self {
        Presence {
            from: attr(el, "from"),
            id: attr(el, "id"),
            to: attr(el, "to"),
            type_: attr(el, "type"),
            show: child_text(el, "show"),
            status: child_text(el, "status"),
            priority: child_text(el, "priority"),
            error: el.get_child("error", ns::CLIENT).map(StanzaError::parse),
        }
    }
}

/// `<iq/>` info/query (RFC 3921 B.1)
#[derive(Debug, Clone, Default)]
pub struct Iq {
    pub from: String,
    pub id: String,
    pub to: String,
    /// get, set, result, or error
    pub type_: String,
    pub error: Option<StanzaError>,
    pub bind: Option<Bind>,
}

impl Iq {
    fn parse(el: &Element) -> Self {
        Iq {
            from: attr(el, "from"),
            id: attr(el, "id"),
            to: attr(el, "to"),
            type_: attr(el, "type"),
            error: el.get_child("error", ns::CLIENT).map(StanzaError::parse),
            bind: el.get_child("bind", ns::BIND).map(Bind::parse),
        }
    }
}

/// `<error/>` child of a stanza
#[derive(Debug, Clone, Default)]
pub struct StanzaError {
    pub code: String,
    pub type_: String,
    /// Local name of the defined condition
    pub condition: String,
    pub text: String,
}

impl StanzaError {
    fn parse(el: &Element) -> Self {
        StanzaError {
            code: attr(el, "code"),
            type_: attr(el, "type"),
            condition: el
                .children()
                .find(|child| child.name() != "text")
                .map(|child| child.name().to_owned())
                .unwrap_or_default(),
            text: el
                .children()
                .find(|child| child.name() == "text")
                .map(|child| child.text())
                .unwrap_or_default(),
        }
    }
}

fn attr(el: &Element, name: &str) -> String {
    el.attr(name).unwrap_or_default().to_owned()
}

fn child_text(el: &Element, name: &str) -> String {
    el.get_child(name, ns::CLIENT)
        .map(|child| child.text())
        .unwrap_or_default()
}
