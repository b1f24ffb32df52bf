//! XML framing over the byte stream: incremental, namespace-aware
//! extraction of the `<stream:stream>` header and complete top-level
//! stanzas, and serialization of outbound fragments.

use std::collections::HashMap;

use bytes::{Buf, BufMut, BytesMut};
use minidom::Element;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{Error, ProtocolError};

/// The opening `<stream:stream>` tag: resolved qualified name plus raw
/// attributes (`xmlns`/`xmlns:*` declarations included).
#[derive(Debug, Clone)]
pub struct StreamHeader {
    /// Resolved namespace of the root element
    pub ns: String,
    /// Local name of the root element
    pub name: String,
    /// Attributes as they appeared on the tag
    pub attrs: HashMap<String, String>,
}

/// A decoded or to-be-encoded unit of the XML stream
#[derive(Debug)]
pub enum Packet {
    /// Stream header
    StreamStart(StreamHeader),
    /// A complete top-level child of the stream
    Stanza(Element),
    /// Text to send, XML-escaped
    Text(String),
    /// Text to send verbatim; the caller is responsible for well-formedness
    Raw(String),
    /// `</stream:stream>`
    StreamEnd,
}

/// Namespace declarations captured from the stream header, replayed onto
/// a synthetic wrapper so that extracted children parse with the same
/// namespaces in scope as on the wire.
struct RootScope {
    decls: Vec<(Option<String>, String)>,
}

impl RootScope {
    fn from_header(header: &StreamHeader) -> Self {
        let mut decls = Vec::new();
        for (name, value) in &header.attrs {
            if name == "xmlns" {
                decls.push((None, value.clone()));
            } else if let Some(prefix) = name.strip_prefix("xmlns:") {
                decls.push((Some(prefix.to_owned()), value.clone()));
            }
        }
        RootScope { decls }
    }
}

enum Scan {
    NeedMore,
    Found(Packet, usize),
}

pub struct XmppCodec {
    root: Option<RootScope>,
    debug: bool,
}

impl XmppCodec {
    pub fn new() -> Self {
        XmppCodec {
            root: None,
            debug: false,
        }
    }

    /// Mirror everything decoded from the transport to standard output,
    /// newline-separated. Writes are not mirrored.
    pub fn with_debug(debug: bool) -> Self {
        XmppCodec { root: None, debug }
    }
}

impl Default for XmppCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for XmppCodec {
    type Item = Packet;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, Error> {
        if buf.is_empty() {
            return Ok(None);
        }

        let scan = match &self.root {
            None => scan_stream_start(&buf[..])?,
            Some(scope) => scan_child(&buf[..], scope)?,
        };

        match scan {
            Scan::NeedMore => Ok(None),
            Scan::Found(packet, consumed) => {
                {
                    let chunk = String::from_utf8_lossy(&buf[..consumed]);
                    if self.debug {
                        println!("{}", chunk);
                    }
                    trace!("<< {}", chunk);
                }
                buf.advance(consumed);
                if let Packet::StreamStart(header) = &packet {
                    self.root = Some(RootScope::from_header(header));
                }
                Ok(Some(packet))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>, Error> {
        self.decode(buf)
    }
}

impl Encoder<Packet> for XmppCodec {
    type Error = Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Error> {
        match item {
            Packet::StreamStart(header) => {
                let mut buf = String::from("<?xml version='1.0'?><stream:stream");
                for (name, value) in &header.attrs {
                    buf.push_str(&format!(" {}='{}'", name, escape(value.as_str())));
                }
                buf.push('>');
                trace!(">> {}", buf);
                dst.put_slice(buf.as_bytes());
            }
            Packet::Stanza(stanza) => {
                let mut bytes = Vec::new();
                stanza.write_to(&mut bytes)?;
                trace!(">> {}", String::from_utf8_lossy(&bytes));
                dst.put_slice(&bytes);
            }
            Packet::Text(text) => {
                let escaped = escape(text.as_str());
                trace!(">> {}", escaped);
                dst.put_slice(escaped.as_bytes());
            }
            Packet::Raw(text) => {
                trace!(">> {}", text);
                dst.put_slice(text.as_bytes());
            }
            Packet::StreamEnd => {
                trace!(">> </stream:stream>");
                dst.put_slice(b"</stream:stream>");
            }
        }
        Ok(())
    }
}

/// Skip the XML declaration, processing instructions and whitespace until
/// the first start tag, then return it as a [`StreamHeader`].
fn scan_stream_start(buf: &[u8]) -> Result<Scan, ProtocolError> {
    let mut reader = Reader::from_reader(buf);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_event() {
            Ok(Event::Decl(_))
            | Ok(Event::PI(_))
            | Ok(Event::Comment(_))
            | Ok(Event::DocType(_))
            | Ok(Event::Text(_))
            | Ok(Event::CData(_)) => continue,
            Ok(Event::Start(tag)) | Ok(Event::Empty(tag)) => {
                let end = reader.buffer_position() as usize;
                let header = parse_header(&tag);
                return Ok(Scan::Found(Packet::StreamStart(header), end));
            }
            Ok(Event::End(tag)) => {
                return Err(ProtocolError::UnexpectedStreamHeader {
                    ns: String::new(),
                    name: String::from_utf8_lossy(tag.name().as_ref()).into_owned(),
                });
            }
            Ok(Event::Eof) => return Ok(Scan::NeedMore),
            // Partial tag still in flight over the wire
            Err(quick_xml::Error::Syntax(_)) => return Ok(Scan::NeedMore),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Extract one complete top-level child of the stream, skipping
/// inter-stanza whitespace (server keep-alives).
fn scan_child(buf: &[u8], scope: &RootScope) -> Result<Scan, ProtocolError> {
    // The stream footer closes an element whose start tag is long gone,
    // so it is matched textually before the depth scan.
    let content_start = buf
        .iter()
        .position(|&b| !matches!(b, b' ' | b'\t' | b'\r' | b'\n'));
    if let Some(start) = content_start {
        if buf[start..].starts_with(b"</stream:stream>") {
            let end = start + b"</stream:stream>".len();
            return Ok(Scan::Found(Packet::StreamEnd, end));
        }
    }

    let mut reader = Reader::from_reader(buf);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth = 0usize;
    let mut stanza_start = 0usize;

    loop {
        let pos = reader.buffer_position() as usize;
        match reader.read_event() {
            Ok(Event::Decl(_))
            | Ok(Event::PI(_))
            | Ok(Event::Comment(_))
            | Ok(Event::DocType(_))
            | Ok(Event::Text(_))
            | Ok(Event::CData(_)) => continue,
            Ok(Event::Start(_)) => {
                depth += 1;
                if depth == 1 {
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(_)) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    let stanza = parse_stanza(&buf[pos..end], scope)?;
                    return Ok(Scan::Found(Packet::Stanza(stanza), end));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    return Ok(Scan::Found(Packet::StreamEnd, end));
                }
                depth -= 1;
                if depth == 0 {
                    let end = reader.buffer_position() as usize;
                    let stanza = parse_stanza(&buf[stanza_start..end], scope)?;
                    return Ok(Scan::Found(Packet::Stanza(stanza), end));
                }
            }
            Ok(Event::Eof) => return Ok(Scan::NeedMore),
            // Partial tag still in flight over the wire
            Err(quick_xml::Error::Syntax(_)) => return Ok(Scan::NeedMore),
            Err(e) => return Err(e.into()),
        }
    }
}

/// Materialize an extracted fragment, re-declaring the stream header's
/// namespaces around it so prefixed elements (`stream:features`) and the
/// default namespace resolve as they did on the wire.
fn parse_stanza(fragment: &[u8], scope: &RootScope) -> Result<Element, ProtocolError> {
    let mut doc = String::with_capacity(fragment.len() + 128);
    doc.push_str("<wrapper");
    for (prefix, uri) in &scope.decls {
        match prefix {
            None => doc.push_str(&format!(" xmlns='{}'", escape(uri.as_str()))),
            Some(prefix) => {
                doc.push_str(&format!(" xmlns:{}='{}'", prefix, escape(uri.as_str())))
            }
        }
    }
    doc.push('>');
    doc.push_str(&String::from_utf8_lossy(fragment));
    doc.push_str("</wrapper>");

    let wrapper: Element = doc.parse().map_err(ProtocolError::Parser)?;
    wrapper
        .children()
        .next()
        .cloned()
        .ok_or(ProtocolError::UnexpectedStanza {
            ns: String::new(),
            name: String::new(),
        })
}

fn parse_header(tag: &BytesStart) -> StreamHeader {
    let mut attrs = HashMap::new();
    for attr in tag.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        attrs.insert(key, value);
    }

    let qname = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
    let (prefix, local) = match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_owned()), local.to_owned()),
        None => (None, qname),
    };
    let ns = match &prefix {
        Some(prefix) => attrs.get(&format!("xmlns:{}", prefix)).cloned(),
        None => attrs.get("xmlns").cloned(),
    }
    .unwrap_or_default();

    StreamHeader {
        ns,
        name: local,
        attrs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ns;

    const STREAM_OPEN: &[u8] = b"<?xml version='1.0'?><stream:stream \
        xmlns:stream='http://etherx.jabber.org/streams' version='1.0' \
        id='c2s-1' xmlns='jabber:client'>";

    fn opened_codec(b: &mut BytesMut) -> XmppCodec {
        let mut c = XmppCodec::new();
        b.extend_from_slice(STREAM_OPEN);
        match c.decode(b) {
            Ok(Some(Packet::StreamStart(header))) => {
                assert_eq!(header.ns, ns::STREAM);
                assert_eq!(header.name, "stream");
                assert_eq!(header.attrs.get("id").map(String::as_str), Some("c2s-1"));
            }
            other => panic!("expected StreamStart, got {:?}", other),
        }
        assert!(b.is_empty());
        c
    }

    #[test]
    fn test_stream_start() {
        let mut b = BytesMut::new();
        opened_codec(&mut b);
    }

    #[test]
    fn test_partial_stream_header() {
        let mut c = XmppCodec::new();
        let mut b = BytesMut::new();
        b.extend_from_slice(b"<?xml version='1.0'?><stream:str");
        assert!(matches!(c.decode(&mut b), Ok(None)));
        b.extend_from_slice(
            b"eam xmlns:stream='http://etherx.jabber.org/streams' xmlns='jabber:client'>",
        );
        assert!(matches!(c.decode(&mut b), Ok(Some(Packet::StreamStart(_)))));
    }

    #[test]
    fn test_truncated_stanza() {
        let mut b = BytesMut::new();
        let mut c = opened_codec(&mut b);

        b.extend_from_slice("<test>ß</test".as_bytes());
        assert!(matches!(c.decode(&mut b), Ok(None)));

        b.extend_from_slice(b">");
        match c.decode(&mut b) {
            Ok(Some(Packet::Stanza(el))) => {
                assert_eq!(el.name(), "test");
                assert_eq!(el.text(), "ß");
            }
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_features_namespaces() {
        let mut b = BytesMut::new();
        let mut c = opened_codec(&mut b);

        b.extend_from_slice(
            b"<stream:features>\
                <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
                <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                    <mechanism>PLAIN</mechanism>\
                </mechanisms>\
              </stream:features>",
        );
        match c.decode(&mut b) {
            Ok(Some(Packet::Stanza(el))) => {
                assert!(el.is("features", ns::STREAM));
                let starttls = el.get_child("starttls", ns::TLS).expect("starttls");
                assert!(starttls.has_child("required", ns::TLS));
                assert!(el.has_child("mechanisms", ns::SASL));
            }
            other => panic!("expected features, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_stanzas_one_chunk() {
        let mut b = BytesMut::new();
        let mut c = opened_codec(&mut b);

        b.extend_from_slice(b"<presence from='a@b'/><message to='x@y'><body>Hi</body></message>");
        match c.decode(&mut b) {
            Ok(Some(Packet::Stanza(el))) => assert_eq!(el.name(), "presence"),
            other => panic!("expected presence, got {:?}", other),
        }
        match c.decode(&mut b) {
            Ok(Some(Packet::Stanza(el))) => {
                assert_eq!(el.name(), "message");
                assert_eq!(el.get_child("body", "jabber:client").unwrap().text(), "Hi");
            }
            other => panic!("expected message, got {:?}", other),
        }
        assert!(b.is_empty());
    }

    #[test]
    fn test_keepalive_whitespace_skipped() {
        let mut b = BytesMut::new();
        let mut c = opened_codec(&mut b);

        b.extend_from_slice(b"  \n ");
        assert!(matches!(c.decode(&mut b), Ok(None)));

        b.extend_from_slice(b"<presence/>");
        match c.decode(&mut b) {
            Ok(Some(Packet::Stanza(el))) => assert_eq!(el.name(), "presence"),
            other => panic!("expected presence, got {:?}", other),
        }
        assert!(b.is_empty());
    }

    #[test]
    fn test_stream_end() {
        let mut b = BytesMut::new();
        let mut c = opened_codec(&mut b);

        b.extend_from_slice(b" </stream:stream>");
        assert!(matches!(c.decode(&mut b), Ok(Some(Packet::StreamEnd))));
    }

    #[test]
    fn test_truncated_utf8() {
        let mut b = BytesMut::new();
        let mut c = opened_codec(&mut b);

        b.extend_from_slice(b"<test>\xc3");
        assert!(matches!(c.decode(&mut b), Ok(None)));

        b.extend_from_slice(b"\x9f</test>");
        match c.decode(&mut b) {
            Ok(Some(Packet::Stanza(el))) => assert_eq!(el.text(), "ß"),
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_fresh_codec_has_no_buffered_state() {
        let mut b = BytesMut::new();
        let mut c = opened_codec(&mut b);
        b.extend_from_slice(b"<presence/");
        assert!(matches!(c.decode(&mut b), Ok(None)));

        // A restart discards the old codec together with its root scope;
        // the replacement starts from the header scan with an empty buffer.
        let mut fresh = XmppCodec::new();
        let mut empty = BytesMut::new();
        assert!(matches!(fresh.decode(&mut empty), Ok(None)));
        assert!(fresh.root.is_none());
    }

    #[test]
    fn test_encode_stanza_escapes_text() {
        let mut c = XmppCodec::new();
        let mut dst = BytesMut::new();
        let el = Element::builder("message", "jabber:client")
            .attr("to", "a&b@example.com")
            .append(
                Element::builder("body", "jabber:client")
                    .append("1 < 2 & \"three\"".to_owned())
                    .build(),
            )
            .build();
        c.encode(Packet::Stanza(el), &mut dst).unwrap();
        let out = String::from_utf8(dst.to_vec()).unwrap();
        assert!(out.contains("&lt; 2 &amp;"));
        assert!(!out.contains("1 < 2"));

        // A conforming parser recovers the original payloads.
        let mut b = BytesMut::new();
        let mut decoder = opened_codec(&mut b);
        b.extend_from_slice(out.as_bytes());
        match decoder.decode(&mut b) {
            Ok(Some(Packet::Stanza(el))) => {
                assert_eq!(el.attr("to"), Some("a&b@example.com"));
                assert_eq!(
                    el.get_child("body", "jabber:client").unwrap().text(),
                    "1 < 2 & \"three\""
                );
            }
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_text_and_raw() {
        let mut c = XmppCodec::new();
        let mut dst = BytesMut::new();
        c.encode(Packet::Text("a<b".into()), &mut dst).unwrap();
        assert_eq!(&dst[..], b"a&lt;b");

        dst.clear();
        c.encode(Packet::Raw("<foo/>".into()), &mut dst).unwrap();
        assert_eq!(&dst[..], b"<foo/>");

        dst.clear();
        c.encode(Packet::Text(" ".into()), &mut dst).unwrap();
        assert_eq!(&dst[..], b" ");
    }
}
