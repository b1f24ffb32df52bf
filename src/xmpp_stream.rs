//! `XmppStream` couples a byte transport with the XML codec and carries
//! the per-stream state: the server's `<stream:stream>` attributes and
//! its advertised features.

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use jid::Jid;
use minidom::Element;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::error::{Error, ProtocolError};
use crate::ns;
use crate::stanza::{Stanza, StreamFeatures};
use crate::xmpp_codec::{Packet, StreamHeader, XmppCodec};

/// An open XMPP stream after the `<stream:stream>` exchange.
pub struct XmppStream<S: AsyncRead + AsyncWrite + Unpin> {
    /// The local Jabber-Id
    pub jid: Jid,
    /// Codec instance over the transport
    pub stream: Framed<S, XmppCodec>,
    /// `<stream:features/>` advertised by this stream
    pub stream_features: StreamFeatures,
    /// Attributes of the server's stream header
    pub stream_attrs: HashMap<String, String>,
    debug: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> XmppStream<S> {
    /// Open a stream over `stream`: send our header, expect the server's
    /// `<stream:stream>` followed by `<stream:features/>`.
    ///
    /// The codec is constructed directly over the transport, so a
    /// restart starts from an empty buffer.
    pub async fn start(stream: S, jid: Jid, debug: bool) -> Result<Self, Error> {
        let mut stream = Framed::new(stream, XmppCodec::with_debug(debug));

        let attrs: HashMap<String, String> = [
            ("to".to_owned(), jid.domain().to_string()),
            ("version".to_owned(), "1.0".to_owned()),
            ("xmlns".to_owned(), ns::CLIENT.to_owned()),
            ("xmlns:stream".to_owned(), ns::STREAM.to_owned()),
        ]
        .into_iter()
        .collect();
        stream
            .send(Packet::StreamStart(StreamHeader {
                ns: ns::STREAM.to_owned(),
                name: "stream".to_owned(),
                attrs,
            }))
            .await?;

        let stream_attrs;
        loop {
            match stream.next().await {
                Some(Ok(Packet::StreamStart(header))) => {
                    if header.ns != ns::STREAM || header.name != "stream" {
                        return Err(ProtocolError::UnexpectedStreamHeader {
                            ns: header.ns,
                            name: header.name,
                        }
                        .into());
                    }
                    stream_attrs = header.attrs;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
                None => return Err(Error::Disconnected),
            }
        }
        debug!(id = stream_attrs.get("id").map(String::as_str), "stream opened");

        loop {
            match stream.next().await {
                Some(Ok(Packet::Stanza(el))) => match Stanza::decode(&el)? {
                    Stanza::StreamFeatures(stream_features) => {
                        return Ok(XmppStream {
                            jid,
                            stream,
                            stream_features,
                            stream_attrs,
                            debug,
                        });
                    }
                    Stanza::StreamError(e) => {
                        return Err(ProtocolError::StreamError {
                            condition: e.condition,
                            text: e.text,
                        }
                        .into());
                    }
                    _ => {
                        return Err(ProtocolError::UnexpectedStanza {
                            ns: el.ns(),
                            name: el.name().to_owned(),
                        }
                        .into());
                    }
                },
                Some(Ok(Packet::StreamEnd)) | None => return Err(Error::Disconnected),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            }
        }
    }

    /// Receive the next top-level stanza, decoded.
    pub async fn recv(&mut self) -> Result<Stanza, Error> {
        loop {
            match self.stream.next().await {
                Some(Ok(Packet::Stanza(el))) => return Ok(Stanza::decode(&el)?),
                Some(Ok(Packet::StreamEnd)) | None => return Err(Error::Disconnected),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e),
            }
        }
    }

    pub async fn send_packet(&mut self, packet: Packet) -> Result<(), Error> {
        self.stream.send(packet).await
    }

    pub async fn send_stanza(&mut self, stanza: Element) -> Result<(), Error> {
        self.send_packet(Packet::Stanza(stanza)).await
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Unwrap the inner transport, discarding codec state.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Open a new stream over the same transport. The old codec and any
    /// bytes it buffered are discarded with it.
    pub async fn restart(self) -> Result<Self, Error> {
        let jid = self.jid.clone();
        let debug = self.debug;
        Self::start(self.stream.into_inner(), jid, debug).await
    }
}
