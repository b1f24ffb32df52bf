//! Connection construction (the negotiation pipeline) and the post-bind
//! session surface.

use std::sync::Arc;

use jid::Jid;
use minidom::Element;
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, info};

use crate::auth;
use crate::bind;
use crate::connect;
use crate::error::{AuthError, Error};
use crate::event::{Chat, Event};
use crate::ns;
use crate::stanza::Stanza;
use crate::starttls;
use crate::transport::Transport;
use crate::xmpp_codec::Packet;
use crate::xmpp_stream::XmppStream;

/// Connection options, captured at construction time.
#[derive(Clone, Default)]
pub struct Options {
    /// Target `host[:port]`; empty derives the host from the user's
    /// domain, a missing port defaults to 5222
    pub host: String,
    /// Full JID of the form `localpart@domain`; both parts required
    pub user: String,
    /// Password for PLAIN and DIGEST-MD5
    pub password: String,
    /// Requested resource in the bind IQ; empty lets the server assign
    pub resource: String,
    /// TLS trust configuration; `None` uses the system roots
    pub tls_config: Option<Arc<ClientConfig>>,
    /// Expected TLS server name; `None` derives it from `host` (initial
    /// TLS, port stripped) or the user's domain (STARTTLS)
    pub tls_server_name: Option<String>,
    /// Permit authentication over a connection that has not been
    /// promoted to TLS. Credentials may leak; off by default.
    pub allow_unencrypted_auth: bool,
    /// Do not wrap the initial socket in TLS (combine with `start_tls`
    /// for STARTTLS-based servers)
    pub no_tls: bool,
    /// Prefer STARTTLS when the server advertises it; a server-side
    /// `<required/>` always wins
    pub start_tls: bool,
    /// Emit the optional `<session/>` IQ after bind
    pub session: bool,
    /// Initial presence show value
    pub status: String,
    /// Initial presence status text
    pub status_message: String,
    /// Mirror decoded stream XML to standard output
    pub debug: bool,
}

impl Options {
    /// Establish a connection: TCP (and TLS unless `no_tls`), stream
    /// open, STARTTLS, SASL, stream restart, bind, optional session,
    /// initial presence.
    pub async fn connect(self) -> Result<Client, Error> {
        let jid = Jid::new(&self.user).map_err(|_| Error::InvalidUser(self.user.clone()))?;
        let username = jid
            .node()
            .ok_or_else(|| Error::InvalidUser(self.user.clone()))?
            .to_string();
        let domain = jid.domain().to_string();

        let tcp_stream = connect::connect(&self.host, &domain).await?;
        let mut transport = Transport::Plain(tcp_stream);

        if !self.no_tls {
            let derived = if self.host.trim().is_empty() {
                domain.clone()
            } else {
                strip_port(self.host.trim()).to_owned()
            };
            let name = self.tls_server_name(&derived);
            transport = transport.upgrade_tls(self.tls_config()?, &name).await?;
        }

        let mut stream = XmppStream::start(transport, jid.clone(), self.debug).await?;

        // STARTTLS when advertised and either required by the server or
        // requested by the user.
        let features = &stream.stream_features;
        if features.can_starttls()
            && (features.starttls_required() || self.start_tls)
            && !stream.get_ref().is_encrypted()
        {
            info!(
                required = stream.stream_features.starttls_required(),
                "negotiating STARTTLS"
            );
            let name = self.tls_server_name(&domain);
            let transport = starttls::starttls(stream, self.tls_config()?, &name).await?;
            stream = XmppStream::start(transport, jid.clone(), self.debug).await?;
        }

        // Even digest authentication is unsafe when the peer could be a
        // man in the middle.
        if !stream.get_ref().is_encrypted() && !self.allow_unencrypted_auth {
            return Err(AuthError::InsecureConnection.into());
        }

        auth::auth(&mut stream, &username, &self.password, &domain).await?;

        // Authenticated; the stream starts over.
        let mut stream = stream.restart().await?;

        let cookie = bind::make_cookie();
        let bound = bind::bind(&mut stream, &self.resource, &cookie).await?;
        let bound_jid = Jid::new(&bound)?;
        info!(jid = %bound_jid, "session ready");

        if self.session {
            bind::open_session(&mut stream, &domain, &cookie).await?;
        }

        let presence = Element::builder("presence", ns::CLIENT)
            .attr("xml:lang", "en")
            .append(
                Element::builder("show", ns::CLIENT)
                    .append(self.status.clone())
                    .build(),
            )
            .append(
                Element::builder("status", ns::CLIENT)
                    .append(self.status_message.clone())
                    .build(),
            )
            .build();
        stream.send_stanza(presence).await?;

        Ok(Client {
            stream,
            jid: bound_jid,
            domain,
        })
    }

    fn tls_config(&self) -> Result<Arc<ClientConfig>, Error> {
        match &self.tls_config {
            Some(config) => Ok(config.clone()),
            None => Transport::default_tls_config(),
        }
    }

    fn tls_server_name(&self, derived: &str) -> String {
        self.tls_server_name
            .clone()
            .unwrap_or_else(|| derived.to_owned())
    }
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':').map(|(host, _)| host).unwrap_or(host)
}

/// A connected, authenticated, resource-bound XMPP client.
///
/// Single-reader, single-writer; not internally synchronized.
pub struct Client {
    stream: XmppStream<Transport>,
    jid: Jid,
    domain: String,
}

impl Client {
    /// Connect to `host` as `user` over TLS.
    pub async fn new(host: &str, user: &str, password: &str, debug: bool) -> Result<Client, Error> {
        Options {
            host: host.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
            debug,
            ..Options::default()
        }
        .connect()
        .await
    }

    /// Connect in plaintext; the server may still promote the stream via
    /// STARTTLS.
    pub async fn new_no_tls(
        host: &str,
        user: &str,
        password: &str,
        debug: bool,
    ) -> Result<Client, Error> {
        Options {
            host: host.to_owned(),
            user: user.to_owned(),
            password: password.to_owned(),
            no_tls: true,
            debug,
            ..Options::default()
        }
        .connect()
        .await
    }

    /// The JID the server bound this connection to.
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    /// The authenticated user's domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether the transport is TLS, from the outset or via STARTTLS.
    pub fn is_encrypted(&self) -> bool {
        self.stream.get_ref().is_encrypted()
    }

    /// Wait for the next message or presence, skipping everything else.
    pub async fn recv(&mut self) -> Result<Event, Error> {
        loop {
            match self.stream.recv().await? {
                Stanza::Message(message) => return Ok(Event::Chat(message.into())),
                Stanza::Presence(presence) => return Ok(Event::Presence(presence.into())),
                other => debug!(?other, "ignoring stanza"),
            }
        }
    }

    /// Send a chat message.
    pub async fn send(&mut self, chat: &Chat) -> Result<(), Error> {
        let message = Element::builder("message", ns::CLIENT)
            .attr("to", chat.remote.as_str())
            .attr("type", chat.type_.as_str())
            .attr("xml:lang", "en")
            .append(
                Element::builder("body", ns::CLIENT)
                    .append(chat.text.clone())
                    .build(),
            )
            .build();
        self.stream.send_stanza(message).await
    }

    /// Write a fragment verbatim. The caller is responsible for
    /// well-formedness.
    pub async fn send_raw(&mut self, fragment: &str) -> Result<(), Error> {
        self.stream.send_packet(Packet::Raw(fragment.to_owned())).await
    }

    /// Enter a MUC room (XEP-0045 §7.2) without requesting history.
    pub async fn join_muc(&mut self, jid: &str) -> Result<(), Error> {
        let presence = Element::builder("presence", ns::CLIENT)
            .attr("to", jid)
            .append(
                Element::builder("x", ns::MUC)
                    .append(
                        Element::builder("history", ns::MUC)
                            .attr("maxstanzas", "0")
                            .build(),
                    )
                    .build(),
            )
            .build();
        self.stream.send_stanza(presence).await
    }

    /// Exit a MUC room (XEP-0045 §7.14).
    pub async fn leave_muc(&mut self, jid: &str) -> Result<(), Error> {
        let presence = Element::builder("presence", ns::CLIENT)
            .attr("from", self.jid.to_string())
            .attr("to", jid)
            .attr("type", "unavailable")
            .build();
        self.stream.send_stanza(presence).await
    }

    /// Broadcast a new presence show/status.
    pub async fn change_status(&mut self, show: &str, status: &str) -> Result<(), Error> {
        let presence = Element::builder("presence", ns::CLIENT)
            .attr("xml:lang", "en")
            .append(Element::builder("show", ns::CLIENT).append(show.to_owned()).build())
            .append(Element::builder("status", ns::CLIENT).append(status.to_owned()).build())
            .build();
        self.stream.send_stanza(presence).await
    }

    /// A single space: valid inter-stanza whitespace that keeps NATs and
    /// idle timeouts at bay.
    pub async fn keep_alive(&mut self) -> Result<(), Error> {
        self.stream.send_packet(Packet::Raw(" ".to_owned())).await
    }

    /// Close the underlying transport.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.stream.get_mut().shutdown().await?;
        Ok(())
    }
}
