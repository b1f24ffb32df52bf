//! Resource binding (RFC 3920 §7) and optional session establishment
//! (RFC 3921 §3).

use minidom::Element;
use rand::{thread_rng, Rng};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::error::{Error, ProtocolError};
use crate::ns;
use crate::stanza::Stanza;
use crate::xmpp_stream::XmppStream;

/// Opaque IQ cookie: a random 64-bit value, hex-formatted.
pub fn make_cookie() -> String {
    let cookie: u64 = thread_rng().gen();
    format!("{:x}", cookie)
}

/// Bind a resource and return the server-assigned full JID. An empty
/// `resource` lets the server pick one.
pub async fn bind<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut XmppStream<S>,
    resource: &str,
    cookie: &str,
) -> Result<String, Error> {
    let mut bind = Element::builder("bind", ns::BIND);
    if !resource.is_empty() {
        bind = bind.append(
            Element::builder("resource", ns::BIND)
                .append(resource.to_owned())
                .build(),
        );
    }
    let iq = Element::builder("iq", ns::CLIENT)
        .attr("type", "set")
        .attr("id", cookie)
        .append(bind.build())
        .build();
    stream.send_stanza(iq).await?;

    loop {
        match stream.recv().await? {
            Stanza::Iq(iq) if iq.id == cookie => {
                if iq.type_ != "result" {
                    return Err(ProtocolError::InvalidBindResponse(format!(
                        "bind returned type '{}'",
                        iq.type_
                    ))
                    .into());
                }
                let jid = iq.bind.map(|bind| bind.jid).unwrap_or_default();
                if jid.is_empty() {
                    return Err(ProtocolError::InvalidBindResponse(
                        "result missing <bind> jid".to_owned(),
                    )
                    .into());
                }
                debug!(jid = %jid, "resource bound");
                return Ok(jid);
            }
            other => debug!(?other, "skipping stanza while awaiting bind result"),
        }
    }
}

/// Ask the server to open a session. The original protocol makes the
/// reply uninteresting; it is not awaited.
pub async fn open_session<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut XmppStream<S>,
    domain: &str,
    cookie: &str,
) -> Result<(), Error> {
    let iq = Element::builder("iq", ns::CLIENT)
        .attr("to", domain)
        .attr("type", "set")
        .attr("id", cookie)
        .append(Element::builder("session", ns::SESSION).build())
        .build();
    stream.send_stanza(iq).await
}
