//! In-band promotion of the stream's transport to TLS (RFC 3920 §5).

use std::sync::Arc;

use minidom::Element;
use tokio_rustls::rustls::ClientConfig;
use tracing::debug;

use crate::error::{Error, ProtocolError};
use crate::ns;
use crate::stanza::Stanza;
use crate::transport::Transport;
use crate::xmpp_stream::XmppStream;

/// Send `<starttls/>`, await `<proceed/>`, and wrap the transport in
/// TLS. The caller reopens the stream over the returned transport.
pub async fn starttls(
    mut stream: XmppStream<Transport>,
    config: Arc<ClientConfig>,
    server_name: &str,
) -> Result<Transport, Error> {
    let nonza = Element::builder("starttls", ns::TLS).build();
    stream.send_stanza(nonza).await?;

    match stream.recv().await? {
        Stanza::TlsProceed => {}
        Stanza::TlsFailure => {
            return Err(ProtocolError::StartTlsRefused("<failure/>".to_owned()).into());
        }
        other => {
            return Err(ProtocolError::StartTlsRefused(format!(
                "expected <proceed/>, got {:?}",
                other
            ))
            .into());
        }
    }
    debug!("server sent <proceed/>, wrapping transport in TLS");

    let transport = stream.into_inner();
    transport.upgrade_tls(config, server_name).await
}
