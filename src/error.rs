use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use tokio_rustls::rustls::pki_types::InvalidDnsNameError;
use tokio_rustls::rustls::Error as TlsError;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error on the underlying transport
    Io(IoError),
    /// The `user` option is not of the form `localpart@domain`
    InvalidUser(String),
    /// HTTP CONNECT proxy refused the tunnel
    Proxy(String),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// Authentication error
    Auth(AuthError),
    /// TLS error
    Tls(TlsError),
    /// The expected TLS server name is not a valid DNS name
    DnsName(InvalidDnsNameError),
    /// Error parsing a Jabber-Id
    JidParse(jid::Error),
    /// Connection closed by the peer
    Disconnected,
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(fmt, "IO error: {}", e),
            Error::InvalidUser(user) => {
                write!(fmt, "invalid username (want user@domain): {}", user)
            }
            Error::Proxy(status) => write!(fmt, "proxy CONNECT failed: {}", status),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::DnsName(e) => write!(fmt, "invalid TLS server name: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
            Error::Disconnected => write!(fmt, "disconnected"),
        }
    }
}

impl StdError for Error {}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Tls(e)
    }
}

impl From<InvalidDnsNameError> for Error {
    fn from(e: InvalidDnsNameError) -> Self {
        Error::DnsName(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<minidom::Error> for Error {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e).into()
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// XML element materialization error
    Parser(minidom::Error),
    /// XML tokenization error
    Xml(quick_xml::Error),
    /// A top-level stanza outside the fixed dispatch table
    UnexpectedStanza {
        /// Namespace of the offending element
        ns: String,
        /// Local name of the offending element
        name: String,
    },
    /// The stream opened with something other than `<stream:stream>`
    UnexpectedStreamHeader {
        /// Namespace of the offending element
        ns: String,
        /// Local name of the offending element
        name: String,
    },
    /// `<stream:error/>` received from the server
    StreamError {
        /// Local name of the defined condition
        condition: String,
        /// Human-readable text, if any
        text: String,
    },
    /// Server answered `<starttls/>` with `<failure/>` or an unexpected element
    StartTlsRefused(String),
    /// Bind result missing `<bind>`/`<jid>`, or not an IQ result
    InvalidBindResponse(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parser(e) => write!(fmt, "XML parser error: {}", e),
            ProtocolError::Xml(e) => write!(fmt, "XML error: {}", e),
            ProtocolError::UnexpectedStanza { ns, name } => {
                write!(fmt, "unexpected stanza <{}/> in {}", name, ns)
            }
            ProtocolError::UnexpectedStreamHeader { ns, name } => {
                write!(fmt, "expected <stream> but got <{}> in {}", name, ns)
            }
            ProtocolError::StreamError { condition, text } => {
                if text.is_empty() {
                    write!(fmt, "stream error: {}", condition)
                } else {
                    write!(fmt, "stream error: {}: {}", condition, text)
                }
            }
            ProtocolError::StartTlsRefused(detail) => {
                write!(fmt, "server refused STARTTLS: {}", detail)
            }
            ProtocolError::InvalidBindResponse(detail) => {
                write!(fmt, "unmarshal <iq>: {}", detail)
            }
        }
    }
}

impl StdError for ProtocolError {}

impl From<minidom::Error> for ProtocolError {
    fn from(e: minidom::Error) -> Self {
        ProtocolError::Parser(e)
    }
}

impl From<quick_xml::Error> for ProtocolError {
    fn from(e: quick_xml::Error) -> Self {
        ProtocolError::Xml(e)
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// Refusing to send credentials over an unencrypted transport
    InsecureConnection,
    /// None of the advertised SASL mechanisms is supported
    NoMechanism(Vec<String>),
    /// `<failure/>` from the server; carries the inner element local-name
    Fail(String),
    /// Local SASL mechanism error
    Sasl(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::InsecureConnection => {
                write!(fmt, "refusing to authenticate over unencrypted TCP connection")
            }
            AuthError::NoMechanism(offered) => {
                write!(fmt, "no supported authentication mechanism in {:?}", offered)
            }
            AuthError::Fail(condition) => write!(fmt, "auth failure: {}", condition),
            AuthError::Sasl(e) => write!(fmt, "SASL error: {}", e),
        }
    }
}

impl StdError for AuthError {}
