//! SASL authentication: mechanism selection in server order, the
//! auth/challenge/response exchange, and a DIGEST-MD5 (RFC 2831)
//! client mechanism.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minidom::Element;
use rand::{thread_rng, Rng};
use sasl::client::mechanisms::{Anonymous, Plain};
use sasl::client::{Mechanism, MechanismError};
use sasl::common::{ChannelBinding, Credentials, Identity, Password, Secret};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::error::{AuthError, Error};
use crate::ns;
use crate::stanza::Stanza;
use crate::xmpp_stream::XmppStream;

/// Run SASL over an open stream. On success the server expects a stream
/// restart, which is left to the caller.
pub async fn auth<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut XmppStream<S>,
    username: &str,
    password: &str,
    domain: &str,
) -> Result<(), Error> {
    let offered = stream.stream_features.mechanisms.clone();
    let mut mechanism = select_mechanism(&offered, username, password, domain)?;
    info!(mechanism = mechanism.name(), "starting SASL authentication");

    let initial = mechanism.initial();
    let nonza = Element::builder("auth", ns::SASL)
        .attr("mechanism", mechanism.name())
        .append(BASE64.encode(&initial))
        .build();
    stream.send_stanza(nonza).await?;

    loop {
        match stream.recv().await? {
            Stanza::SaslChallenge(data) => {
                let challenge = BASE64
                    .decode(data.trim())
                    .map_err(|e| AuthError::Sasl(format!("bad challenge base64: {}", e)))?;
                let response = mechanism
                    .response(&challenge)
                    .map_err(|e| AuthError::Sasl(e.to_string()))?;
                let nonza = Element::builder("response", ns::SASL)
                    .append(BASE64.encode(&response))
                    .build();
                stream.send_stanza(nonza).await?;
            }
            Stanza::SaslSuccess => {
                info!("authenticated");
                return Ok(());
            }
            Stanza::SaslFailure(failure) => {
                return Err(AuthError::Fail(
                    failure
                        .condition
                        .unwrap_or_else(|| "authentication failure".to_owned()),
                )
                .into());
            }
            _ => {}
        }
    }
}

/// Walk the server's mechanism list in its order and take the first one
/// we can do.
fn select_mechanism(
    offered: &[String],
    username: &str,
    password: &str,
    domain: &str,
) -> Result<Box<dyn Mechanism + Send + Sync>, Error> {
    for name in offered {
        match name.as_str() {
            "ANONYMOUS" => return Ok(Box::new(Anonymous::new())),
            "PLAIN" => {
                let creds = Credentials::default()
                    .with_username(username)
                    .with_password(password)
                    .with_channel_binding(ChannelBinding::None);
                let plain =
                    Plain::from_credentials(creds).map_err(|e| AuthError::Sasl(e.to_string()))?;
                return Ok(Box::new(plain));
            }
            "DIGEST-MD5" => {
                return Ok(Box::new(DigestMd5::new(username, password, domain)));
            }
            _ => {}
        }
    }
    Err(AuthError::NoMechanism(offered.to_vec()).into())
}

/// DIGEST-MD5 (RFC 2831). Legacy, but still what some deployments offer.
/// One challenge/response round, then an empty response acknowledging
/// the server's `rspauth`, which is not verified.
struct DigestMd5 {
    username: String,
    password: String,
    digest_uri: String,
    cnonce: String,
    responded: bool,
}

impl DigestMd5 {
    fn new(username: &str, password: &str, domain: &str) -> Self {
        DigestMd5 {
            username: username.to_owned(),
            password: password.to_owned(),
            digest_uri: format!("xmpp/{}", domain),
            cnonce: make_cnonce(),
            responded: false,
        }
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &str {
        "DIGEST-MD5"
    }

    fn from_credentials(credentials: Credentials) -> Result<Self, MechanismError> {
        if let Secret::Password(Password::Plain(password)) = credentials.secret {
            if let Identity::Username(username) = credentials.identity {
                Ok(DigestMd5::new(&username, &password, ""))
            } else {
                Err(MechanismError::PlainRequiresUsername)
            }
        } else {
            Err(MechanismError::PlainRequiresPlaintextPassword)
        }
    }

    fn initial(&mut self) -> Vec<u8> {
        Vec::new()
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, MechanismError> {
        if self.responded {
            // rspauth round
            return Ok(Vec::new());
        }
        self.responded = true;

        let tokens = parse_challenge(challenge);
        let empty = String::new();
        let realm = tokens.get("realm").unwrap_or(&empty);
        let nonce = tokens.get("nonce").unwrap_or(&empty);
        let qop = tokens.get("qop").unwrap_or(&empty);
        let charset = tokens.get("charset").unwrap_or(&empty);
        let nc = "00000001";

        let digest = digest_response(
            &self.username,
            realm,
            &self.password,
            nonce,
            &self.cnonce,
            nc,
            &self.digest_uri,
        );
        let message = format!(
            "username=\"{}\", realm=\"{}\", nonce=\"{}\", cnonce=\"{}\", nc={}, qop={}, digest-uri=\"{}\", response={}, charset={}",
            self.username, realm, nonce, self.cnonce, nc, qop, self.digest_uri, digest, charset
        );
        Ok(message.into_bytes())
    }
}

/// 16 hex digits from 8 random bytes
fn make_cnonce() -> String {
    let mut bytes = [0u8; 8];
    thread_rng().fill(&mut bytes);
    hex(&bytes)
}

/// Challenge fields: comma-separated `key=value`, double quotes around
/// values stripped.
fn parse_challenge(challenge: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(challenge);
    let mut tokens = HashMap::new();
    for token in text.split(',') {
        if let Some((key, value)) = token.trim().split_once('=') {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            tokens.insert(key.to_owned(), unquoted.to_owned());
        }
    }
    tokens
}

fn h(data: &[u8]) -> [u8; 16] {
    md5::compute(data).0
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// RFC 2831 §2.1.2.1. A1 is the raw MD5 output of
/// `user:realm:password` concatenated with `:nonce:cnonce`, a mixed
/// byte string.
fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    cnonce: &str,
    nc: &str,
    digest_uri: &str,
) -> String {
    let mut a1 = h(format!("{}:{}:{}", username, realm, password).as_bytes()).to_vec();
    a1.extend_from_slice(format!(":{}:{}", nonce, cnonce).as_bytes());
    let a2 = format!("AUTHENTICATE:{}", digest_uri);

    let data = format!("{}:{}:{}:auth:{}", nonce, nc, cnonce, hex(&h(a2.as_bytes())));
    hex(&h(format!("{}:{}", hex(&h(&a1)), data).as_bytes()))
}
