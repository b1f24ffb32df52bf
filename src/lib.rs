//! An asynchronous XMPP 1.0 client library (RFC 3920/3921).
//!
//! Connects to a Jabber-compatible server, negotiates STARTTLS, SASL
//! authentication (ANONYMOUS, PLAIN, DIGEST-MD5) and resource binding,
//! then exchanges messages and presence, including basic Multi-User
//! Chat (XEP-0045) join/leave.
//!
//! ```no_run
//! use tokio_jabber::{Chat, Event, Options};
//!
//! # async fn run() -> Result<(), tokio_jabber::Error> {
//! let mut client = Options {
//!     host: "example.com:5222".to_owned(),
//!     user: "bot@example.com".to_owned(),
//!     password: "secret".to_owned(),
//!     resource: "bot".to_owned(),
//!     no_tls: true,
//!     start_tls: true,
//!     ..Options::default()
//! }
//! .connect()
//! .await?;
//!
//! client.join_muc("room@conference.example.com/bot").await?;
//! loop {
//!     match client.recv().await? {
//!         Event::Chat(chat) => {
//!             client
//!                 .send(&Chat {
//!                     remote: chat.remote.clone(),
//!                     type_: "chat".to_owned(),
//!                     text: format!("echo: {}", chat.text),
//!                     other: vec![],
//!                 })
//!                 .await?;
//!         }
//!         Event::Presence(_) => {}
//!     }
//! }
//! # }
//! ```

pub mod error;
pub mod ns;
pub mod stanza;
pub mod xmpp_codec;
pub mod xmpp_stream;

mod auth;
mod bind;
mod client;
mod connect;
mod event;
mod starttls;
mod transport;

pub use client::{Client, Options};
pub use error::{AuthError, Error, ProtocolError};
pub use event::{Chat, Event, Presence};
pub use transport::Transport;
