//! TCP connection establishment: dial target derivation and HTTP CONNECT
//! proxy traversal.

use std::env;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Error;

/// Derive the dial target: an empty `host` falls back to the user's
/// domain, a missing port defaults to 5222.
pub fn server_addr(host: &str, domain: &str) -> String {
    let host = host.trim();
    let mut addr = if host.is_empty() {
        domain.to_owned()
    } else {
        host.to_owned()
    };
    if !addr.contains(':') {
        addr.push_str(":5222");
    }
    addr
}

/// Connect to the XMPP server, honoring `HTTP_PROXY`/`http_proxy`.
pub async fn connect(host: &str, domain: &str) -> Result<TcpStream, Error> {
    let target = server_addr(host, domain);

    let proxy = env::var("HTTP_PROXY")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| env::var("http_proxy").ok().filter(|v| !v.is_empty()));

    match proxy {
        Some(proxy_url) => {
            let proxy_addr = proxy_host(&proxy_url);
            debug!(proxy = %proxy_addr, target = %target, "connecting via HTTP proxy");
            let mut stream = TcpStream::connect(&proxy_addr).await?;
            proxy_connect(&mut stream, &target).await?;
            Ok(stream)
        }
        None => {
            debug!(addr = %target, "connecting");
            Ok(TcpStream::connect(&target).await?)
        }
    }
}

/// Host part of a proxy URL: scheme, userinfo and path stripped.
fn proxy_host(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let rest = rest.split_once('/').map(|(host, _)| host).unwrap_or(rest);
    let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
    rest.to_owned()
}

/// Issue an HTTP/1.1 CONNECT for `target` and await a 2xx. Reads
/// byte-by-byte so no tunneled bytes are consumed past the response.
pub(crate) async fn proxy_connect<S>(stream: &mut S, target: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Proxy(
                "connection closed before CONNECT response".to_owned(),
            ));
        }
        response.push(byte[0]);
        if response.len() > 16 * 1024 {
            return Err(Error::Proxy("oversized CONNECT response".to_owned()));
        }
    }

    let response = String::from_utf8_lossy(&response);
    let status_line = response.lines().next().unwrap_or_default();
    // "HTTP/1.1 200 Connection established"
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let code = parts.next().unwrap_or_default();
    if !code.starts_with('2') {
        let phrase = parts.next().unwrap_or(status_line);
        return Err(Error::Proxy(phrase.trim().to_owned()));
    }
    debug!(status = %status_line, "proxy tunnel established");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_addr_derivation() {
        assert_eq!(server_addr("", "example.com"), "example.com:5222");
        assert_eq!(server_addr("talk.example.com", "example.com"), "talk.example.com:5222");
        assert_eq!(server_addr("talk.example.com:5223", "example.com"), "talk.example.com:5223");
        assert_eq!(server_addr("  ", "example.com"), "example.com:5222");
    }

    #[test]
    fn test_proxy_host() {
        assert_eq!(proxy_host("http://proxy.corp:3128"), "proxy.corp:3128");
        assert_eq!(proxy_host("http://proxy.corp:3128/"), "proxy.corp:3128");
        assert_eq!(proxy_host("http://user:pw@proxy.corp:3128"), "proxy.corp:3128");
        assert_eq!(proxy_host("proxy.corp:3128"), "proxy.corp:3128");
    }

    #[tokio::test]
    async fn test_proxy_connect_accepted() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let peer = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).into_owned();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            request
        });

        proxy_connect(&mut client, "example.com:5222").await.unwrap();
        let request = peer.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:5222 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:5222\r\n"));
    }

    #[tokio::test]
    async fn test_proxy_connect_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 403 Forbidden\r\nProxy-Agent: test\r\n\r\n")
                .await
                .unwrap();
        });

        match proxy_connect(&mut client, "example.com:5222").await {
            Err(Error::Proxy(phrase)) => assert_eq!(phrase, "Forbidden"),
            other => panic!("expected proxy error, got {:?}", other),
        }
    }
}
