use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time;
use tokio_socks::tcp::socks4::Socks4Stream;
use tokio_socks::tcp::socks5::Socks5Stream;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

impl std::fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AsyncStream")
    }
}

/// A tunneled byte stream to the scan destination.
pub type TunnelStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks4,
    #[default]
    Socks5,
}

/// Everything an agent needs to open one tunnel; travels in the claim
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "type", default)]
    pub kind: ProxyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy {proxy} failed connecting to {dest}: {source}")]
    Connect {
        proxy: String,
        dest: String,
        #[source]
        source: tokio_socks::Error,
    },
    #[error("proxy {proxy} timed out connecting to {dest}")]
    Timeout { proxy: String, dest: String },
}

/// Open a SOCKS CONNECT tunnel to `(dest_host, dest_port)` through `proxy`,
/// bounded by `deadline`. All scan traffic goes through here; the scanner
/// never dials destinations directly.
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    dest_host: &str,
    dest_port: u16,
    deadline: Duration,
) -> Result<TunnelStream, ProxyError> {
    let proxy_addr = (proxy.host.as_str(), proxy.port);
    let target = (dest_host.to_string(), dest_port);
    let endpoint = format!("{}:{}", proxy.host, proxy.port);
    let dest = format!("{dest_host}:{dest_port}");

    let connect = async {
        let stream: TunnelStream = match proxy.kind {
            ProxyKind::Socks5 => match (&proxy.username, &proxy.password) {
                (Some(user), Some(pass)) => Box::new(
                    Socks5Stream::connect_with_password(proxy_addr, target, user, pass).await?,
                ),
                _ => Box::new(Socks5Stream::connect(proxy_addr, target).await?),
            },
            ProxyKind::Socks4 => match &proxy.username {
                Some(user) => {
                    Box::new(Socks4Stream::connect_with_userid(proxy_addr, target, user).await?)
                }
                None => Box::new(Socks4Stream::connect(proxy_addr, target).await?),
            },
        };
        Ok::<_, tokio_socks::Error>(stream)
    };

    match time::timeout(deadline, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(ProxyError::Connect {
            proxy: endpoint,
            dest,
            source,
        }),
        Err(_) => Err(ProxyError::Timeout {
            proxy: endpoint,
            dest,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_kind_wire_names() {
        assert_eq!(serde_json::to_string(&ProxyKind::Socks5).unwrap(), "\"socks5\"");
        assert_eq!(
            serde_json::from_str::<ProxyKind>("\"socks4\"").unwrap(),
            ProxyKind::Socks4
        );
    }

    #[test]
    fn proxy_config_uses_type_field() {
        let cfg: ProxyConfig = serde_json::from_str(
            r#"{"host":"1.2.3.4","port":1080,"type":"socks5","username":"u","password":"p"}"#,
        )
        .unwrap();
        assert_eq!(cfg.kind, ProxyKind::Socks5);
        assert_eq!(cfg.username.as_deref(), Some("u"));
    }

    #[tokio::test]
    async fn refused_proxy_is_a_connect_error() {
        let cfg = ProxyConfig {
            host: "127.0.0.1".to_string(),
            port: 1, // nothing listens here
            kind: ProxyKind::Socks5,
            username: None,
            password: None,
        };
        let err = connect_via_proxy(&cfg, "example.com", 25565, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. } | ProxyError::Timeout { .. }));
    }
}
