use std::{net::SocketAddr, time::Duration};

use tokio::net::TcpStream;

use crate::{
    error::{ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(not(target_os = "wasi"))]
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

async fn tcp_try_connect(address: &SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;

    #[cfg(not(target_os = "wasi"))]
    {
        let sock_ref = socket2::SockRef::from(&stream);
        let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        sock_ref.set_tcp_keepalive(&conf)?;
    }

    Ok(stream)
}

/// Opens a TCP stream to `address`, trying each resolved socket address in turn with a preference
/// for IPv4. A `connect_timeout` of zero means no timeout.
pub(crate) async fn tcp_connect(
    address: &ServerAddress,
    connect_timeout: Option<Duration>,
) -> Result<TcpStream> {
    let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

    let mut resolved: Vec<_> = runtime::resolve_address(address).await?.collect();
    if resolved.is_empty() {
        return Err(ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("No DNS results for domain {address}"),
        )))
        .into());
    }
    resolved.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut connect_error = None;
    for socket_addr in &resolved {
        let attempt = if timeout.is_zero() {
            tcp_try_connect(socket_addr).await
        } else {
            runtime::timeout(timeout, tcp_try_connect(socket_addr))
                .await
                .and_then(|r| r)
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                connect_error.get_or_insert(e);
            }
        }
    }

    Err(connect_error.unwrap_or_else(crate::error::Error::network_timeout))
}
