//! TCP readiness probes

use async_net::TcpStream;
use smol::Timer;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};

/// True when `address:port` accepts a connection within `timeout`
pub async fn probe(address: &str, port: u16, timeout: Duration) -> bool {
    let connect = async { TcpStream::connect((address, port)).await.is_ok() };
    let expire = async {
        Timer::after(timeout).await;
        false
    };
    futures_lite::future::or(connect, expire).await
}

/// Poll until `address:port` accepts a connection
///
/// Fails with [`Error::Unreachable`] once `timeout` has elapsed.
pub async fn wait_for_port(
    address: &str,
    port: u16,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    let mut attempt = 1u32;
    loop {
        if probe(address, port, interval).await {
            debug!("{}:{} reachable after {} attempt(s)", address, port, attempt);
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(Error::Unreachable {
                address: address.to_string(),
                port,
                seconds: timeout.as_secs(),
            });
        }
        debug!("Attempt {} - {}:{} not ready, waiting...", attempt, address, port);
        attempt += 1;
        Timer::after(interval).await;
    }
}
