//! Outbound connections to GOAL endpoints.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::protocol::Target;

/// Connect with a timeout and Nagle disabled.
///
/// A timeout is reported as `io::ErrorKind::TimedOut` so it classifies as
/// `TIMEOUT` in error objects.
pub async fn dial(target: &Target, timeout: Duration) -> io::Result<TcpStream> {
    let stream = match tokio::time::timeout(
        timeout,
        TcpStream::connect((target.address.as_str(), target.port)),
    )
    .await
    {
        Ok(connected) => connected?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {}ms", target, timeout.as_millis()),
            ))
        }
    };
    stream.set_nodelay(true)?;
    tracing::debug!(goal = %target, "Connected");
    Ok(stream)
}
