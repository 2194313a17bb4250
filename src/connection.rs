//! A single TCP connection to a binary-protocol endpoint (§3, "Connection").

use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use crate::error::{ClientError, Result};
use crate::pool::PoolConfig;

/// One TCP stream plus the bookkeeping the pool needs to decide whether it's
/// still fresh enough to hand out.
pub struct Connection {
    pub(crate) stream: TcpStream,
    pub(crate) last_used: Instant,
}

impl Connection {
    pub(crate) async fn dial(config: &PoolConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = match config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| ClientError::Timeout)??,
            None => TcpStream::connect(&addr).await?,
        };
        stream.set_nodelay(true)?;
        Ok(Connection {
            stream,
            last_used: Instant::now(),
        })
    }

    pub(crate) fn is_fresh(&self, max_age: Duration) -> bool {
        self.last_used.elapsed() <= max_age
    }
}
