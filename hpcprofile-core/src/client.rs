//! Minimal control client for running clusters.
//!
//! Speaks the line protocol of the scheduler control socket; enough for
//! the CLI to shut a cluster down by address without holding the original
//! handle.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;

use crate::error::{ProfileError, Result};

/// Connect to a scheduler control endpoint and shut the cluster down
pub async fn shutdown_cluster(address: &str) -> Result<()> {
    let host = address.strip_prefix("tcp://").unwrap_or(address);

    info!("connecting to {host}");
    let stream = TcpStream::connect(host).await?;
    let (read, mut write) = stream.into_split();

    write.write_all(b"shutdown\n").await?;
    write.flush().await?;

    let mut reply = String::new();
    BufReader::new(read).read_line(&mut reply).await?;
    if reply.trim() != "ok" {
        return Err(ProfileError::Backend(format!(
            "scheduler refused shutdown: {:?}",
            reply.trim()
        )));
    }

    info!("cluster at {host} acknowledged shutdown");
    Ok(())
}
