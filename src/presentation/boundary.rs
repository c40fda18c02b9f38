//! Line-delimited JSON protocol spoken with the parent process.
//!
//! Commands arrive on stdin, events leave on stdout, one object per line.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum BoundaryCommand {
    Scan,
    Connect {
        #[serde(default)]
        device_id: Option<String>,
    },
    Disconnect,
}

/// Parse one input line. Blank, malformed and unknown lines yield `None`.
pub fn parse_command(line: &str) -> Option<BoundaryCommand> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(command) => Some(command),
        Err(e) => {
            debug!("Ignoring command line {:?}: {}", line, e);
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BoundaryEvent {
    Device {
        id: String,
        name: String,
    },
    Connected,
    Data {
        raw: Vec<u8>,
    },
    Telemetry {
        cadence_rpm: Option<f64>,
        speed_kmh: Option<f64>,
        distance_km: f64,
    },
    Disconnected,
    Error {
        message: String,
    },
}

impl BoundaryEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Writes one JSON object per line and flushes after each.
pub struct BoundaryWriter<W> {
    out: W,
}

impl<W: AsyncWrite + Unpin> BoundaryWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub async fn write(&mut self, event: &BoundaryEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.out.write_all(&line).await?;
        self.out.flush().await
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}
