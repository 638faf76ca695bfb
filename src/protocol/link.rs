// Serial transport to the motor controller board
//
// Writes go straight to the port from the engine task. Reads happen on a
// dedicated thread that forwards raw chunks over a channel, since the
// serialport crate only offers blocking reads.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Read timeout; bounds how long the reader thread takes to notice shutdown
pub const READ_TIMEOUT_MS: u64 = 100;

/// Inbound chunks buffered between the reader thread and the engine
const INBOUND_DEPTH: usize = 256;

/// Error types for the serial link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Link is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// What the reader side of a link reports
#[derive(Debug)]
pub enum LinkEvent {
    Data(Vec<u8>),
    Error(LinkError),
    Disconnected,
}

/// Outbound half of a transport
pub trait Link: Send + 'static {
    /// Write one encoded frame
    fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Flush and release the transport
    fn close(&mut self) -> Result<()>;
}

/// Serial port link to the board
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    shutdown: Arc<AtomicBool>,
    closed: bool,
}

impl SerialLink {
    /// Open the port and start the reader thread. Returns the link and the
    /// stream of inbound chunks.
    pub fn open(port_name: &str, baudrate: u32) -> Result<(Self, mpsc::Receiver<LinkEvent>)> {
        info!("Opening serial link on {} at {} baud", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .open()?;

        // Discard whatever the board sent before we were listening
        port.clear(ClearBuffer::All)?;

        let reader = port.try_clone()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(INBOUND_DEPTH);

        let flag = shutdown.clone();
        thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_loop(reader, tx, flag))?;

        Ok((
            Self {
                port,
                shutdown,
                closed: false,
            },
            rx,
        ))
    }
}

impl Link for SerialLink {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        self.port.write_all(bytes)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shutdown.store(true, Ordering::Relaxed);
        self.port.flush()?;
        info!("Serial link closed");
        Ok(())
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        // Stop the reader even if close() was never called
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn read_loop(mut port: Box<dyn SerialPort>, tx: mpsc::Sender<LinkEvent>, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; 256];

    while !shutdown.load(Ordering::Relaxed) {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if tx.blocking_send(LinkEvent::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                if tx.is_closed() {
                    break;
                }
            }
            Err(e) => {
                warn!("Serial read failed: {}", e);
                let _ = tx.blocking_send(LinkEvent::Error(LinkError::Io(e)));
                let _ = tx.blocking_send(LinkEvent::Disconnected);
                break;
            }
        }
    }

    debug!("Serial reader stopped");
}
