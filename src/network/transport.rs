use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serialport::SerialPort;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{ControllerConfig, Error, Result, DEFAULT_BRIDGE_PORT};
use super::{LinkReader, LinkWriter, Transport};

const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(500);
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const PIPE_CAPACITY: usize = 1024;

/// Picks TCP when the port looks like a socket address, serial otherwise
pub fn transport_for(config: &ControllerConfig) -> Box<dyn Transport> {
    if let Ok(addr) = config.port.parse::<SocketAddr>() {
        return Box::new(TcpTransport::new(addr));
    }
    if let Some(host) = config.port.strip_prefix("tcp://") {
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{}:{}", host, DEFAULT_BRIDGE_PORT)
        };
        return Box::new(TcpTransport::from_host(addr));
    }
    Box::new(SerialTransport::new(config.port.clone(), config.baud_rate))
}

/// Threads pumping an open serial port
struct SerialBridge {
    cancel: CancellationToken,
    threads: Vec<std::thread::JoinHandle<()>>,
}

/// Stick attached to a serial port, 8N1
pub struct SerialTransport {
    port: String,
    baud_rate: u32,
    bridge: Mutex<Option<SerialBridge>>,
}

impl SerialTransport {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        SerialTransport {
            port: port.into(),
            baud_rate,
            bridge: Mutex::new(None),
        }
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>> {
        serialport::new(&self.port, self.baud_rate)
            .timeout(SERIAL_READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()
            .map_err(|e| Error::transport(format!("Failed to open serial port {}: {}", self.port, e)))
    }

    fn take_bridge(&self) -> Option<SerialBridge> {
        self.bridge.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Copies what the port reads into the pipe until `cancel` fires or the pipe closes
fn pump_port_reads(
    mut port: impl Read,
    mut pipe: WriteHalf<DuplexStream>,
    handle: Handle,
    cancel: CancellationToken,
    name: &str,
) {
    let mut buf = [0u8; 256];
    while !cancel.is_cancelled() {
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                if handle.block_on(pipe.write_all(&buf[..n])).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                warn!(port = %name, error = %e, "serial read failed");
                break;
            }
        }
    }
    debug!(port = %name, "serial reader stopped");
}

/// Writes what arrives on the pipe to the port until `cancel` fires or the pipe closes
fn pump_port_writes(
    mut port: impl Write,
    mut pipe: ReadHalf<DuplexStream>,
    handle: Handle,
    cancel: CancellationToken,
    name: &str,
) {
    let mut buf = [0u8; 256];
    loop {
        let read = handle.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Ok(0),
                read = pipe.read(&mut buf) => read,
            }
        });
        match read {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Err(e) = port.write_all(&buf[..n]).and_then(|_| port.flush()) {
                    warn!(port = %name, error = %e, "serial write failed");
                    break;
                }
            }
        }
    }
    debug!(port = %name, "serial writer stopped");
}

impl Transport for SerialTransport {
    fn open(&self) -> BoxFuture<'_, Result<(LinkReader, LinkWriter)>> {
        async move {
            // the port is exclusive, so the previous bridge must let go of it first
            if let Some(previous) = self.take_bridge() {
                previous.cancel.cancel();
                for thread in previous.threads {
                    if !matches!(tokio::task::spawn_blocking(move || thread.join()).await, Ok(Ok(()))) {
                        warn!(port = %self.port, "serial bridge thread panicked");
                    }
                }
            }

            let reader = self.open_port()?;
            let writer = reader
                .try_clone()
                .map_err(|e| Error::transport(format!("Failed to clone serial port {}: {}", self.port, e)))?;
            info!(port = %self.port, baud = self.baud_rate, "serial port open");

            // The port is blocking, so two threads pump it through an in-memory pipe.
            let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
            let (pipe_rx, pipe_tx) = tokio::io::split(remote);
            let cancel = CancellationToken::new();
            let threads = vec![
                {
                    let (handle, cancel, name) = (Handle::current(), cancel.clone(), self.port.clone());
                    std::thread::spawn(move || pump_port_reads(reader, pipe_tx, handle, cancel, &name))
                },
                {
                    let (handle, cancel, name) = (Handle::current(), cancel.clone(), self.port.clone());
                    std::thread::spawn(move || pump_port_writes(writer, pipe_rx, handle, cancel, &name))
                },
            ];
            *self.bridge.lock().unwrap_or_else(PoisonError::into_inner) = Some(SerialBridge { cancel, threads });

            let (rx, tx) = tokio::io::split(local);
            Ok((Box::new(rx) as LinkReader, Box::new(tx) as LinkWriter))
        }
        .boxed()
    }

    fn close(&self) {
        if let Some(bridge) = self.bridge.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            debug!(port = %self.port, "closing serial port");
            bridge.cancel.cancel();
        }
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port, self.baud_rate)
    }
}

/// Stick behind a TCP serial bridge
pub struct TcpTransport {
    addr: String,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        TcpTransport { addr: addr.to_string() }
    }

    /// Address in `host:port` form, resolved on every open
    pub fn from_host(addr: impl Into<String>) -> Self {
        TcpTransport { addr: addr.into() }
    }
}

impl Transport for TcpTransport {
    fn open(&self) -> BoxFuture<'_, Result<(LinkReader, LinkWriter)>> {
        async move {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| Error::transport(format!("Failed to connect to {}: {}", self.addr, e)))?;
            stream.set_nodelay(true)?;
            SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;
            info!(addr = %self.addr, "bridge connected");
            let (rx, tx) = stream.into_split();
            Ok((Box::new(rx) as LinkReader, Box::new(tx) as LinkWriter))
        }
        .boxed()
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

/// In-memory links, each handed out by one `open`
#[derive(Clone, Default)]
pub struct DuplexTransport {
    links: Arc<Mutex<VecDeque<DuplexStream>>>,
}

impl DuplexTransport {
    pub fn new() -> Self {
        DuplexTransport::default()
    }

    /// Prepares a link for the next `open` and returns the stick's end
    pub fn add_link(&self) -> DuplexStream {
        let (host, stick) = tokio::io::duplex(PIPE_CAPACITY);
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(host);
        stick
    }
}

impl Transport for DuplexTransport {
    fn open(&self) -> BoxFuture<'_, Result<(LinkReader, LinkWriter)>> {
        let link = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        async move {
            let link = link.ok_or_else(|| Error::transport("no link available"))?;
            let (rx, tx) = tokio::io::split(link);
            Ok((Box::new(rx) as LinkReader, Box::new(tx) as LinkWriter))
        }
        .boxed()
    }

    fn describe(&self) -> String {
        "duplex".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_for() {
        let config = ControllerConfig::with_port("127.0.0.1:2540");
        assert_eq!(transport_for(&config).describe(), "tcp://127.0.0.1:2540");

        let config = ControllerConfig::with_port("tcp://stick.local");
        assert_eq!(transport_for(&config).describe(), "tcp://stick.local:2540");

        let config = ControllerConfig::with_port("/dev/ttyUSB0");
        assert_eq!(transport_for(&config).describe(), "/dev/ttyUSB0@115200");
    }

    #[tokio::test]
    async fn test_duplex_link() {
        let transport = DuplexTransport::new();
        let mut stick = transport.add_link();
        let (mut rx, mut tx) = transport.open().await.unwrap();

        tx.write_all(&[0x15]).await.unwrap();
        let mut byte = [0u8; 1];
        stick.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte, [0x15]);

        stick.write_all(&[0x06]).await.unwrap();
        rx.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte, [0x06]);

        assert!(matches!(transport.open().await, Err(Error::Transport(_))));
    }

    /// Port that never has anything to say
    struct QuietPort;

    impl Read for QuietPort {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_millis(5));
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "quiet"))
        }
    }

    #[tokio::test]
    async fn test_serial_reader_stops_on_quiet_line_when_cancelled() {
        let (_local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (_rx, pipe_tx) = tokio::io::split(remote);
        let cancel = CancellationToken::new();

        let (handle, token) = (Handle::current(), cancel.clone());
        let reader = std::thread::spawn(move || pump_port_reads(QuietPort, pipe_tx, handle, token, "quiet"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        cancel.cancel();
        let joined = tokio::time::timeout(
            Duration::from_secs(2),
            tokio::task::spawn_blocking(move || reader.join()),
        )
        .await;
        assert!(matches!(joined, Ok(Ok(Ok(())))));
    }

    #[tokio::test]
    async fn test_serial_writer_stops_when_cancelled() {
        let (_local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (pipe_rx, _tx) = tokio::io::split(remote);
        let cancel = CancellationToken::new();

        let (handle, token) = (Handle::current(), cancel.clone());
        let writer = std::thread::spawn(move || pump_port_writes(Vec::new(), pipe_rx, handle, token, "quiet"));
        cancel.cancel();
        let joined = tokio::time::timeout(
            Duration::from_secs(2),
            tokio::task::spawn_blocking(move || writer.join()),
        )
        .await;
        assert!(matches!(joined, Ok(Ok(Ok(())))));
    }

    #[test]
    fn test_serial_close_without_open() {
        let transport = SerialTransport::new("/dev/ttyUSB0", 115200);
        transport.close();
        assert!(transport.take_bridge().is_none());
    }
}
