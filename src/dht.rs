//! The DHT connector (C3): this crawler does not speak Kademlia itself. It
//! opens a long-lived line-oriented TCP control channel to an external DHT
//! node and serialises every command under one mutex.

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{split, AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Any failure talking to the DHT control channel.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// The channel closed (EOF) before a `CLOSE` line was seen.
    Closed,
    Malformed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::Closed => write!(f, "dht control channel closed"),
            Self::Malformed(s) => write!(f, "malformed dht response line: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A long-lived line-oriented connection to the external DHT node.
/// Commands are text lines terminated by LF; responses are lines
/// containing whitespace-separated tokens.
struct DhtConnection {
    reader: BufReader<ReadHalf<TcpStream>>,
    writer: WriteHalf<TcpStream>,
}

/// A handle to the control channel. All commands are serialised by holding
/// `inner`'s async mutex across the write-then-read round trip.
pub struct DhtConnector {
    inner: Mutex<DhtConnection>,
    read_timeout: Duration,
}

impl DhtConnector {
    pub async fn connect(addr: SocketAddr, read_timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = split(stream);
        Ok(Self {
            inner: Mutex::new(DhtConnection {
                reader: BufReader::new(read_half),
                writer,
            }),
            read_timeout,
        })
    }

    /// `get_peers(info_hash_hex, bt_port) -> list of (ip, port)`.
    ///
    /// Reads lines until one contains `CLOSE`. Lines containing `PEER` are
    /// parsed: the last whitespace-separated token is `ip:port`. Unknown
    /// lines are skipped. A read timeout on an otherwise-empty line is not
    /// fatal — it just means no result is ready yet, so polling continues.
    pub async fn get_peers(
        &self,
        info_hash_hex: &str,
        bt_port: u16,
        shutdown: &Arc<AtomicBool>,
    ) -> Result<Vec<(IpAddr, u16)>> {
        let mut conn = self.inner.lock().await;
        let command = format!(
            "0 OPEN 0 HASH {} {}\n",
            info_hash_hex.to_ascii_uppercase(),
            bt_port
        );
        conn.writer.write_all(command.as_bytes()).await?;

        let mut peers = Vec::new();
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return Err(Error::Closed);
            }
            let mut line = String::new();
            let read = tokio::time::timeout(self.read_timeout, conn.reader.read_line(&mut line)).await;
            let n = match read {
                Ok(io_result) => io_result?,
                Err(_elapsed) => continue,
            };
            if n == 0 {
                return Err(Error::Closed);
            }
            let line = line.trim_end();
            if line.contains("CLOSE") {
                break;
            }
            if line.contains("PEER") {
                match parse_peer_line(line) {
                    Some(peer) => peers.push(peer),
                    None => log::warn!("dht: malformed PEER line: {}", line),
                }
            } else {
                log::debug!("dht: ignoring unrecognised line: {}", line);
            }
        }
        Ok(peers)
    }

    /// Sends `STATS\n`, fire-and-forget.
    pub async fn print_stats(&self) -> Result<()> {
        let mut conn = self.inner.lock().await;
        conn.writer.write_all(b"STATS\n").await?;
        Ok(())
    }

    /// Sends `EXIT\n` (graceful) or `KILL\n` (`final`), under the mutex.
    pub async fn close(&self, final_shutdown: bool) -> Result<()> {
        let mut conn = self.inner.lock().await;
        let command: &[u8] = if final_shutdown { b"KILL\n" } else { b"EXIT\n" };
        conn.writer.write_all(command).await?;
        Ok(())
    }
}

/// The last whitespace-separated token of a `PEER` line is `ip:port`.
fn parse_peer_line(line: &str) -> Option<(IpAddr, u16)> {
    let token = line.split_whitespace().last()?;
    let (ip_str, port_str) = token.rsplit_once(':')?;
    let ip = ip_str.parse().ok()?;
    let port = port_str.parse().ok()?;
    Some((ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_line_with_arbitrary_prefix_tokens() {
        let (ip, port) = parse_peer_line("0 PEER found 1.2.3.4:6881").unwrap();
        assert_eq!(ip, "1.2.3.4".parse::<IpAddr>().unwrap());
        assert_eq!(port, 6881);
    }

    #[test]
    fn rejects_peer_line_missing_port() {
        assert!(parse_peer_line("0 PEER found 1.2.3.4").is_none());
    }

    #[tokio::test]
    async fn get_peers_collects_until_close() {
        let mut listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = split(socket);
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert!(line.contains("HASH"));

            write_half
                .write_all(b"0 PEER found 10.0.0.1:6881\n")
                .await
                .unwrap();
            write_half
                .write_all(b"0 UNKNOWN ignored\n")
                .await
                .unwrap();
            write_half
                .write_all(b"0 PEER found 10.0.0.2:6882\n")
                .await
                .unwrap();
            write_half.write_all(b"0 CLOSE\n").await.unwrap();
        });

        let connector = DhtConnector::connect(addr, Duration::from_secs(2))
            .await
            .unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let peers = connector
            .get_peers("ABCD", 6881, &shutdown)
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].1, 6881);
        assert_eq!(peers[1].1, 6882);
    }
}
