//! Bidirectional byte relay between a client and its backend connector.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::connector::Connector;
use crate::net::{ConnectionInfo, NetFlowRecorder};

const RELAY_CHUNK: usize = 8192;

/// Bytes moved by one relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Copy bytes both ways until both sides finish.
///
/// `leftover` (client bytes read before the tunnel was up) is written to the
/// backend first. EOF on one side shuts down the write half of the other. An
/// I/O error on either side ends the relay and both sockets are dropped.
/// With `idle_timeout` set, the relay fails with `TimedOut` once neither
/// direction has moved a byte for that long.
pub async fn relay(
    mut client: TcpStream,
    client_info: &ConnectionInfo,
    leftover: BytesMut,
    connector: Connector,
    idle_timeout: Option<Duration>,
) -> io::Result<RelayStats> {
    let (mut backend, link) = connector.into_parts();

    let mut bytes_to_backend = 0u64;
    if !leftover.is_empty() {
        backend.write_all(&leftover).await?;
        link.inc_to_remote_bytes(leftover.len() as u64);
        bytes_to_backend += leftover.len() as u64;
    }

    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();
    let activity = Activity::new();

    // client -> backend: read from the client, write to the backend.
    let upstream = copy_half(&mut client_read, &mut backend_write, |n| {
        client_info.inc_from_remote_bytes(n);
        link.inc_to_remote_bytes(n);
        activity.touch();
    });
    let downstream = copy_half(&mut backend_read, &mut client_write, |n| {
        link.inc_from_remote_bytes(n);
        client_info.inc_to_remote_bytes(n);
        activity.touch();
    });
    let both = async { tokio::try_join!(upstream, downstream) };

    let (up, down) = match idle_timeout {
        None => both.await?,
        Some(idle) => tokio::select! {
            result = both => result?,
            _ = activity.idle_for(idle) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"));
            }
        },
    };
    Ok(RelayStats {
        bytes_to_backend: bytes_to_backend + up,
        bytes_from_backend: down,
    })
}

/// Last time either relay direction moved data.
struct Activity {
    started: Instant,
    /// Milliseconds after `started`.
    last: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn deadline(&self, idle: Duration) -> Instant {
        self.started + Duration::from_millis(self.last.load(Ordering::Relaxed)) + idle
    }

    /// Resolves once nothing has been touched for `idle`.
    async fn idle_for(&self, idle: Duration) {
        loop {
            let deadline = self.deadline(idle);
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

async fn copy_half<R, W, F>(reader: &mut R, writer: &mut W, on_chunk: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_CHUNK];
    loop {
        match reader.read(&mut buf).await? {
            0 => break,
            n => {
                writer.write_all(&buf[..n]).await?;
                on_chunk(n as u64);
                total += n as u64;
            }
        }
    }
    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_forwards_leftover_and_counts() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let backend = tokio::spawn(async move {
            let (mut stream, _) = backend_listener.accept().await.unwrap();
            let mut received = Vec::new();
            stream.read_to_end(&mut received).await.unwrap();
            stream.write_all(b"reply").await.unwrap();
            received
        });

        let (mut user, proxied) = pair().await;
        let info = ConnectionInfo::new(
            proxied.peer_addr().unwrap(),
            proxied.local_addr().unwrap(),
            None,
        );
        let connector = Connector::connect(backend_addr, Duration::from_secs(1))
            .await
            .unwrap();

        let relay_info = info.clone();
        let relay_task = tokio::spawn(async move {
            relay(
                proxied,
                &relay_info,
                BytesMut::from(&b"early "[..]),
                connector,
                None,
            )
            .await
        });

        user.write_all(b"late").await.unwrap();
        user.shutdown().await.unwrap();
        let mut reply = Vec::new();
        user.read_to_end(&mut reply).await.unwrap();

        assert_eq!(reply, b"reply");
        assert_eq!(backend.await.unwrap(), b"early late");

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.bytes_to_backend, 10);
        assert_eq!(stats.bytes_from_backend, 5);
        assert_eq!(info.stats().from_remote_bytes(), 4);
        assert_eq!(info.stats().to_remote_bytes(), 5);
    }

    #[tokio::test]
    async fn test_copy_half_counts_chunks() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"hello ")
            .read(b"world")
            .build();
        let mut writer = tokio_test::io::Builder::new()
            .write(b"hello ")
            .write(b"world")
            .build();

        let chunks = std::cell::RefCell::new(Vec::new());
        let total = copy_half(&mut reader, &mut writer, |n| chunks.borrow_mut().push(n))
            .await
            .unwrap();
        assert_eq!(total, 11);
        assert_eq!(chunks.into_inner(), [6, 5]);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let _backend = tokio::spawn(async move {
            let (stream, _) = backend_listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let (_user, proxied) = pair().await;
        let info = ConnectionInfo::new(
            proxied.peer_addr().unwrap(),
            proxied.local_addr().unwrap(),
            None,
        );
        let connector = Connector::connect(backend_addr, Duration::from_secs(1))
            .await
            .unwrap();

        let err = relay(
            proxied,
            &info,
            BytesMut::new(),
            connector,
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_relay_one_way_stream_is_not_idle() {
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        let _backend = tokio::spawn(async move {
            let (mut stream, _) = backend_listener.accept().await.unwrap();
            for _ in 0..15 {
                stream.write_all(b"tick").await.unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            // Fall silent but keep the connection open.
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let (mut user, proxied) = pair().await;
        let info = ConnectionInfo::new(
            proxied.peer_addr().unwrap(),
            proxied.local_addr().unwrap(),
            None,
        );
        let connector = Connector::connect(backend_addr, Duration::from_secs(1))
            .await
            .unwrap();

        let relay_info = info.clone();
        let relay_task = tokio::spawn(async move {
            relay(
                proxied,
                &relay_info,
                BytesMut::new(),
                connector,
                Some(Duration::from_millis(150)),
            )
            .await
        });

        // The client never sends; the backend keeps streaming past the idle limit.
        let mut received = vec![0u8; 60];
        tokio::time::timeout(Duration::from_secs(2), user.read_exact(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&received[..4], b"tick");
        assert!(!relay_task.is_finished());

        let err = tokio::time::timeout(Duration::from_secs(2), relay_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert_eq!(info.stats().to_remote_bytes(), 60);
    }
}
