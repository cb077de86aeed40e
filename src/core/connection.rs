use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::cluster::address::Endpoint;
use crate::core::command;
use crate::core::config::Credential;
use crate::proto::codec::{Decoder, Encoder};
use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const READ_CHUNK: usize = 4096;

/// How to open and guard a connection.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// Deadline for the TCP handshake plus authentication.
    pub connect_timeout: Duration,
    /// Deadline for each reply. `None` waits forever (pub/sub).
    pub read_timeout: Option<Duration>,
    /// Credential sent with `AUTH` right after connecting.
    pub credential: Option<Credential>,
}

/// A single request/response connection to one node.
///
/// The connection remembers whether it is still usable: any I/O error,
/// decode error or timeout marks it broken, and so does abandoning a request
/// between writing it and reading its reply (a late reply would otherwise be
/// read by the next user). Pools consult [`is_connected`](Self::is_connected)
/// before reusing it.
pub struct Connection<S = TcpStream> {
    stream: S,
    decoder: Decoder,
    encoder: Encoder,
    scratch: Vec<u8>,
    read_timeout: Option<Duration>,
    broken: bool,
    in_flight: bool,
}

impl Connection<TcpStream> {
    /// Dials `endpoint` and authenticates if a credential is configured.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] if the handshake exceeds the connect timeout,
    /// [`Error::Io`] if the dial fails, [`Error::Auth`] if `AUTH` is rejected.
    pub async fn connect(endpoint: &Endpoint, settings: &ConnectSettings) -> Result<Self> {
        let dial = TcpStream::connect((endpoint.host(), endpoint.port()));
        let stream = tokio::time::timeout(settings.connect_timeout, dial)
            .await
            .map_err(|_| Error::Timeout {
                operation: "connecting",
                after: settings.connect_timeout,
            })??;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%endpoint, error = %e, "failed to set TCP_NODELAY");
        }

        let mut conn = Connection::new(stream).with_read_timeout(settings.read_timeout);
        if let Some(credential) = &settings.credential {
            let auth = tokio::time::timeout(settings.connect_timeout, conn.authenticate(credential));
            auth.await.map_err(|_| Error::Timeout {
                operation: "authenticating",
                after: settings.connect_timeout,
            })??;
        }
        debug!(%endpoint, "connected");
        Ok(conn)
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established stream. No read timeout is configured.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
            scratch: vec![0u8; READ_CHUNK],
            read_timeout: None,
            broken: false,
            in_flight: false,
        }
    }

    /// Sets the per-reply read deadline.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Returns true while the connection can carry another request.
    pub fn is_connected(&self) -> bool {
        !self.broken && !self.in_flight
    }

    /// Writes one frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.encoder.encode(frame);
        let data = self.encoder.take();
        if let Err(e) = self.stream.write_all(&data).await {
            self.broken = true;
            return Err(Error::Io { source: e });
        }
        Ok(())
    }

    /// Reads one frame, honouring the read timeout.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        let result = match self.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.read_frame_inner()).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: "reading a reply",
                    after: limit,
                }),
            },
            None => self.read_frame_inner().await,
        };
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn read_frame_inner(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.decode()? {
                return Ok(frame);
            }
            let n = self.stream.read(&mut self.scratch).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.decoder.append(&self.scratch[..n]);
        }
    }

    /// Sends `frame` and waits for its reply.
    ///
    /// Error replies are returned as `Ok(Frame::Error(..))`; interpreting them
    /// is the caller's business.
    pub async fn request(&mut self, frame: &Frame) -> Result<Frame> {
        self.in_flight = true;
        self.write_frame(frame).await?;
        let reply = self.read_frame().await?;
        self.in_flight = false;
        Ok(reply)
    }

    /// Sends `AUTH` with the given credential.
    pub async fn authenticate(&mut self, credential: &Credential) -> Result<()> {
        let password = credential.password_str().to_string();
        let cmd = match credential.username() {
            Some(user) => command::auth_with_username(user.to_string(), password),
            None => command::auth(password),
        };
        match self.request(&cmd.into_frame()).await? {
            Frame::Error(_) => Err(Error::Auth),
            _ => Ok(()),
        }
    }

    /// Flushes and shuts down the write half.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.broken = true;
        self.stream.shutdown().await?;
        Ok(())
    }
}

impl<S> fmt::Debug for Connection<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("stream", &self.stream)
            .field("read_timeout", &self.read_timeout)
            .field("broken", &self.broken)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_request_reads_reply_split_across_writes() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(client);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            server.write_all(b"+PO").await.unwrap();
            server.flush().await.unwrap();
            tokio::task::yield_now().await;
            server.write_all(b"NG\r\n").await.unwrap();
            server
        });

        let reply = conn.request(&Frame::Array(vec![Frame::bulk("PING")])).await.unwrap();
        assert_eq!(reply, Frame::simple("PONG"));
        assert!(conn.is_connected());
        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_peer_close_marks_broken() {
        let (client, server) = duplex(64);
        let mut conn = Connection::new(client);
        drop(server);

        let err = conn.request(&Frame::Array(vec![Frame::bulk("PING")])).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(!conn.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_marks_broken() {
        let (client, _server) = duplex(64);
        let mut conn = Connection::new(client).with_read_timeout(Some(Duration::from_millis(50)));

        let err = conn.request(&Frame::Array(vec![Frame::bulk("PING")])).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "reading a reply", .. }));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_abandoned_request_is_not_reusable() {
        let (client, _server) = duplex(64);
        let mut conn = Connection::new(client);
        let ping = Frame::Array(vec![Frame::bulk("PING")]);
        {
            let pending = conn.request(&ping);
            tokio::pin!(pending);
            // Poll once so the write happens, then drop the request.
            let _ = futures::poll!(pending.as_mut());
        }
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let (client, mut server) = duplex(128);
        let mut conn = Connection::new(client);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 128];
            let _ = server.read(&mut buf).await.unwrap();
            server.write_all(b"-WRONGPASS invalid password\r\n").await.unwrap();
            server
        });

        let err = conn
            .authenticate(&Credential::password("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth));
        drop(server_task.await.unwrap());
    }
}
