//! Single-subscriber WebSocket endpoint
//!
//! A non-blocking loopback listener polled once per main-loop iteration.
//! The accepted socket is blocking for the upgrade handshake, then switched
//! to non-blocking so inbound frames can be drained between audio reads
//! without ever stalling the loop. Exactly one subscriber at a time; while
//! one is connected no further accepts are attempted.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;
use thiserror::Error;
use tungstenite::error::Error as WsError;
use tungstenite::handshake::HandshakeError;
use tungstenite::protocol::WebSocketConfig;
use tungstenite::{Message, WebSocket};

/// Commands larger than this are not legitimate; the sender is dropped.
const MAX_COMMAND_BYTES: usize = 4096;

/// Upper bound on a stalled upgrade handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("bind failed: {0}")]
    BindFailed(std::io::Error),
}

/// Bind the loopback listener with SO_REUSEADDR so a restarted daemon does
/// not trip over sockets in TIME_WAIT. std's `TcpListener::bind` cannot set
/// the option before binding, hence socket2.
fn bind_loopback(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    socket.bind(&addr.into())?;
    socket.listen(1)?;
    Ok(socket.into())
}

/// Single-client WebSocket server for the visualizer stream.
pub struct VisServer {
    listener: Option<TcpListener>,
    client: Option<WebSocket<TcpStream>>,
}

impl VisServer {
    /// Bind 127.0.0.1:`port` with SO_REUSEADDR and start listening.
    /// Port 0 picks an ephemeral port (see [`Self::local_port`]).
    pub fn start(port: u16) -> Result<Self, ServerError> {
        let listener = bind_loopback(port).map_err(ServerError::BindFailed)?;
        listener
            .set_nonblocking(true)
            .map_err(ServerError::BindFailed)?;

        log::info!(
            "listening on ws://127.0.0.1:{}",
            listener.local_addr().map(|a| a.port()).unwrap_or(port)
        );
        Ok(Self {
            listener: Some(listener),
            client: None,
        })
    }

    /// The bound port.
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    /// Whether a subscriber is currently connected.
    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// One non-blocking tick: accept a subscriber if none is connected,
    /// otherwise drain inbound frames. Returns the text commands received.
    pub fn poll(&mut self) -> Vec<String> {
        if self.client.is_none() {
            self.try_accept();
            return Vec::new();
        }
        self.drain_client()
    }

    /// Send one binary frame. Returns false (and drops the subscriber) on
    /// failure.
    pub fn send_binary(&mut self, payload: Vec<u8>) -> bool {
        self.send_message(Message::binary(payload))
    }

    /// Send one text frame. Returns false (and drops the subscriber) on
    /// failure.
    pub fn send_text(&mut self, payload: String) -> bool {
        self.send_message(Message::text(payload))
    }

    /// Close the client socket, then the listener.
    pub fn stop(&mut self) {
        if let Some(mut ws) = self.client.take() {
            let _ = ws.close(None);
            let _ = ws.flush();
        }
        self.listener = None;
    }

    fn try_accept(&mut self) {
        let Some(listener) = self.listener.as_ref() else {
            return;
        };
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) => {
                log::warn!("accept failed: {e}");
                return;
            }
        };

        // Blocking for the handshake (the listener's non-blocking flag may
        // be inherited), bounded so a silent peer cannot stall the loop.
        // Nagle off: frame headers and payloads go out without coalescing.
        if stream.set_nonblocking(false).is_err()
            || stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).is_err()
        {
            return;
        }
        let _ = stream.set_nodelay(true);

        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(MAX_COMMAND_BYTES);
        config.max_frame_size = Some(MAX_COMMAND_BYTES);

        match tungstenite::accept_with_config(stream, Some(config)) {
            Ok(ws) => {
                if ws.get_ref().set_nonblocking(true).is_err() {
                    return;
                }
                log::info!("client connected");
                self.client = Some(ws);
            }
            Err(HandshakeError::Failure(e)) => {
                log::debug!("handshake rejected: {e}");
            }
            Err(HandshakeError::Interrupted(_)) => {
                log::debug!("handshake timed out");
            }
        }
    }

    fn drain_client(&mut self) -> Vec<String> {
        let mut commands = Vec::new();
        let mut lost = false;

        if let Some(ws) = self.client.as_mut() {
            loop {
                match ws.read() {
                    Ok(Message::Text(cmd)) => commands.push(cmd),
                    Ok(Message::Close(_)) => {
                        // The close reply is queued internally; push it out
                        // before dropping the socket.
                        let _ = ws.flush();
                        lost = true;
                        break;
                    }
                    // Pings are answered internally; pongs and stray binary
                    // frames are consumed.
                    Ok(_) => {}
                    Err(WsError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {
                        // Nothing further inbound; flush any queued pongs.
                        let _ = ws.flush();
                        break;
                    }
                    Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                        lost = true;
                        break;
                    }
                    Err(e) => {
                        // Oversized payloads and framing violations land here.
                        log::info!("dropping subscriber: {e}");
                        lost = true;
                        break;
                    }
                }
            }
        }

        if lost {
            self.drop_client();
        }
        commands
    }

    fn send_message(&mut self, msg: Message) -> bool {
        let Some(ws) = self.client.as_mut() else {
            return false;
        };
        match ws.send(msg) {
            Ok(()) => true,
            Err(WsError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {
                // Queued but not fully written; retry until the frame is on
                // the wire so frames stay atomic.
                loop {
                    match ws.flush() {
                        Ok(()) => return true,
                        Err(WsError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {
                            std::thread::yield_now();
                        }
                        Err(_) => {
                            self.drop_client();
                            return false;
                        }
                    }
                }
            }
            Err(_) => {
                self.drop_client();
                false
            }
        }
    }

    fn drop_client(&mut self) {
        if self.client.take().is_some() {
            log::info!("client disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    /// Run a server on an ephemeral port in a background thread, invoking
    /// `tick` after each poll with the commands it returned.
    fn spawn_server<F>(mut tick: F) -> (u16, Arc<AtomicBool>, thread::JoinHandle<()>)
    where
        F: FnMut(&mut VisServer, Vec<String>) + Send + 'static,
    {
        let mut server = VisServer::start(0).expect("bind");
        let port = server.local_port().expect("port");
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                let commands = server.poll();
                tick(&mut server, commands);
                thread::sleep(Duration::from_millis(2));
            }
            server.stop();
        });
        (port, stop, handle)
    }

    #[test]
    fn handshake_matches_the_rfc_sample_key() {
        let (port, stop, handle) = spawn_server(|_, _| {});

        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\r\n",
            )
            .expect("send upgrade");

        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).expect("read response");
            assert!(n > 0, "connection closed before 101");
            response.extend_from_slice(&buf[..n]);
        }
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn request_without_key_is_rejected() {
        let (port, stop, handle) = spawn_server(|_, _| {});

        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .expect("send request");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // The server must close the socket without upgrading; a 101 reply
        // would be a protocol violation.
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(_) => break,
            }
        }
        let response = String::from_utf8_lossy(&response);
        assert!(!response.contains("101 Switching Protocols"));

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn streams_binary_and_round_trips_commands() {
        let (cmd_tx, cmd_rx) = mpsc::channel::<String>();
        let (port, stop, handle) = spawn_server(move |server, commands| {
            for cmd in commands {
                server.send_text(format!("{{\"echo\":\"{cmd}\"}}"));
                cmd_tx.send(cmd).unwrap();
            }
            if server.has_client() {
                server.send_binary(crate::protocol::messages::encode_bars(&vec![0.25; 72]));
            }
        });

        let (mut ws, _) =
            tungstenite::connect(format!("ws://127.0.0.1:{port}")).expect("client connect");

        // First binary frame: 72 bars, 4 bytes each
        let payload = loop {
            match ws.read().expect("read frame") {
                Message::Binary(payload) => break payload,
                _ => continue,
            }
        };
        assert_eq!(payload.len(), 288);
        assert_eq!(&payload[..4], &0.25f32.to_le_bytes());

        ws.send(Message::text("SET_BAR_COUNT:16".to_string()))
            .expect("send command");
        let received = cmd_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("command delivered");
        assert_eq!(received, "SET_BAR_COUNT:16");

        // The acknowledgment text frame arrives between binary frames
        let ack = loop {
            match ws.read().expect("read ack") {
                Message::Text(t) => break t,
                _ => continue,
            }
        };
        assert_eq!(ack, "{\"echo\":\"SET_BAR_COUNT:16\"}");

        ws.close(None).ok();
        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn subscriber_close_returns_to_accepting() {
        let (port, stop, handle) = spawn_server(|_, _| {});

        let (mut first, _) =
            tungstenite::connect(format!("ws://127.0.0.1:{port}")).expect("first connect");
        first.close(None).expect("close");
        // Drive the close handshake to completion on the client side.
        loop {
            match first.read() {
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        // The slot frees up and a second subscriber gets in.
        let (mut second, _) =
            tungstenite::connect(format!("ws://127.0.0.1:{port}")).expect("second connect");
        second.close(None).ok();

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
