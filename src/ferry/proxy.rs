use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::watch,
};

use crate::ferry::{net, socks};

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub buffer_size: usize,
    pub max_handshake_bytes: usize,
}

/// Accept loop. Bind failures abort startup; accept failures are logged and
/// the loop keeps going. Each accepted connection gets its own Tunnel task so
/// a stuck peer never blocks acceptance.
pub async fn serve(listen_addr: &str, opts: TunnelOptions) -> anyhow::Result<()> {
    let bind_addr = net::normalize_bind_addr(listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {listen_addr}"))?;

    tracing::info!(listen_addr = %listen_addr, "socks: listening");

    loop {
        let (conn, peer) = match ln.accept().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(err = %err, "socks: accept failed");
                continue;
            }
        };

        let opts = opts.clone();
        tokio::spawn(async move {
            let sid = new_session_id();
            if tracing::enabled!(tracing::Level::DEBUG) {
                tracing::debug!(sid = %sid, client = %peer, "socks: accepted");
            }
            Tunnel::new(conn, opts).run(&sid).await;
        });
    }
}

/// Per-connection driver. Owns the client connection for its whole life and,
/// once the handshake succeeds, the destination connection too.
struct Tunnel {
    local: TcpStream,
    state: TunnelState,
    opts: TunnelOptions,
}

enum TunnelState {
    AwaitingHandshake,
    Relaying(TcpStream),
}

enum HandshakeEnd {
    /// Request granted; the Tunnel is now `Relaying`.
    Proceed,
    /// Client gone, request refused, or request malformed. Nothing left to do.
    Done,
}

impl Tunnel {
    fn new(local: TcpStream, opts: TunnelOptions) -> Self {
        Self {
            local,
            state: TunnelState::AwaitingHandshake,
            opts,
        }
    }

    async fn run(mut self, sid: &str) {
        match self.handshake(sid).await {
            Ok(HandshakeEnd::Proceed) => {}
            Ok(HandshakeEnd::Done) => {
                let _ = self.local.shutdown().await;
                return;
            }
            Err(err) => {
                tracing::debug!(sid = %sid, err = %err, "socks: handshake ended with error");
                let _ = self.local.shutdown().await;
                return;
            }
        }

        let Tunnel { local, state, opts } = self;
        // Proceed implies the transition to Relaying happened.
        if let TunnelState::Relaying(remote) = state {
            relay(sid, local, remote, opts.buffer_size).await;
        }
    }

    /// Handshake phase: accumulate reads until a complete CONNECT request
    /// parses, then dial the destination and reply. On success the Tunnel
    /// transitions to `Relaying`; the transition is taken at most once.
    async fn handshake(&mut self, sid: &str) -> anyhow::Result<HandshakeEnd> {
        if !matches!(self.state, TunnelState::AwaitingHandshake) {
            anyhow::bail!("handshake re-entered after success");
        }

        let mut captured: Vec<u8> = Vec::with_capacity(self.opts.max_handshake_bytes.min(512));
        let mut tmp = vec![0u8; self.opts.buffer_size];

        let req = loop {
            match socks::parse_connect(&captured) {
                Ok(req) => break req,
                Err(socks::ParseError::NeedMoreData) => {}
                Err(err @ socks::ParseError::Malformed(_)) => {
                    tracing::warn!(sid = %sid, err = %err, "socks: malformed request");
                    return Ok(HandshakeEnd::Done);
                }
            }

            if captured.len() >= self.opts.max_handshake_bytes {
                let err = socks::ParseError::Malformed(format!(
                    "no user-id terminator within {} bytes",
                    self.opts.max_handshake_bytes
                ));
                tracing::warn!(sid = %sid, err = %err, "socks: malformed request");
                return Ok(HandshakeEnd::Done);
            }

            let n = self
                .local
                .read(&mut tmp)
                .await
                .context("read handshake")?;
            if n == 0 {
                tracing::debug!(sid = %sid, "socks: client closed before completing handshake");
                return Ok(HandshakeEnd::Done);
            }
            captured.extend_from_slice(&tmp[..n]);
        };

        if req.version != socks::VERSION || req.command != socks::CMD_CONNECT {
            tracing::warn!(
                sid = %sid,
                version = req.version,
                command = req.command,
                "socks: unexpected version/command; proceeding anyway"
            );
        }

        if req.is_socks4a() {
            tracing::warn!(sid = %sid, addr = %req.addr, "socks: socks4a domain request unsupported");
            self.refuse(sid).await;
            return Ok(HandshakeEnd::Done);
        }

        let dest = SocketAddr::from((req.addr, req.port));
        let mut remote = match TcpStream::connect(dest).await {
            Ok(c) => c,
            Err(err) => {
                tracing::debug!(sid = %sid, dest = %dest, err = %err, "socks: destination dial failed");
                self.refuse(sid).await;
                return Ok(HandshakeEnd::Done);
            }
        };

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(sid = %sid, dest = %dest, "socks: connected to destination");
        }

        // Payload the client pipelined behind the request goes out before the
        // grant reply, so it can never land behind later relay writes.
        if captured.len() > req.header_len {
            remote
                .write_all(&captured[req.header_len..])
                .await
                .context("forward pipelined payload")?;
        }

        self.local
            .write_all(&socks::encode_reply(socks::REPLY_GRANTED))
            .await
            .context("write grant reply")?;

        self.state = TunnelState::Relaying(remote);
        Ok(HandshakeEnd::Proceed)
    }

    async fn refuse(&mut self, sid: &str) {
        let reply = socks::encode_reply(socks::REPLY_REJECTED);
        if let Err(err) = self.local.write_all(&reply).await {
            tracing::debug!(sid = %sid, err = %err, "socks: failed writing refuse reply");
        }
    }
}

/// Relay phase: two legs, one per direction, each reading into its own buffer
/// and writing the chunks verbatim to the opposite connection. The first leg
/// to observe EOF or an error fires the close signal; the other leg picks it
/// up on its next wakeup, so teardown is deterministic and each connection is
/// closed exactly once.
async fn relay(sid: &str, local: TcpStream, remote: TcpStream, buffer_size: usize) {
    let (lr, lw) = local.into_split();
    let (rr, rw) = remote.into_split();
    let (close_tx, close_rx) = watch::channel(false);

    let down = tokio::spawn(relay_leg(
        sid.to_string(),
        "remote->local",
        rr,
        lw,
        buffer_size,
        close_tx.clone(),
        close_rx.clone(),
    ));

    relay_leg(
        sid.to_string(),
        "local->remote",
        lr,
        rw,
        buffer_size,
        close_tx,
        close_rx,
    )
    .await;

    let _ = down.await;
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(sid = %sid, "socks: tunnel closed");
    }
}

async fn relay_leg(
    sid: String,
    direction: &'static str,
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    buffer_size: usize,
    close_tx: watch::Sender<bool>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; buffer_size];
    let mut total: u64 = 0;

    loop {
        tokio::select! {
            res = close_rx.changed() => {
                if res.is_err() || *close_rx.borrow() {
                    break;
                }
            }
            res = src.read(&mut buf) => {
                match res {
                    Ok(0) => {
                        let _ = close_tx.send(true);
                        break;
                    }
                    Ok(n) => {
                        total += n as u64;
                        if let Err(err) = dst.write_all(&buf[..n]).await {
                            tracing::debug!(sid = %sid, direction, err = %err, "socks: relay write failed");
                            let _ = close_tx.send(true);
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(sid = %sid, direction, err = %err, "socks: relay read failed");
                        let _ = close_tx.send(true);
                        break;
                    }
                }
            }
        }
    }

    // Half-close our direction; the sockets close once both legs have exited
    // and dropped their halves.
    let _ = dst.shutdown().await;
    if tracing::enabled!(tracing::Level::DEBUG) {
        tracing::debug!(sid = %sid, direction, bytes = total, "socks: relay leg ended");
    }
}

fn new_session_id() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(1);
    format!("s{}", SEQ.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::IpAddr, time::Duration};

    fn test_opts() -> TunnelOptions {
        TunnelOptions {
            buffer_size: 65536,
            max_handshake_bytes: 512,
        }
    }

    fn build_request(port: u16, addr: [u8; 4], user_id: &[u8]) -> Vec<u8> {
        let mut out = vec![socks::VERSION, socks::CMD_CONNECT];
        out.extend(port.to_be_bytes());
        out.extend(addr);
        out.extend(user_id);
        out.push(0);
        out
    }

    async fn spawn_proxy(opts: TunnelOptions) -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (conn, _) = ln.accept().await.unwrap();
                let opts = opts.clone();
                tokio::spawn(async move {
                    let sid = new_session_id();
                    Tunnel::new(conn, opts).run(&sid).await;
                });
            }
        });
        addr
    }

    /// Accepts connections forever, echoing every chunk back until EOF.
    async fn spawn_echo_backend() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut s, _) = ln.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match s.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if s.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    async fn connect_through(proxy: SocketAddr, dest: SocketAddr) -> TcpStream {
        let mut c = TcpStream::connect(proxy).await.unwrap();
        let IpAddr::V4(ip) = dest.ip() else {
            panic!("expected ipv4 destination");
        };
        c.write_all(&build_request(dest.port(), ip.octets(), b""))
            .await
            .unwrap();
        let mut reply = [0u8; 8];
        c.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, socks::encode_reply(socks::REPLY_GRANTED));
        c
    }

    #[tokio::test]
    async fn grants_and_relays_both_directions() {
        let backend = spawn_echo_backend().await;
        let proxy = spawn_proxy(test_opts()).await;

        let mut c = connect_through(proxy, backend).await;

        c.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ping");

        c.write_all(b"second round").await.unwrap();
        let mut got = [0u8; 12];
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"second round");
    }

    #[tokio::test]
    async fn refuses_unreachable_destination_then_closes() {
        // Grab a port that is guaranteed closed by binding and dropping.
        let dead = {
            let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ln.local_addr().unwrap()
        };
        let proxy = spawn_proxy(test_opts()).await;

        let mut c = TcpStream::connect(proxy).await.unwrap();
        c.write_all(&build_request(dead.port(), [127, 0, 0, 1], b"nobody"))
            .await
            .unwrap();

        let mut reply = [0u8; 8];
        c.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, socks::encode_reply(socks::REPLY_REJECTED));

        // The proxy closes the connection after refusing.
        let mut rest = [0u8; 1];
        assert_eq!(c.read(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reassembles_fragmented_handshake() {
        let backend = spawn_echo_backend().await;
        let proxy = spawn_proxy(test_opts()).await;

        let IpAddr::V4(ip) = backend.ip() else {
            panic!("expected ipv4 destination");
        };
        let req = build_request(backend.port(), ip.octets(), b"frag");

        let mut c = TcpStream::connect(proxy).await.unwrap();
        c.write_all(&req[..4]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        c.write_all(&req[4..]).await.unwrap();

        let mut reply = [0u8; 8];
        c.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, socks::encode_reply(socks::REPLY_GRANTED));

        c.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");
    }

    #[tokio::test]
    async fn forwards_pipelined_payload_before_grant() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = ln.local_addr().unwrap();

        let backend_task = tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            let mut got = [0u8; 5];
            s.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"early");
            let mut got = [0u8; 5];
            s.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, b"later");
            s.write_all(b"ok").await.unwrap();
        });

        let proxy = spawn_proxy(test_opts()).await;
        let IpAddr::V4(ip) = backend.ip() else {
            panic!("expected ipv4 destination");
        };

        // Request and payload in one write, before any reply is read.
        let mut bytes = build_request(backend.port(), ip.octets(), b"");
        bytes.extend(b"early");
        let mut c = TcpStream::connect(proxy).await.unwrap();
        c.write_all(&bytes).await.unwrap();

        let mut reply = [0u8; 8];
        c.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, socks::encode_reply(socks::REPLY_GRANTED));

        c.write_all(b"later").await.unwrap();
        let mut got = [0u8; 2];
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"ok");

        backend_task.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_socks4a_domain_requests() {
        let proxy = spawn_proxy(test_opts()).await;

        let mut bytes = build_request(443, [0, 0, 0, 9], b"user");
        bytes.extend(b"example.com\0");
        let mut c = TcpStream::connect(proxy).await.unwrap();
        c.write_all(&bytes).await.unwrap();

        let mut reply = [0u8; 8];
        c.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, socks::encode_reply(socks::REPLY_REJECTED));
    }

    #[tokio::test]
    async fn closes_oversized_handshake_without_reply() {
        let proxy = spawn_proxy(TunnelOptions {
            buffer_size: 65536,
            max_handshake_bytes: 32,
        })
        .await;

        // Header with a user-id that never terminates.
        let mut bytes = vec![socks::VERSION, socks::CMD_CONNECT, 0, 80, 127, 0, 0, 1];
        bytes.extend(std::iter::repeat_n(b'x', 64));
        let mut c = TcpStream::connect(proxy).await.unwrap();
        c.write_all(&bytes).await.unwrap();

        // No reply at all; the connection just closes.
        let mut got = [0u8; 1];
        assert_eq!(c.read(&mut got).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn destination_close_ends_tunnel() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = ln.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut s, _) = ln.accept().await.unwrap();
            s.write_all(b"bye").await.unwrap();
            // Dropping s closes the destination side mid-relay.
        });

        let proxy = spawn_proxy(test_opts()).await;
        let mut c = connect_through(proxy, backend).await;

        let mut got = [0u8; 3];
        c.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"bye");

        let mut rest = [0u8; 1];
        assert_eq!(c.read(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closing_one_tunnel_leaves_others_running() {
        let backend = spawn_echo_backend().await;
        let proxy = spawn_proxy(test_opts()).await;

        let c1 = connect_through(proxy, backend).await;
        let mut c2 = connect_through(proxy, backend).await;

        drop(c1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        c2.write_all(b"still here").await.unwrap();
        let mut got = [0u8; 10];
        c2.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"still here");
    }
}
