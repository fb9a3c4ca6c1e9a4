//! A small synchronous, length-prefixed, `bincode`-encoded request/response
//! transport over TCP.
//!
//! This plays the role `net_node::NetNode<T>` played for the UDP-multicast
//! predecessor of this crate: a thin wrapper around a socket that knows how
//! to serialize and deserialize the messages this crate exchanges. It is
//! generalized from a fire-and-forget multicast datagram into a
//! connect-per-call request/response exchange with read/write deadlines,
//! because every RPC this crate makes is synchronous and carries a
//! per-call deadline -- a requirement a `send`/`receive` pair over a
//! shared multicast group cannot express.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, RpcStatus};

/// What actually crosses the wire: the caller's deadline (so a handler that
/// picks up the request late can refuse it, mirroring
/// `ServerContext::IsCancelled()` in the system this crate replaces) plus
/// the encoded request payload.
#[derive(Serialize, Deserialize)]
struct RequestEnvelope {
    deadline_unix_ms: u64,
    payload: Vec<u8>,
}

fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

fn unix_millis_after(timeout: Duration) -> u64 {
    unix_millis_now() + timeout.as_millis() as u64
}

fn write_frame<W: Write>(w: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    let len = bytes.len() as u32;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(bytes)?;
    w.flush()
}

fn read_frame<R: Read>(r: &mut R) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn classify_io_err(e: std::io::Error) -> RpcStatus {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            RpcStatus::DeadlineExceeded
        }
        _ => RpcStatus::Unavailable(e.to_string()),
    }
}

/// A stub for a single remote replica, playing the role `MultiPaxos::Stub`
/// / `KeyValueStore::Stub` played in the original: something a service
/// holds one-per-peer and calls methods on. Unlike a long-lived gRPC
/// channel, each call here opens its own TCP connection -- simple, and
/// sufficient at the scale this store targets.
#[derive(Clone, Debug)]
pub struct RpcClient {
    address: SocketAddr,
}

impl RpcClient {
    pub fn new(address: SocketAddr) -> Self {
        RpcClient { address }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Sends `request` and waits up to `timeout` for a response.
    pub fn call<Req, Resp>(&self, request: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut stream = TcpStream::connect_timeout(&self.address, timeout)
            .map_err(|e| RpcStatus::Unavailable(e.to_string()))?;
        stream.set_read_timeout(Some(timeout)).ok();
        stream.set_write_timeout(Some(timeout)).ok();
        stream.set_nodelay(true).ok();

        let payload =
            bincode::serialize(request).map_err(|e| RpcStatus::Internal(e.to_string()))?;
        let envelope = RequestEnvelope {
            deadline_unix_ms: unix_millis_after(timeout),
            payload,
        };
        let encoded =
            bincode::serialize(&envelope).map_err(|e| RpcStatus::Internal(e.to_string()))?;
        write_frame(&mut stream, &encoded).map_err(classify_io_err)?;

        let response_bytes = read_frame(&mut stream).map_err(classify_io_err)?;
        let result: std::result::Result<Resp, RpcStatus> = bincode::deserialize(&response_bytes)
            .map_err(|e| RpcStatus::Internal(e.to_string()))?;
        result
    }
}

/// Runs `handler` against every connection accepted on `listener`, one
/// worker thread per connection so a slow or stuck RPC never blocks
/// unrelated callers. Blocks forever; callers spawn this on its own
/// thread, one per role, matching how each listener in this crate gets
/// its own accept-loop thread.
pub fn serve<Req, Resp, F>(listener: TcpListener, handler: F)
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Result<Resp> + Send + Sync + Clone + 'static,
{
    #[allow(unused_imports)]
    use log::{debug, warn};
    for incoming in listener.incoming() {
        let stream = match incoming {
            Ok(s) => s,
            Err(e) => {
                warn!("accept() failed: {}", e);
                continue;
            }
        };
        let handler = handler.clone();
        std::thread::spawn(move || {
            if let Err(e) = serve_one::<Req, Resp, F>(stream, &handler) {
                debug!("connection ended with error: {:?}", e);
            }
        });
    }
}

fn serve_one<Req, Resp, F>(mut stream: TcpStream, handler: &F) -> std::io::Result<()>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Result<Resp>,
{
    let frame_bytes = read_frame(&mut stream)?;
    let envelope: RequestEnvelope = match bincode::deserialize(&frame_bytes) {
        Ok(e) => e,
        Err(e) => return respond::<Resp>(&mut stream, Err(RpcStatus::Internal(format!("malformed envelope: {}", e)))),
    };

    if unix_millis_now() > envelope.deadline_unix_ms {
        return respond::<Resp>(
            &mut stream,
            Err(RpcStatus::Cancelled(
                "deadline exceeded or client cancelled, abandoning".into(),
            )),
        );
    }

    let request: Req = match bincode::deserialize(&envelope.payload) {
        Ok(r) => r,
        Err(e) => return respond::<Resp>(&mut stream, Err(RpcStatus::Internal(format!("malformed request: {}", e)))),
    };

    let result = handler(request);
    respond(&mut stream, result)
}

fn respond<Resp: Serialize>(
    stream: &mut TcpStream,
    result: std::result::Result<Resp, RpcStatus>,
) -> std::io::Result<()> {
    let encoded =
        bincode::serialize(&result).expect("serializing a response envelope should never fail");
    write_frame(stream, &encoded)
}
