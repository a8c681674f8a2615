//! C4: one connection to one server — sequencing, the pending-call table,
//! the background reader, and the blocking/asynchronous call APIs.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use crate::codec::{read_frame, write_frame, Header, WireCodec};
use crate::common::io::Rewind;
use crate::error::{Error, Result};
use crate::option::ConnectOption;

/// What the reader hands back for one `seq`: the reply's still-encoded
/// bytes on success, or the terminal error.
type PendingResult = Result<Vec<u8>>;

/// A call that has been sent and is waiting on its matching response.
/// Returned by [`Client::go`]; `await`ed (via [`PendingCall::done`]) or
/// raced against cancellation (via [`Client::call`]).
pub struct PendingCall<Cod: WireCodec, Reply> {
    /// The sequence number this call was registered under.
    pub seq: u64,
    rx: oneshot::Receiver<PendingResult>,
    codec: Cod,
    _marker: PhantomData<Reply>,
}

impl<Cod: WireCodec, Reply> std::fmt::Debug for PendingCall<Cod, Reply> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall").field("seq", &self.seq).finish()
    }
}

impl<Cod: WireCodec, Reply: DeserializeOwned> PendingCall<Cod, Reply> {
    /// Waits for the call to complete, decoding the reply.
    pub async fn done(self) -> Result<Reply> {
        match self.rx.await {
            Ok(Ok(bytes)) => self.codec.decode(&bytes),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Shutdown),
        }
    }
}

/// What a pending call is registered under: the one-shot the returned
/// [`PendingCall`] consumes, plus an optional shared channel the caller
/// handed to [`Client::go`] to learn of completion without holding the
/// `PendingCall` itself — lets one channel fan in completions from many
/// calls in flight at once.
struct PendingEntry {
    tx: oneshot::Sender<PendingResult>,
    done: Option<mpsc::Sender<u64>>,
}

/// One connection to one server. Multiplexes many concurrent calls over
/// that single connection using a per-client sequence counter and a
/// pending-call table.
pub struct Client<Cod: WireCodec> {
    codec: Cod,
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: StdMutex<HashMap<u64, PendingEntry>>,
    next_seq: AtomicU64,
    closing: AtomicBool,
    shutdown: AtomicBool,
}

/// Fulfills `entry`'s one-shot with `result` and, if a done channel was
/// supplied, pings it with `seq`. `try_send` is deliberate: a full or
/// dropped done channel must never block or fail call completion.
fn complete_pending(entry: PendingEntry, seq: u64, result: PendingResult) {
    let _ = entry.tx.send(result);
    if let Some(done) = entry.done {
        let _ = done.try_send(seq);
    }
}

impl<Cod: WireCodec> std::fmt::Debug for Client<Cod> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("codec", &self.codec.name())
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .field("is_available", &self.is_available())
            .finish()
    }
}

impl<Cod: WireCodec> Client<Cod> {
    /// Writes `opt` as the connection's first frame, wraps `stream` in the
    /// codec, and starts the background reader. `seq` starts at 1; 0 is
    /// reserved as "invalid".
    async fn new_over<T>(mut stream: T, opt: ConnectOption, codec: Cod) -> Result<Arc<Self>>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let opt_bytes = codec.encode(&opt)?;
        write_frame(&mut stream, &opt_bytes).await?;
        stream.flush().await?;

        let (reader, writer) = tokio::io::split(stream);
        let client = Arc::new(Client {
            codec,
            writer: AsyncMutex::new(Box::new(writer)),
            pending: StdMutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
            closing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        let reader_client = client.clone();
        tokio::spawn(async move {
            reader_client.receive_loop(reader).await;
        });

        Ok(client)
    }

    /// Connects over TCP, respecting `opt.connect_timeout`.
    pub async fn dial(addr: &str, opt: ConnectOption, codec: Cod) -> Result<Arc<Self>> {
        let connect_timeout = opt.connect_timeout;
        let attempt = async move {
            let stream = TcpStream::connect(addr).await?;
            Client::new_over(stream, opt, codec).await
        };
        if connect_timeout.is_zero() {
            attempt.await
        } else {
            tokio::time::timeout(connect_timeout, attempt)
                .await
                .unwrap_or(Err(Error::ConnectTimeout))
        }
    }

    /// Connects over TCP, then performs an HTTP `CONNECT` upgrade before
    /// handing the socket to the RPC codec — for tunneling through an
    /// ordinary HTTP server/proxy that recognizes `rpc_path`.
    pub async fn dial_http(
        addr: &str,
        rpc_path: &str,
        registry_name: &str,
        opt: ConnectOption,
        codec: Cod,
    ) -> Result<Arc<Self>> {
        let connect_timeout = opt.connect_timeout;
        let expected = format!("200 Connected to {registry_name}");
        let attempt = async move {
            let mut stream = TcpStream::connect(addr).await?;
            stream
                .write_all(format!("CONNECT {rpc_path} HTTP/1.0\r\n\r\n").as_bytes())
                .await?;
            stream.flush().await?;

            let mut buf = Vec::new();
            let mut chunk = [0u8; 512];
            let boundary = loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(Error::UnexpectedConnectReply(
                        "connection closed before status line".into(),
                    ));
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(idx) = find_double_crlf(&buf) {
                    break idx + 4;
                }
                if buf.len() > 8 * 1024 {
                    return Err(Error::UnexpectedConnectReply("status line too long".into()));
                }
            };

            let head = String::from_utf8_lossy(&buf[..boundary]);
            let status_line = head.lines().next().unwrap_or_default();
            if !status_line.contains(&expected) {
                return Err(Error::UnexpectedConnectReply(status_line.to_string()));
            }

            let mut rewind = Rewind::new(stream);
            rewind.rewind(Bytes::copy_from_slice(&buf[boundary..]));
            Client::new_over(rewind, opt, codec).await
        };
        if connect_timeout.is_zero() {
            attempt.await
        } else {
            tokio::time::timeout(connect_timeout, attempt)
                .await
                .unwrap_or(Err(Error::ConnectTimeout))
        }
    }

    /// Dials `"proto@addr"`. `http` goes through [`Client::dial_http`];
    /// every other protocol (`tcp`, `unix`, ...) goes through the plain
    /// [`Client::dial`]. `addr` must contain exactly one `@`.
    pub async fn xdial(
        endpoint: &str,
        registry_name: &str,
        opt: ConnectOption,
        codec: Cod,
    ) -> Result<Arc<Self>> {
        let parts: Vec<&str> = endpoint.split('@').collect();
        if parts.len() != 2 {
            return Err(Error::MalformedEndpoint(endpoint.to_string()));
        }
        let (proto, addr) = (parts[0], parts[1]);
        match proto {
            "http" => {
                let rpc_path = format!("/_{registry_name}_");
                Client::dial_http(addr, &rpc_path, registry_name, opt, codec).await
            }
            _ => Client::dial(addr, opt, codec).await,
        }
    }

    async fn receive_loop<R: AsyncRead + Unpin>(self: Arc<Self>, mut reader: R) {
        loop {
            match self.receive_one(&mut reader).await {
                Ok(()) => continue,
                Err(e) => {
                    self.terminate(e);
                    break;
                }
            }
        }
    }

    async fn receive_one<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<()> {
        let header_bytes = read_frame(reader).await?;
        let header: Header = self.codec.decode(&header_bytes)?;
        let body = read_frame(reader).await?;

        let entry = self.pending.lock().unwrap().remove(&header.seq);
        match entry {
            // Response for a seq we no longer track: either a call we
            // cancelled locally, or one whose send partially failed and
            // was already completed by the sender. Either way, discard.
            None => {}
            Some(entry) => {
                let result = if !header.error.is_empty() {
                    Err(Error::Method(header.error))
                } else {
                    Ok(body)
                };
                complete_pending(entry, header.seq, result);
            }
        }
        Ok(())
    }

    /// Drains the pending table, completing every outstanding call with
    /// `err`, and marks the client unavailable.
    fn terminate(&self, err: Error) {
        self.shutdown.store(true, Ordering::SeqCst);
        let pending: Vec<_> = self.pending.lock().unwrap().drain().collect();
        for (seq, entry) in pending {
            complete_pending(entry, seq, Err(err.clone()));
        }
    }

    async fn send<Args: Serialize>(
        &self,
        service_method: &str,
        args: &Args,
        done: Option<mpsc::Sender<u64>>,
    ) -> Result<(u64, oneshot::Receiver<PendingResult>)> {
        // Send mutex first, then briefly the pending mutex — the global
        // lock order this crate follows everywhere a sender touches both.
        let mut writer = self.writer.lock().await;

        let (seq, rx) = {
            let mut pending = self.pending.lock().unwrap();
            // Checked under the same lock that registers the call: a
            // `close()` racing with us either hasn't set the flag yet
            // (and we register normally) or already has (and we fail
            // here instead of writing to a shut-down writer).
            if self.closing.load(Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
                return Err(Error::Shutdown);
            }
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            pending.insert(seq, PendingEntry { tx, done });
            (seq, rx)
        };

        let header = Header::request(service_method, seq);
        let write_result: Result<()> = async {
            let header_bytes = self.codec.encode(&header)?;
            let body_bytes = self.codec.encode(args)?;
            write_frame(&mut *writer, &header_bytes).await?;
            write_frame(&mut *writer, &body_bytes).await?;
            writer.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            // If the reader already completed this call (unlikely this
            // soon, but possible under reordering), removal finds
            // nothing and we do nothing further — both paths tolerate
            // the other treating "not found" as a no-op.
            if let Some(entry) = self.pending.lock().unwrap().remove(&seq) {
                complete_pending(entry, seq, Err(e.clone()));
            }
            return Err(e);
        }

        Ok((seq, rx))
    }

    /// Sends the call and returns immediately with a handle to await
    /// later, without blocking on completion.
    ///
    /// `done`, if given, is pinged with the call's `seq` the moment it
    /// completes — the same channel can be shared across many `go` calls
    /// so one reader can learn of completions across all of them without
    /// awaiting each returned [`PendingCall`] individually. A zero-capacity
    /// channel would deadlock the completer, but `tokio::sync::mpsc`
    /// already refuses to construct one, so there is nothing further to
    /// enforce here.
    pub async fn go<Args, Reply>(
        &self,
        service_method: &str,
        args: &Args,
        done: Option<mpsc::Sender<u64>>,
    ) -> Result<PendingCall<Cod, Reply>>
    where
        Args: Serialize,
        Reply: DeserializeOwned,
    {
        let (seq, rx) = self.send(service_method, args, done).await?;
        Ok(PendingCall {
            seq,
            rx,
            codec: self.codec.clone(),
            _marker: PhantomData,
        })
    }

    /// `go` followed by blocking on completion, with no cancellation.
    pub async fn call_without_timeout<Args, Reply>(
        &self,
        service_method: &str,
        args: &Args,
    ) -> Result<Reply>
    where
        Args: Serialize,
        Reply: DeserializeOwned,
    {
        self.go(service_method, args, None).await?.done().await
    }

    /// Blocks until either completion or `cancel` firing. On
    /// cancellation, the call is dropped from the pending table (so the
    /// reader discards its response if one ever arrives) and no message
    /// is sent to the server — cancellation is purely client-local.
    pub async fn call<Args, Reply>(
        &self,
        cancel: &CancellationToken,
        service_method: &str,
        args: &Args,
    ) -> Result<Reply>
    where
        Args: Serialize,
        Reply: DeserializeOwned,
    {
        let (seq, rx) = self.send(service_method, args, None).await?;
        tokio::select! {
            res = rx => match res {
                Ok(Ok(bytes)) => self.codec.decode(&bytes),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::Shutdown),
            },
            _ = cancel.cancelled() => {
                self.pending.lock().unwrap().remove(&seq);
                Err(Error::Cancelled)
            }
        }
    }

    /// Idempotent: a second call returns [`Error::AlreadyClosed`].
    /// Shutting down the writer causes the peer to observe EOF, which
    /// the background reader sees too, draining pending via `terminate`.
    pub async fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyClosed);
        }
        let mut w = self.writer.lock().await;
        let _ = w.shutdown().await;
        Ok(())
    }

    /// `true` iff neither closing nor shut down.
    pub fn is_available(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !self.shutdown.load(Ordering::SeqCst)
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
