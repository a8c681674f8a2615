//! C3: accept connections, negotiate options, dispatch requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::{read_frame, write_frame, Header, WireCodec};
use crate::common::drain;
use crate::error::{Error, Result};
use crate::option::ConnectOption;
use crate::service::{Service, ServiceMap};

/// Owns the registered services and accepts connections for them.
///
/// Generic over the wire codec rather than negotiating it per connection
/// by name: a server is built for exactly one codec, and a connecting
/// client's `Option.codec` is checked against it rather than used to pick
/// among several.
pub struct Server<Cod: WireCodec> {
    services: ServiceMap<Cod>,
    codec: Cod,
}

impl<Cod: WireCodec> std::fmt::Debug for Server<Cod> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("codec", &self.codec.name()).finish()
    }
}

impl<Cod: WireCodec> Server<Cod> {
    /// Creates a server with no services registered yet.
    pub fn new(codec: Cod) -> Arc<Self> {
        Arc::new(Server {
            services: ServiceMap::default(),
            codec,
        })
    }

    /// Registers `service`. Fails if a service by the same name is
    /// already registered.
    pub fn register(&self, service: Service<Cod>) -> Result<()> {
        self.services.register(service)
    }

    /// Accepts connections from `listener` forever, spawning one serve
    /// task per connection. Returns only on a listener-level error.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(?peer, "accepted connection");
            let this = self.clone();
            tokio::spawn(async move {
                this.serve_conn(stream).await;
            });
        }
    }

    /// Runs the full lifecycle of one connection: handshake, pipelined
    /// request dispatch, and graceful drain of in-flight dispatch tasks
    /// on exit.
    pub async fn serve_conn<T>(self: Arc<Self>, stream: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);

        let opt = match read_frame(&mut reader)
            .await
            .and_then(|bytes| self.codec.decode::<ConnectOption>(&bytes))
        {
            Ok(opt) => opt,
            Err(e) => {
                warn!(error = %e, "rejecting connection: invalid handshake");
                return;
            }
        };
        if !opt.magic_is_valid() {
            warn!(magic = opt.magic, "rejecting connection: bad magic number");
            return;
        }
        if opt.codec != self.codec.name() {
            warn!(requested = %opt.codec, have = self.codec.name(), "rejecting connection: unsupported codec");
            return;
        }

        let writer = Arc::new(AsyncMutex::new(writer));
        let (signal, watch) = drain::channel();

        loop {
            let header_bytes = match read_frame(&mut reader).await {
                Ok(b) => b,
                Err(_) => break,
            };
            let header: Header = match self.codec.decode(&header_bytes) {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, "decode error on header, closing connection");
                    break;
                }
            };
            let body = match read_frame(&mut reader).await {
                Ok(b) => b,
                Err(_) => break,
            };

            let this = self.clone();
            let writer = writer.clone();
            let watch = watch.clone();
            let handle_timeout = opt.handle_timeout;
            tokio::spawn(async move {
                let _watch = watch;
                this.dispatch_one(header, body, writer, handle_timeout).await;
            });
        }

        signal.drain().await;
    }

    async fn dispatch_one<W>(
        self: Arc<Self>,
        header: Header,
        body: Vec<u8>,
        writer: Arc<AsyncMutex<W>>,
        handle_timeout: Duration,
    ) where
        W: AsyncWrite + Unpin,
    {
        // No timeout to race against: invoke inline, same as an untimed
        // call, with no extra task.
        let result = if handle_timeout.is_zero() {
            self.invoke(&header, &body).await
        } else {
            // `invoke` runs as its own task ("called") so the timeout
            // only stops *waiting* on it — dropping a `JoinHandle` does
            // not abort the task it refers to. The method body keeps
            // running to completion in the background; its eventual
            // result is simply never looked at again, matching the
            // one-sided timeout in the design (the server does not
            // propagate a timeout into the method it is timing out on).
            let invoke_header = header.clone();
            let this = self.clone();
            let called = tokio::spawn(async move { this.invoke(&invoke_header, &body).await });
            match tokio::time::timeout(handle_timeout, called).await {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => Err(Error::Method(format!("method task failed: {e}"))),
                Err(_) => Err(Error::HandleTimeout(handle_timeout)),
            }
        };

        let (error, reply_bytes) = match result {
            Ok(bytes) => (String::new(), bytes),
            Err(e) => (e.to_string(), Vec::new()),
        };
        let resp_header = Header {
            service_method: header.service_method,
            seq: header.seq,
            error,
        };

        let header_bytes = match self.codec.encode(&resp_header) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode response header");
                return;
            }
        };

        let mut w = writer.lock().await;
        if write_frame(&mut *w, &header_bytes).await.is_err() {
            return;
        }
        if write_frame(&mut *w, &reply_bytes).await.is_err() {
            return;
        }
        let _ = w.flush().await;
    }

    async fn invoke(&self, header: &Header, body: &[u8]) -> Result<Vec<u8>> {
        let (service, method) = self.services.find(&header.service_method)?;
        service.call(&method, body, &self.codec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc as StdArc;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::TcpStream;

    #[derive(Serialize, Deserialize)]
    struct SumArgs {
        num1: i64,
        num2: i64,
    }

    struct Calc;

    async fn start_test_server(handle_timeout: Duration) -> (std::net::SocketAddr, Arc<Server<BincodeCodec>>) {
        let server = Server::new(BincodeCodec);
        let calc = StdArc::new(Calc);
        let service = crate::service::ServiceBuilder::<BincodeCodec>::new("Calc")
            .unwrap()
            .method("Sum", calc.clone(), |_c, args: SumArgs| async move {
                Ok::<i64, Error>(args.num1 + args.num2)
            })
            .unwrap()
            .method("Sleep", calc, move |_c, millis: u64| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<i64, Error>(0)
            })
            .unwrap()
            .build();
        server.register(service).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = server.clone();
        tokio::spawn(async move {
            let _ = srv.serve(listener).await;
        });
        let _ = handle_timeout;
        (addr, server)
    }

    #[tokio::test]
    async fn unknown_method_yields_error_header_and_connection_stays_usable() {
        let (addr, _server) = start_test_server(Duration::ZERO).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut r, mut w) = tokio::io::split(stream);
        let codec = BincodeCodec;
        let opt = ConnectOption::default();
        write_frame(&mut w, &codec.encode(&opt).unwrap()).await.unwrap();

        let header = Header::request("Calc.Mul", 1);
        write_frame(&mut w, &codec.encode(&header).unwrap()).await.unwrap();
        write_frame(&mut w, &codec.encode(&SumArgs { num1: 2, num2: 3 }).unwrap())
            .await
            .unwrap();
        w.flush().await.unwrap();

        let resp_header: Header = codec.decode(&read_frame(&mut r).await.unwrap()).unwrap();
        let _ = read_frame(&mut r).await.unwrap();
        assert!(resp_header.error.contains("can't find method"));

        let header2 = Header::request("Calc.Sum", 2);
        write_frame(&mut w, &codec.encode(&header2).unwrap()).await.unwrap();
        write_frame(&mut w, &codec.encode(&SumArgs { num1: 2, num2: 3 }).unwrap())
            .await
            .unwrap();
        w.flush().await.unwrap();
        let resp_header2: Header = codec.decode(&read_frame(&mut r).await.unwrap()).unwrap();
        let reply: i64 = codec.decode(&read_frame(&mut r).await.unwrap()).unwrap();
        assert!(resp_header2.error.is_empty());
        assert_eq!(reply, 5);
    }
}
