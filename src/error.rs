//! Error and Result types shared across the runtime.
//!
//! Kinds mirror §7 of the design: each variant is named for the behavior
//! that raises it rather than for the module that happens to raise it,
//! since several modules can hit "decode error" or "transport error"
//! independently.

use std::io;

/// Result type returned from the fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the codec, server, client, discovery, x-client, and
/// registry components.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure reading from or writing to the underlying transport.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// The handshake `Option` frame failed to decode or its magic number
    /// did not match.
    #[error("invalid handshake: {0}")]
    InvalidOption(String),

    /// A header or body frame failed to decode. Unlike a per-call error,
    /// this desyncs the stream and the connection cannot continue.
    #[error("decode error: {0}")]
    Decode(String),

    /// A header or body value failed to encode.
    #[error("encode error: {0}")]
    Encode(String),

    /// No codec registered under the name the peer asked for.
    #[error("unsupported codec: {0}")]
    UnknownCodec(String),

    /// `serviceMethod` did not contain a `.` separating service and method.
    #[error("service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    /// `serviceMethod` named a service that was never registered.
    #[error("can't find service {0}")]
    UnknownService(String),

    /// `serviceMethod` named a method the service does not admit.
    #[error("can't find method {0}")]
    UnknownMethod(String),

    /// The registered method itself returned an application error.
    #[error("{0}")]
    Method(String),

    /// The server did not finish invoking and replying within the
    /// connection's configured handle timeout.
    #[error("request handle timeout: expect within {0:?}")]
    HandleTimeout(std::time::Duration),

    /// The client failed to establish a connection within `connectTimeout`.
    #[error("connect timeout")]
    ConnectTimeout,

    /// A blocking `Call` was cancelled before it completed.
    #[error("rpc call cancelled")]
    Cancelled,

    /// The client (or its connection) has already been closed.
    #[error("connection is shut down")]
    Shutdown,

    /// `Client::close` was called a second time.
    #[error("connection is already closed")]
    AlreadyClosed,

    /// `Server::register` was called twice for the same service name.
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),

    /// A type name that should be exported (callable remotely) was not.
    #[error("type {0} is not exported")]
    NotExported(String),

    /// The registry's HTTP endpoint could not be reached or returned a
    /// response discovery could not use.
    #[error("registry unreachable: {0}")]
    RegistryUnreachable(String),

    /// No candidate endpoints were available to satisfy a discovery
    /// request.
    #[error("no available servers")]
    NoAvailableServers,

    /// An http-connect dial attempt did not see the expected "connected"
    /// status line.
    #[error("unexpected HTTP CONNECT reply: {0}")]
    UnexpectedConnectReply(String),

    /// `XDial` address did not look like `proto@addr`.
    #[error("rpc client err: wrong format '{0}', expect protocol@addr")]
    MalformedEndpoint(String),
}

impl Error {
    pub(crate) fn decode<E: std::fmt::Display>(e: E) -> Error {
        Error::Decode(e.to_string())
    }

    pub(crate) fn encode<E: std::fmt::Display>(e: E) -> Error {
        Error::Encode(e.to_string())
    }

    /// True for the errors that leave a connection unusable and must tear
    /// down every pending call rather than being reported against a single
    /// `seq`.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Decode(_)
                | Error::InvalidOption(_)
                | Error::UnknownCodec(_)
                | Error::Shutdown
        )
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Transport(e)
    }
}

impl Clone for Error {
    // Pending-call completion and connection teardown both need to hand
    // the same terminal error to several waiters; io::Error isn't Clone,
    // so we flatten to a fresh io::Error built from its kind and message.
    fn clone(&self) -> Error {
        match self {
            Error::Transport(e) => Error::Transport(io::Error::new(e.kind(), e.to_string())),
            Error::InvalidOption(s) => Error::InvalidOption(s.clone()),
            Error::Decode(s) => Error::Decode(s.clone()),
            Error::Encode(s) => Error::Encode(s.clone()),
            Error::UnknownCodec(s) => Error::UnknownCodec(s.clone()),
            Error::IllFormedServiceMethod(s) => Error::IllFormedServiceMethod(s.clone()),
            Error::UnknownService(s) => Error::UnknownService(s.clone()),
            Error::UnknownMethod(s) => Error::UnknownMethod(s.clone()),
            Error::Method(s) => Error::Method(s.clone()),
            Error::HandleTimeout(d) => Error::HandleTimeout(*d),
            Error::ConnectTimeout => Error::ConnectTimeout,
            Error::Cancelled => Error::Cancelled,
            Error::Shutdown => Error::Shutdown,
            Error::AlreadyClosed => Error::AlreadyClosed,
            Error::DuplicateService(s) => Error::DuplicateService(s.clone()),
            Error::NotExported(s) => Error::NotExported(s.clone()),
            Error::RegistryUnreachable(s) => Error::RegistryUnreachable(s.clone()),
            Error::NoAvailableServers => Error::NoAvailableServers,
            Error::UnexpectedConnectReply(s) => Error::UnexpectedConnectReply(s.clone()),
            Error::MalformedEndpoint(s) => Error::MalformedEndpoint(s.clone()),
        }
    }
}
