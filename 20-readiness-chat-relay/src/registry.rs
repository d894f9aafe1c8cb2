use std::{collections::HashMap, io, net::SocketAddr};

use mio::{
    Interest, Registry, Token,
    net::{TcpListener, TcpStream},
};
use tracing::debug;

/// Token reserved for the listening socket.
pub const LISTENER: Token = Token(0);

/// Token reserved for the shutdown waker of an event loop.
pub const WAKER: Token = Token(usize::MAX - 1);

const FIRST_CLIENT: usize = 1;

/// A client socket tracked by the event loop.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Sockets registered with one readiness poller.
///
/// The listener is subscribed for accept readiness and every client for read
/// readiness. Nothing is ever subscribed for write readiness: writes are
/// issued directly and are expected to complete.
pub struct ConnectionRegistry {
    registry: Registry,
    listener: Option<TcpListener>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
}

impl ConnectionRegistry {
    pub(crate) fn new(registry: Registry) -> Self {
        Self {
            registry,
            listener: None,
            connections: HashMap::new(),
            next_token: FIRST_CLIENT,
        }
    }

    /// Subscribes the listening socket for accept readiness.
    pub fn register_listener(&mut self, mut listener: TcpListener) -> io::Result<()> {
        // mio reports pending connections on a listener as readable
        self.registry
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        if let Some(mut previous) = self.listener.replace(listener) {
            self.registry.deregister(&mut previous)?;
        }
        Ok(())
    }

    pub fn listener_addr(&self) -> io::Result<SocketAddr> {
        self.listener()?.local_addr()
    }

    /// Accepts one pending connection from the registered listener.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener()?.accept()
    }

    fn listener(&self) -> io::Result<&TcpListener> {
        self.listener
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no listener registered"))
    }

    /// Subscribes a non-blocking client stream for read readiness.
    pub fn register(&mut self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<Token> {
        let token = self.allocate_token();
        self.registry
            .register(&mut stream, token, Interest::READABLE)?;
        self.connections.insert(token, Connection { stream, peer });
        debug!(?token, %peer, "registered connection");
        Ok(token)
    }

    /// Renews the read subscription of a connection. Harmless if it is
    /// already subscribed.
    pub fn reregister(&mut self, token: Token) -> io::Result<()> {
        match self.connections.get_mut(&token) {
            Some(connection) => {
                self.registry
                    .reregister(&mut connection.stream, token, Interest::READABLE)
            }
            None => Err(unknown_token(token)),
        }
    }

    /// Deregisters and drops a connection, closing its socket.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        let mut connection = self.connections.remove(&token)?;
        if let Err(err) = self.registry.deregister(&mut connection.stream) {
            debug!(?token, error = ?err, "deregister failed; dropping anyway");
        }
        Some(connection)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.connections.get_mut(&token)
    }

    /// Every registered client connection, in no particular order.
    pub fn connections_mut(&mut self) -> impl Iterator<Item = (Token, &mut Connection)> {
        self.connections
            .iter_mut()
            .map(|(token, connection)| (*token, connection))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let candidate = Token(self.next_token);
            self.next_token = match self.next_token.wrapping_add(1) {
                n if n == WAKER.0 => FIRST_CLIENT,
                n => n,
            };
            if !self.connections.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

fn unknown_token(token: Token) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no connection registered for {token:?}"),
    )
}
