use std::{io, net::SocketAddr};

use anyhow::{Context, Result};
use mio::{Token, net::TcpListener};
use tracing::{debug, info, warn};

use crate::{
    event_loop::{Dispatcher, EventLoop, Flow, LoopStats, ReadinessEvent, ShutdownHandle},
    fanout,
    message::{Message, read_available, write_message},
    registry::ConnectionRegistry,
};

/// Privacy notice written to every newly accepted connection.
pub const WELCOME_TEXT: &str =
    "You are not friends with anyone else in this chat room. Please mind your privacy.";

/// Chat relay that rebroadcasts whatever a client sends to every other client.
pub struct RelayServer {
    event_loop: EventLoop,
    relay: Relay,
}

impl RelayServer {
    pub fn bind(addr: SocketAddr, welcome: impl Into<String>, event_capacity: usize) -> Result<Self> {
        let mut event_loop = EventLoop::new(event_capacity).context("failed to create poller")?;
        let listener =
            TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
        event_loop
            .registry_mut()
            .register_listener(listener)
            .context("failed to register listener")?;

        Ok(Self {
            event_loop,
            relay: Relay::new(welcome),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.event_loop.registry().listener_addr()
    }

    pub fn shutdown_handle(&mut self) -> io::Result<ShutdownHandle> {
        self.event_loop.shutdown_handle()
    }

    /// Serves clients on the calling thread until shut down or until the
    /// readiness wait itself fails.
    pub fn run(mut self) -> Result<LoopStats> {
        self.event_loop
            .run(&mut self.relay)
            .context("event loop terminated")?;
        Ok(self.event_loop.stats())
    }
}

/// Server-side dispatcher: accept and greet, read and fan out.
struct Relay {
    welcome: Message,
}

impl Relay {
    fn new(welcome: impl Into<String>) -> Self {
        Self {
            welcome: Message::new(welcome),
        }
    }

    /// Accepts every pending connection. Readiness is edge triggered, so
    /// stopping early would leave peers waiting until the next arrival.
    fn accept_pending(&self, registry: &mut ConnectionRegistry) -> io::Result<()> {
        let mut first_error = None;

        loop {
            let (stream, peer) = match registry.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if is_transient_accept_error(&err) => {
                    debug!(error = ?err, "peer vanished before accept");
                    continue;
                }
                Err(err) => {
                    first_error.get_or_insert(err);
                    break;
                }
            };

            if let Err(err) = self.admit(registry, stream, peer) {
                warn!(%peer, error = ?err, "failed to admit client");
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn admit(
        &self,
        registry: &mut ConnectionRegistry,
        stream: mio::net::TcpStream,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let token = registry.register(stream, peer)?;
        let greeted = match registry.get_mut(token) {
            Some(connection) => write_message(connection.stream_mut(), &self.welcome),
            None => Ok(()),
        };
        if let Err(err) = greeted {
            registry.remove(token);
            return Err(err);
        }

        info!(%peer, ?token, clients = registry.len(), "client connected");
        Ok(())
    }

    fn relay_from(&self, registry: &mut ConnectionRegistry, token: Token) -> io::Result<Flow> {
        let Some(connection) = registry.get_mut(token) else {
            debug!(?token, "readiness for a connection that is already gone");
            return Ok(Flow::Continue);
        };
        let peer = connection.peer();

        let drained = match read_available(connection.stream_mut()) {
            Ok(drained) => drained,
            Err(err) => {
                registry.remove(token);
                return Err(err);
            }
        };

        if !drained.closed {
            registry.reregister(token)?;
        }

        if let Some(message) = drained.message {
            info!(%peer, bytes = message.as_bytes().len(), ":: {message}");
            self.fan_out(registry, token, &message);
        }

        if drained.closed {
            registry.remove(token);
            info!(%peer, clients = registry.len(), "client disconnected");
        }

        Ok(Flow::Continue)
    }

    fn fan_out(&self, registry: &mut ConnectionRegistry, source: Token, message: &Message) {
        let report = fanout::broadcast(
            source,
            message.as_bytes(),
            registry
                .connections_mut()
                .map(|(token, connection)| (token, connection.stream_mut())),
        );

        debug!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "fan-out finished"
        );

        for token in report.broken() {
            if let Some(connection) = registry.remove(token) {
                info!(peer = %connection.peer(), "dropped client after failed delivery");
            }
        }
    }
}

/// Accept failures that concern only the peer being accepted. Anything else,
/// such as running out of descriptors, stops the accept round.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

impl Dispatcher for Relay {
    fn dispatch(
        &mut self,
        registry: &mut ConnectionRegistry,
        event: ReadinessEvent,
    ) -> io::Result<Flow> {
        match event {
            ReadinessEvent::Acceptable => self.accept_pending(registry).map(|()| Flow::Continue),
            ReadinessEvent::Readable(token) => self.relay_from(registry, token),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{Shutdown, TcpStream},
        thread,
        time::Duration,
    };

    use super::*;

    fn local_server() -> RelayServer {
        RelayServer::bind("127.0.0.1:0".parse().expect("addr"), "welcome!", 64).expect("bind")
    }

    /// Drives the relay on the test thread until `done` holds.
    fn turn_until(server: &mut RelayServer, done: impl Fn(&ConnectionRegistry) -> bool) {
        for _ in 0..100 {
            if done(server.event_loop.registry()) {
                return;
            }
            server
                .event_loop
                .turn(&mut server.relay, Some(Duration::from_millis(50)))
                .expect("turn");
        }
        panic!("relay never reached the expected state");
    }

    /// Connects a client, lets the relay admit it, and consumes the welcome.
    fn join(server: &mut RelayServer) -> TcpStream {
        let before = server.event_loop.registry().len();
        let stream = TcpStream::connect(server.local_addr().expect("addr")).expect("connect");
        turn_until(server, |registry| registry.len() == before + 1);
        read_welcome(stream)
    }

    fn read_welcome(mut stream: TcpStream) -> TcpStream {
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("timeout");
        let mut welcome = [0u8; 8];
        stream.read_exact(&mut welcome).expect("welcome");
        assert_eq!(&welcome, b"welcome!");
        stream
    }

    fn token_of(server: &mut RelayServer, client: &TcpStream) -> Token {
        let local = client.local_addr().expect("local addr");
        server
            .event_loop
            .registry_mut()
            .connections_mut()
            .find(|(_, connection)| connection.peer() == local)
            .map(|(token, _)| token)
            .expect("client registered")
    }

    fn start() -> (SocketAddr, ShutdownHandle, thread::JoinHandle<Result<LoopStats>>) {
        let mut server = RelayServer::bind("127.0.0.1:0".parse().expect("addr"), "welcome!", 64)
            .expect("bind");
        let addr = server.local_addr().expect("addr");
        let shutdown = server.shutdown_handle().expect("shutdown handle");
        let handle = thread::spawn(move || server.run());
        (addr, shutdown, handle)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        read_welcome(TcpStream::connect(addr).expect("connect"))
    }

    #[test]
    fn relays_between_two_clients_and_shuts_down() {
        let (addr, shutdown, handle) = start();

        let mut alice = connect(addr);
        let mut bob = connect(addr);

        alice.write_all(b"ping").expect("send");
        let mut buf = [0u8; 4];
        bob.read_exact(&mut buf).expect("bob receives");
        assert_eq!(&buf, b"ping");

        shutdown.shutdown().expect("shutdown");
        let stats = handle.join().expect("server thread").expect("clean stop");
        assert!(stats.iterations >= 3);
        assert_eq!(stats.handler_errors, 0);
    }

    #[test]
    fn closed_peer_is_pruned_without_counting_an_error() {
        let mut server = local_server();
        let alice = join(&mut server);
        let _bob = join(&mut server);

        drop(alice);
        turn_until(&mut server, |registry| registry.len() == 1);

        assert_eq!(server.event_loop.stats().handler_errors, 0);
    }

    #[test]
    fn reset_peer_is_pruned_and_counted() {
        let mut server = local_server();
        let alice = TcpStream::connect(server.local_addr().expect("addr")).expect("connect");
        turn_until(&mut server, |registry| registry.len() == 1);

        // Closing with the welcome still unread makes the kernel send a reset.
        thread::sleep(Duration::from_millis(50));
        drop(alice);
        turn_until(&mut server, ConnectionRegistry::is_empty);

        assert_eq!(server.event_loop.stats().handler_errors, 1);
    }

    #[test]
    fn failed_delivery_drops_only_the_broken_target() {
        let mut server = local_server();
        let alice = join(&mut server);
        let mut bob = join(&mut server);
        let carol = join(&mut server);

        let from = token_of(&mut server, &alice);
        let broken = token_of(&mut server, &carol);
        server
            .event_loop
            .registry_mut()
            .get_mut(broken)
            .expect("carol registered")
            .stream_mut()
            .shutdown(Shutdown::Write)
            .expect("shutdown carol's write side");

        let registry = server.event_loop.registry_mut();
        server.relay.fan_out(registry, from, &Message::new("x"));

        assert_eq!(server.event_loop.registry().len(), 2);
        assert!(server.event_loop.registry_mut().get_mut(broken).is_none());
        assert!(server.event_loop.registry_mut().get_mut(from).is_some());

        let mut buf = [0u8; 1];
        bob.read_exact(&mut buf).expect("bob still receives");
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn failed_welcome_leaves_nothing_registered() {
        let mut server = local_server();
        let _client = TcpStream::connect(server.local_addr().expect("addr")).expect("connect");

        let (stream, peer) = loop {
            match server.event_loop.registry().accept() {
                Ok(accepted) => break accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        };
        stream.shutdown(Shutdown::Write).expect("shutdown write side");

        let registry = server.event_loop.registry_mut();
        server
            .relay
            .admit(registry, stream, peer)
            .expect_err("welcome cannot be written");

        assert!(server.event_loop.registry().is_empty());
    }

    #[test]
    fn only_peer_specific_accept_failures_are_skipped() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
        ] {
            assert!(is_transient_accept_error(&io::Error::from(kind)), "{kind:?}");
        }
        assert!(!is_transient_accept_error(&io::Error::from(
            io::ErrorKind::OutOfMemory
        )));
        assert!(!is_transient_accept_error(&io::Error::other(
            "too many open files"
        )));
    }

    #[test]
    fn bind_reports_the_address_in_use() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = taken.local_addr().expect("addr");

        let err = RelayServer::bind(addr, WELCOME_TEXT, 16)
            .err()
            .expect("second bind must fail");
        assert!(format!("{err:#}").contains("failed to bind"));
    }
}
