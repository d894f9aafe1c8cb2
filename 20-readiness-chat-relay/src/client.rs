use std::{
    io::{self, BufRead, Write},
    net::{Shutdown, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    event_loop::{Dispatcher, EventLoop, Flow, ReadinessEvent},
    message::read_available,
    registry::ConnectionRegistry,
};

/// Capacity of the receive loop's event buffer; it only watches one socket.
const RECEIVE_EVENT_CAPACITY: usize = 16;

/// Pause before retrying a send that hit a full socket buffer.
const SEND_RETRY_DELAY: Duration = Duration::from_millis(5);

pub const QUIT_COMMAND: &str = "/quit";

pub fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let writer = stream
        .try_clone()
        .context("failed to clone connection for sending")?;
    stream
        .set_nonblocking(true)
        .context("failed to switch connection to non-blocking mode")?;

    let leaving = Arc::new(AtomicBool::new(false));
    let receiver = spawn_receive_loop(
        mio::net::TcpStream::from_std(stream),
        io::stdout(),
        Arc::clone(&leaving),
    )?;

    thread::Builder::new()
        .name("stdin-forwarder".into())
        .spawn(move || {
            let input = io::stdin().lock();
            if let Err(error) = forward_lines(input, writer, io::stdout(), &leaving) {
                warn!(?error, "stopped forwarding input");
            }
        })
        .context("failed to spawn input thread")?;

    receiver
        .join()
        .map_err(|_| anyhow!("receive loop panicked"))?
        .context("receive loop failed")?;
    Ok(())
}

/// Starts the background loop that prints everything the server sends.
///
/// The loop ends once the server closes the connection, or once the
/// connection is shut down locally. `leaving` is raised by the local side
/// before it shuts the socket down, so that close is not reported as the
/// server going away.
pub fn spawn_receive_loop<W>(
    stream: mio::net::TcpStream,
    out: W,
    leaving: Arc<AtomicBool>,
) -> Result<JoinHandle<io::Result<()>>>
where
    W: Write + Send + 'static,
{
    let mut event_loop =
        EventLoop::new(RECEIVE_EVENT_CAPACITY).context("failed to create poller")?;
    let peer = stream.peer_addr().context("connection has no peer")?;
    event_loop
        .registry_mut()
        .register(stream, peer)
        .context("failed to register connection")?;

    let handle = thread::Builder::new()
        .name("receive-loop".into())
        .spawn(move || {
            let mut printer = Printer::new(out, leaving);
            event_loop.run(&mut printer)
        })
        .context("failed to spawn receive loop")?;
    Ok(handle)
}

/// Client-side dispatcher that writes each received message on its own line.
struct Printer<W> {
    out: W,
    leaving: Arc<AtomicBool>,
}

impl<W: Write> Printer<W> {
    fn new(out: W, leaving: Arc<AtomicBool>) -> Self {
        Self { out, leaving }
    }

    fn left_locally(&self) -> bool {
        self.leaving.load(Ordering::SeqCst)
    }

    fn print_line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.out, "{line}")?;
        self.out.flush()
    }

    fn receive(&mut self, registry: &mut ConnectionRegistry, token: mio::Token) -> io::Result<Flow> {
        let Some(connection) = registry.get_mut(token) else {
            return Ok(Flow::Continue);
        };

        let drained = match read_available(connection.stream_mut()) {
            Ok(drained) => drained,
            Err(err) => {
                registry.remove(token);
                if !self.left_locally() {
                    warn!(error = ?err, "connection to server lost");
                    self.print_line("*** connection lost")?;
                }
                return Ok(Flow::Stop);
            }
        };

        if !drained.closed {
            registry.reregister(token)?;
        }

        if let Some(message) = drained.message {
            self.print_line(message.as_str())?;
        }

        if drained.closed {
            registry.remove(token);
            if !self.left_locally() {
                self.print_line("*** server closed the connection")?;
            }
            return Ok(Flow::Stop);
        }

        Ok(Flow::Continue)
    }
}

impl<W: Write> Dispatcher for Printer<W> {
    fn dispatch(
        &mut self,
        registry: &mut ConnectionRegistry,
        event: ReadinessEvent,
    ) -> io::Result<Flow> {
        match event {
            ReadinessEvent::Acceptable => {
                debug!("receive loop has no listener; ignoring accept readiness");
                Ok(Flow::Continue)
            }
            ReadinessEvent::Readable(token) => self.receive(registry, token),
        }
    }
}

/// Sends each non-empty input line to the server, without its line ending.
///
/// `/quit` or the end of input raises `leaving` and shuts the connection
/// down, which also ends the receive loop.
pub fn forward_lines<R, O>(
    input: R,
    mut connection: TcpStream,
    mut out: O,
    leaving: &AtomicBool,
) -> io::Result<()>
where
    R: BufRead,
    O: Write,
{
    for line in input.lines() {
        let line = line?;
        let text = line.trim_end();
        if text.is_empty() {
            continue;
        }
        if text.eq_ignore_ascii_case(QUIT_COMMAND) {
            break;
        }
        send_text(&mut connection, text)?;
    }

    leaving.store(true, Ordering::SeqCst);
    writeln!(out, "*** leaving chat")?;
    out.flush()?;
    connection.shutdown(Shutdown::Both)
}

/// Writes all of `text`, waiting out a full send buffer.
///
/// The sending half shares its socket with the receive loop, which runs it in
/// non-blocking mode.
fn send_text<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    let mut remaining = text.as_bytes();
    while !remaining.is_empty() {
        match writer.write(remaining) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => remaining = &remaining[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(SEND_RETRY_DELAY),
            Err(err) => return Err(err),
        }
    }
    writer.flush()
}
