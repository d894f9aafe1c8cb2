use std::io::{self, Write};

use mio::Token;
use tracing::{trace, warn};

/// Outcome of relaying one message.
#[derive(Debug, Default)]
pub struct FanOutReport {
    pub delivered: Vec<Token>,
    pub failed: Vec<(Token, io::Error)>,
}

impl FanOutReport {
    /// Targets whose write failed for a reason other than a full send buffer.
    pub fn broken(&self) -> impl Iterator<Item = Token> + '_ {
        self.failed
            .iter()
            .filter(|(_, err)| err.kind() != io::ErrorKind::WouldBlock)
            .map(|(token, _)| *token)
    }
}

/// Writes `payload` to every target except `source`.
///
/// Each write stands alone: a failure is logged and recorded, then delivery
/// moves on to the next target. Nothing is retried or acknowledged.
pub fn broadcast<'a, W, I>(source: Token, payload: &[u8], targets: I) -> FanOutReport
where
    W: Write + ?Sized + 'a,
    I: IntoIterator<Item = (Token, &'a mut W)>,
{
    let mut report = FanOutReport::default();

    for (token, target) in targets {
        if token == source {
            continue;
        }

        match target.write_all(payload).and_then(|()| target.flush()) {
            Ok(()) => {
                trace!(?token, bytes = payload.len(), "delivered");
                report.delivered.push(token);
            }
            Err(err) => {
                warn!(?token, error = ?err, "failed to deliver message");
                report.failed.push((token, err));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Target {
        received: Vec<u8>,
        fail_with: Option<io::ErrorKind>,
    }

    impl Target {
        fn failing(kind: io::ErrorKind) -> Self {
            Self {
                received: Vec::new(),
                fail_with: Some(kind),
            }
        }
    }

    impl Write for Target {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.fail_with {
                Some(kind) => Err(kind.into()),
                None => {
                    self.received.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn skips_the_source_connection() {
        let mut targets = vec![
            (Token(1), Target::default()),
            (Token(2), Target::default()),
            (Token(3), Target::default()),
        ];

        let report = broadcast(
            Token(1),
            b"hello",
            targets.iter_mut().map(|(token, target)| (*token, target)),
        );

        assert_eq!(report.delivered, vec![Token(2), Token(3)]);
        assert!(report.failed.is_empty());
        assert!(targets[0].1.received.is_empty());
        assert_eq!(targets[1].1.received, b"hello");
        assert_eq!(targets[2].1.received, b"hello");
    }

    #[test]
    fn one_failing_target_does_not_block_the_rest() {
        let mut targets = vec![
            (Token(1), Target::default()),
            (Token(2), Target::failing(io::ErrorKind::BrokenPipe)),
            (Token(3), Target::default()),
            (Token(4), Target::failing(io::ErrorKind::WouldBlock)),
            (Token(5), Target::default()),
        ];

        let report = broadcast(
            Token(1),
            b"hi",
            targets.iter_mut().map(|(token, target)| (*token, target)),
        );

        assert_eq!(report.delivered, vec![Token(3), Token(5)]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(targets[2].1.received, b"hi");
        assert_eq!(targets[4].1.received, b"hi");
        assert_eq!(report.broken().collect::<Vec<_>>(), vec![Token(2)]);
    }

    #[test]
    fn lone_sender_reaches_nobody() {
        let mut only = Target::default();
        let report = broadcast(Token(7), b"echo?", [(Token(7), &mut only)]);
        assert!(report.delivered.is_empty());
        assert!(only.received.is_empty());
    }
}
