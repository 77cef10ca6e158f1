//! Per-connection state machine: `AwaitingNickname -> Active -> Terminated`.
//!
//! A session owns the read half of its socket. Everything it sends to other
//! clients goes through [`Relay`], and teardown runs no matter how the active
//! loop ends, including a panic inside it.

use std::{io, panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;
use tokio::{io::AsyncBufRead, select};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, LineReader},
    protocol::{self, Command},
    relay::Relay,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingNickname,
    Active { nickname: String },
    Terminated,
}

pub struct Session<R> {
    relay: Relay,
    connection: Arc<Connection>,
    reader: LineReader<R>,
    state: SessionState,
}

impl<R> Session<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(relay: Relay, connection: Arc<Connection>, reader: LineReader<R>) -> Self {
        Self {
            relay,
            connection,
            reader,
            state: SessionState::AwaitingNickname,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Drives the session until the client quits, the socket fails, or the
    /// connection is evicted by another session.
    pub async fn run(mut self) {
        if self.register().await {
            let active = AssertUnwindSafe(self.run_active()).catch_unwind().await;
            if active.is_err() {
                warn!(connection = %self.connection.id(), "session loop panicked");
            }
        }
        self.teardown().await;
    }

    /// Reads the nickname line and enters `Active`. Returns `false` when the
    /// session should go straight to teardown.
    async fn register(&mut self) -> bool {
        let candidate = match self.reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => String::new(),
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                debug!(connection = %self.connection.id(), ?error, "unreadable nickname");
                return self.refuse(&protocol::unreadable_nickname()).await;
            }
            Err(error) => {
                debug!(connection = %self.connection.id(), ?error, "failed to read nickname");
                String::new()
            }
        };

        let nickname = candidate.trim();
        if nickname.is_empty() {
            return self.refuse(&protocol::empty_nickname()).await;
        }

        self.relay
            .registry()
            .register(Arc::clone(&self.connection), nickname)
            .await;
        self.state = SessionState::Active {
            nickname: nickname.to_string(),
        };
        info!(peer = ?self.connection.peer(), nickname, "client joined");

        if let Err(error) = self.connection.send(&protocol::welcome()).await {
            debug!(connection = %self.connection.id(), ?error, "failed to send welcome");
            return false;
        }

        self.relay
            .broadcast(&protocol::joined(nickname), Some(self.connection.id()))
            .await;
        true
    }

    /// Sends `reason`, closes the connection without registering, and
    /// returns `false`.
    async fn refuse(&mut self, reason: &str) -> bool {
        if let Err(error) = self.connection.send(reason).await {
            debug!(connection = %self.connection.id(), ?error, "failed to refuse nickname");
        }
        self.connection.close().await;
        self.state = SessionState::Terminated;
        false
    }

    async fn run_active(&mut self) {
        loop {
            let line = select! {
                line = self.reader.read_line() => line,
                _ = self.connection.closed() => {
                    debug!(connection = %self.connection.id(), "connection closed by relay");
                    break;
                }
            };

            match line {
                Ok(Some(line)) => {
                    if !self.handle_line(&line).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    debug!(connection = %self.connection.id(), ?error, "read failed");
                    break;
                }
            }
        }
    }

    /// Applies one client line. Returns `false` when the session should end.
    async fn handle_line(&self, line: &str) -> bool {
        let SessionState::Active { nickname } = &self.state else {
            return false;
        };

        match Command::parse(line) {
            Command::Empty => true,
            Command::Quit => false,
            Command::WhisperUsage => self.reply(&protocol::whisper_usage()).await,
            Command::Whisper { target, content } => {
                self.relay
                    .whisper(nickname, &target, &content, &self.connection)
                    .await;
                true
            }
            Command::Say { text } => {
                self.relay
                    .broadcast(
                        &protocol::chat(nickname, &text),
                        Some(self.connection.id()),
                    )
                    .await;
                true
            }
        }
    }

    async fn reply(&self, line: &str) -> bool {
        match self.connection.send(line).await {
            Ok(()) => true,
            Err(error) => {
                debug!(connection = %self.connection.id(), ?error, "failed to reply to client");
                false
            }
        }
    }

    /// Unregisters, closes, and announces the departure if this session was
    /// still registered. Running it again is harmless.
    pub async fn teardown(&mut self) {
        self.state = SessionState::Terminated;
        self.relay.disconnect(&self.connection).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, BufReader, DuplexStream, duplex};

    use super::*;
    use crate::{
        connection::{ConnectionId, SendError},
        registry::Registry,
    };

    fn inbox(stream: DuplexStream) -> LineReader<BufReader<DuplexStream>> {
        LineReader::new(BufReader::new(stream))
    }

    async fn recv(reader: &mut LineReader<BufReader<DuplexStream>>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), reader.read_line())
            .await
            .expect("timed out waiting for a line")
            .expect("read line")
    }

    async fn assert_silent(reader: &mut LineReader<BufReader<DuplexStream>>) {
        let next = tokio::time::timeout(Duration::from_millis(100), reader.read_line()).await;
        assert!(next.is_err(), "unexpected line: {next:?}");
    }

    /// Builds a session whose client side is returned as (outgoing, incoming).
    fn session(
        relay: &Relay,
    ) -> (
        Session<BufReader<DuplexStream>>,
        DuplexStream,
        LineReader<BufReader<DuplexStream>>,
    ) {
        let (client_out, server_in) = duplex(1024);
        let (server_out, client_in) = duplex(1024);
        let connection = Arc::new(Connection::new(ConnectionId::next(), None, server_out));
        let session = Session::new(relay.clone(), connection, inbox(server_in));
        (session, client_out, inbox(client_in))
    }

    #[tokio::test]
    async fn blank_nickname_is_refused_without_registering() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (session, mut client_out, mut client_in) = session(&relay);

        client_out.write_all(b"   \n").await.unwrap();
        session.run().await;

        assert_eq!(recv(&mut client_in).await, Some(protocol::empty_nickname()));
        assert_eq!(recv(&mut client_in).await, None);
        assert!(relay.registry().is_empty().await);
    }

    #[tokio::test]
    async fn undecodable_nickname_gets_its_own_refusal() {
        let relay = Relay::default();
        let (session, mut client_out, mut client_in) = session(&relay);

        client_out.write_all(b"caf\xe9\n").await.unwrap();
        session.run().await;

        assert_eq!(
            recv(&mut client_in).await,
            Some(protocol::unreadable_nickname())
        );
        assert_eq!(recv(&mut client_in).await, None);
        assert!(relay.registry().is_empty().await);
    }

    #[tokio::test]
    async fn nickname_is_trimmed_and_joiner_gets_only_the_welcome() {
        let relay = Relay::default();
        let (bob, mut bob_in) = {
            let (writer, reader) = duplex(1024);
            let connection = Arc::new(Connection::new(ConnectionId::next(), None, writer));
            relay
                .registry()
                .register(Arc::clone(&connection), "bob")
                .await;
            (connection, inbox(reader))
        };
        let (mut alice, mut alice_out, mut alice_in) = session(&relay);

        alice_out.write_all(b"  alice \n").await.unwrap();
        assert!(alice.register().await);

        assert_eq!(
            alice.state(),
            &SessionState::Active {
                nickname: "alice".into()
            }
        );
        assert_eq!(recv(&mut alice_in).await, Some(protocol::welcome()));
        assert_silent(&mut alice_in).await;
        assert_eq!(recv(&mut bob_in).await, Some(protocol::joined("alice")));
        assert!(!bob.is_closed());
    }

    #[tokio::test]
    async fn teardown_twice_announces_departure_once() {
        let relay = Relay::default();
        let (bob, mut bob_in) = {
            let (writer, reader) = duplex(1024);
            let connection = Arc::new(Connection::new(ConnectionId::next(), None, writer));
            relay
                .registry()
                .register(Arc::clone(&connection), "bob")
                .await;
            (connection, inbox(reader))
        };
        let (mut alice, mut alice_out, _alice_in) = session(&relay);

        alice_out.write_all(b"alice\n").await.unwrap();
        assert!(alice.register().await);
        assert_eq!(recv(&mut bob_in).await, Some(protocol::joined("alice")));

        alice.teardown().await;
        alice.teardown().await;

        assert_eq!(alice.state(), &SessionState::Terminated);
        assert!(alice.connection().is_closed());
        assert_eq!(recv(&mut bob_in).await, Some(protocol::departed("alice")));
        assert_silent(&mut bob_in).await;
        assert_eq!(relay.registry().nicknames().await, vec!["bob".to_string()]);
        assert!(!bob.is_closed());
    }

    #[tokio::test]
    async fn session_ends_when_evicted() {
        let relay = Relay::default();
        let (session, mut client_out, mut client_in) = session(&relay);
        let connection = Arc::clone(session.connection());

        client_out.write_all(b"alice\n").await.unwrap();
        let running = tokio::spawn(session.run());
        assert_eq!(recv(&mut client_in).await, Some(protocol::welcome()));

        assert_eq!(relay.evict(&connection).await.as_deref(), Some("alice"));
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("session should stop after eviction")
            .unwrap();
        assert_eq!(recv(&mut client_in).await, None);
    }

    #[tokio::test]
    async fn teardown_completes_while_a_send_to_the_leaver_is_stalled() {
        let relay = Relay::default();
        let (bob, mut bob_in) = {
            let (writer, reader) = duplex(1024);
            let connection = Arc::new(Connection::new(ConnectionId::next(), None, writer));
            relay
                .registry()
                .register(Arc::clone(&connection), "bob")
                .await;
            (connection, inbox(reader))
        };
        let (alice, mut alice_out, mut alice_in) = session(&relay);
        let alice_connection = Arc::clone(alice.connection());

        alice_out.write_all(b"alice\n").await.unwrap();
        let running = tokio::spawn(alice.run());
        assert_eq!(recv(&mut alice_in).await, Some(protocol::welcome()));
        assert_eq!(recv(&mut bob_in).await, Some(protocol::joined("alice")));

        // Alice stops reading, so this send fills the pipe and blocks.
        let stalled = tokio::spawn(async move { alice_connection.send(&"x".repeat(8192)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stalled.is_finished());

        drop(alice_out);

        assert_eq!(recv(&mut bob_in).await, Some(protocol::departed("alice")));
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("alice's session should finish")
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), stalled)
            .await
            .expect("stalled sender should finish")
            .unwrap();
        assert!(matches!(result, Err(SendError::Closed)));
        assert_eq!(relay.registry().nicknames().await, vec!["bob".to_string()]);
        assert!(!bob.is_closed());
    }

    #[tokio::test]
    async fn malformed_whisper_keeps_session_alive() {
        let relay = Relay::default();
        let (session, mut client_out, mut client_in) = session(&relay);

        client_out
            .write_all(b"alice\n/w bob\n\n/w alice echo\n/quit\nignored\n")
            .await
            .unwrap();
        session.run().await;

        assert_eq!(recv(&mut client_in).await, Some(protocol::welcome()));
        assert_eq!(recv(&mut client_in).await, Some(protocol::whisper_usage()));
        assert_eq!(
            recv(&mut client_in).await,
            Some(protocol::whisper("alice", "echo"))
        );
        assert_eq!(
            recv(&mut client_in).await,
            Some(protocol::whisper_sent("alice", "echo"))
        );
        assert_eq!(recv(&mut client_in).await, None);
        assert!(relay.registry().is_empty().await);
    }
}
