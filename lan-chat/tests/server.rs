use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use lan_chat::{
    ChatError, ServerConfig, ServerHandle,
    protocol::{read_line, write_line},
    server,
    sink::{EventSink, TracingSink},
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Connects, claims `username` and consumes the roster update that
    /// confirms the registration.
    async fn join(addr: SocketAddr, username: &str) -> Result<Self> {
        let mut client = Self::connect(addr).await?;
        client.send(username).await?;
        let roster = client.recv().await?;
        if !roster.starts_with("USERS:") {
            return Err(anyhow!("{username} expected a roster, got '{roster}'"));
        }
        Ok(client)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        write_line(&mut self.writer, line)
            .await
            .with_context(|| format!("failed to send '{line}'"))
    }

    async fn recv(&mut self) -> Result<String> {
        self.try_recv()
            .await?
            .context("connection closed while waiting for a line")
    }

    async fn try_recv(&mut self) -> Result<Option<String>> {
        timeout(READ_TIMEOUT, read_line(&mut self.reader))
            .await
            .context("timed out waiting for a line")?
            .map_err(Into::into)
    }

    /// Fails if anything arrives within the quiet period.
    async fn expect_silence(&mut self) -> Result<()> {
        match timeout(QUIET_PERIOD, read_line(&mut self.reader)).await {
            Err(_) => Ok(()),
            Ok(line) => Err(anyhow!("expected silence, got {line:?}")),
        }
    }
}

async fn start_server() -> Result<ServerHandle> {
    start_server_with(ServerConfig::local_ephemeral(), Arc::new(TracingSink)).await
}

async fn start_server_with(config: ServerConfig, sink: Arc<dyn EventSink>) -> Result<ServerHandle> {
    Ok(server::start(config, sink).await?)
}

/// Alice then Bob, with every join notice and roster update consumed.
async fn alice_and_bob(addr: SocketAddr) -> Result<(Client, Client)> {
    let mut alice = Client::join(addr, "alice").await?;
    let bob = Client::join(addr, "bob").await?;
    assert_eq!(alice.recv().await?, "SERVER: bob joined the chat");
    assert_eq!(alice.recv().await?, "USERS:alice,bob");
    Ok((alice, bob))
}

#[derive(Default)]
struct RecordingSink {
    entries: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    fn record(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }
}

impl EventSink for RecordingSink {
    fn log_connect(&self, user: &str, _addr: SocketAddr) {
        self.record(format!("connect {user}"));
    }

    fn log_disconnect(&self, user: &str) {
        self.record(format!("disconnect {user}"));
    }

    fn log_message(&self, user: &str, text: &str) {
        self.record(format!("message {user}: {text}"));
    }

    fn log_error(&self, text: &str) {
        self.record(format!("error {text}"));
    }

    fn log_server_event(&self, text: &str) {
        self.record(format!("event {text}"));
    }
}

#[tokio::test]
async fn duplicate_username_is_rejected() -> Result<()> {
    let server = start_server().await?;
    let addr = server.local_addr();

    let mut alice = Client::join(addr, "alice").await?;

    let mut impostor = Client::connect(addr).await?;
    impostor.send("alice").await?;
    assert_eq!(
        impostor.recv().await?,
        "ERROR: username 'alice' is already in use"
    );
    assert_eq!(impostor.try_recv().await?, None);

    // Alice is still registered and heard nothing about the rejected client.
    alice.expect_silence().await?;
    assert_eq!(server.registry().usernames_snapshot().await, vec!["alice"]);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_everyone_but_the_sender() -> Result<()> {
    let server = start_server().await?;
    let (mut alice, mut bob) = alice_and_bob(server.local_addr()).await?;

    alice.send("hello").await?;
    assert_eq!(bob.recv().await?, "alice: hello");
    alice.expect_silence().await?;

    bob.send("hi alice").await?;
    assert_eq!(alice.recv().await?, "bob: hi alice");
    bob.expect_silence().await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn invalid_utf8_does_not_disconnect_the_sender() -> Result<()> {
    let server = start_server().await?;
    let (mut alice, mut bob) = alice_and_bob(server.local_addr()).await?;

    bob.writer.write_all(b"caf\xe9\n").await?;
    assert_eq!(alice.recv().await?, "bob: caf\u{FFFD}");

    bob.send("still here").await?;
    assert_eq!(alice.recv().await?, "bob: still here");
    assert!(server.registry().contains_username("bob").await);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn invalid_utf8_username_is_kept_not_replaced() -> Result<()> {
    let server = start_server().await?;
    let mut client = Client::connect(server.local_addr()).await?;

    client.writer.write_all(b"caf\xe9\n").await?;
    assert_eq!(client.recv().await?, "USERS:caf\u{FFFD}");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() -> Result<()> {
    let server = start_server().await?;
    let (mut alice, mut bob) = alice_and_bob(server.local_addr()).await?;

    for n in 0..20 {
        alice.send(&format!("message {n}")).await?;
    }
    for n in 0..20 {
        assert_eq!(bob.recv().await?, format!("alice: message {n}"));
    }

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn blank_lines_are_not_relayed() -> Result<()> {
    let server = start_server().await?;
    let (mut alice, mut bob) = alice_and_bob(server.local_addr()).await?;

    alice.send("   ").await?;
    alice.send("").await?;
    alice.send("after").await?;
    assert_eq!(bob.recv().await?, "alice: after");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn private_message_is_delivered_and_confirmed() -> Result<()> {
    let server = start_server().await?;
    let (mut alice, mut bob) = alice_and_bob(server.local_addr()).await?;

    alice.send("/msg bob hi").await?;
    assert_eq!(bob.recv().await?, "PRIVATE:alice:hi");
    assert_eq!(alice.recv().await?, "OK: private message sent to bob");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn private_message_to_missing_user_fails() -> Result<()> {
    let server = start_server().await?;
    let (mut alice, mut bob) = alice_and_bob(server.local_addr()).await?;

    alice.send("/msg carol hi").await?;
    assert_eq!(
        alice.recv().await?,
        "ERROR: user 'carol' not found or disconnected"
    );
    bob.expect_silence().await?;

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn private_message_carries_the_real_sender() -> Result<()> {
    let server = start_server().await?;
    let (mut alice, mut bob) = alice_and_bob(server.local_addr()).await?;

    // Whatever the text claims, the tag names the registered sender.
    alice.send("/msg bob PRIVATE:mallory:trust me").await?;
    assert_eq!(bob.recv().await?, "PRIVATE:alice:PRIVATE:mallory:trust me");
    assert_eq!(alice.recv().await?, "OK: private message sent to bob");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn quitting_notifies_the_others_and_frees_the_name() -> Result<()> {
    let server = start_server().await?;
    let addr = server.local_addr();
    let (mut alice, mut bob) = alice_and_bob(addr).await?;

    alice.send("/QUIT").await?;
    assert_eq!(alice.try_recv().await?, None);
    assert_eq!(bob.recv().await?, "SERVER: alice left the chat");
    assert_eq!(bob.recv().await?, "USERS:bob");

    let _alice_again = Client::join(addr, "alice").await?;
    assert_eq!(bob.recv().await?, "SERVER: alice joined the chat");
    assert_eq!(bob.recv().await?, "USERS:bob,alice");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn broken_stream_looks_like_a_normal_leave() -> Result<()> {
    let server = start_server().await?;
    let (alice, mut bob) = alice_and_bob(server.local_addr()).await?;

    drop(alice);
    assert_eq!(bob.recv().await?, "SERVER: alice left the chat");
    assert_eq!(bob.recv().await?, "USERS:bob");
    assert!(!server.registry().contains_username("alice").await);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn blank_username_gets_a_placeholder() -> Result<()> {
    let server = start_server().await?;
    let mut anonymous = Client::connect(server.local_addr()).await?;

    anonymous.send("  ").await?;
    let roster = anonymous.recv().await?;
    let name = roster.strip_prefix("USERS:").context("roster prefix")?;
    assert!(name.starts_with("Anonymous_"), "unexpected name {name}");

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn stop_closes_every_connection() -> Result<()> {
    let server = start_server().await?;
    let addr = server.local_addr();
    let (mut alice, mut bob) = alice_and_bob(addr).await?;
    // Connected but never sent a name.
    let mut lurker = Client::connect(addr).await?;

    timeout(Duration::from_secs(5), server.stop())
        .await
        .context("stop should finish within the grace period")?;
    assert!(!server.is_running());

    for client in [&mut alice, &mut bob, &mut lurker] {
        while client.try_recv().await?.is_some() {}
    }
    assert!(server.registry().is_empty().await);
    assert!(TcpStream::connect(addr).await.is_err());

    // Second stop is a no-op.
    timeout(Duration::from_millis(500), server.stop())
        .await
        .context("second stop should return immediately")?;
    Ok(())
}

#[tokio::test]
async fn stop_aborts_sessions_after_the_grace_period() -> Result<()> {
    let config = ServerConfig::local_ephemeral().with_shutdown_grace(Duration::from_millis(100));
    let server = start_server_with(config, Arc::new(TracingSink)).await?;
    let _alice = Client::join(server.local_addr(), "alice").await?;

    timeout(Duration::from_secs(3), server.stop())
        .await
        .context("stop should not hang")?;
    Ok(())
}

#[tokio::test]
async fn bind_failure_is_fatal() -> Result<()> {
    let occupied = TcpListener::bind("127.0.0.1:0").await?;
    let mut config = ServerConfig::local_ephemeral();
    config.port = occupied.local_addr()?.port();

    let sink = Arc::new(RecordingSink::default());
    match server::start(config, sink.clone()).await {
        Err(err @ ChatError::Bind { .. }) => assert!(err.is_fatal()),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("binding an occupied port should fail"),
    }
    assert!(sink.entries().iter().any(|entry| entry.starts_with("error ")));
    Ok(())
}

#[tokio::test]
async fn stalled_client_does_not_hold_up_others() -> Result<()> {
    let config = ServerConfig::local_ephemeral().with_outbound_capacity(4);
    let server = start_server_with(config, Arc::new(TracingSink)).await?;
    let addr = server.local_addr();

    let (mut alice, mut bob) = alice_and_bob(addr).await?;
    // Claims a name, then never reads again.
    let mut stalled = Client::connect(addr).await?;
    stalled.send("stalled").await?;
    assert_eq!(alice.recv().await?, "SERVER: stalled joined the chat");
    assert_eq!(alice.recv().await?, "USERS:alice,bob,stalled");
    assert_eq!(bob.recv().await?, "SERVER: stalled joined the chat");
    assert_eq!(bob.recv().await?, "USERS:alice,bob,stalled");

    // Large lines fill the socket buffers and then the stalled queue.
    let payload = "x".repeat(64 * 1024);
    let mut dropped = false;
    for _ in 0..1024 {
        alice.send(&payload).await?;
        let line = bob.recv().await?;
        if line.starts_with("SERVER: ") {
            assert_eq!(line, "SERVER: stalled left the chat");
            dropped = true;
            break;
        }
        assert_eq!(line.len(), "alice: ".len() + payload.len());
    }
    assert!(dropped, "stalled client was never disconnected");
    assert!(!server.registry().contains_username("stalled").await);

    // Bob may still have backlog and the refreshed roster ahead of this.
    alice.send("still flowing").await?;
    loop {
        let line = bob.recv().await?;
        if line == "alice: still flowing" {
            break;
        }
        assert!(line.starts_with("alice: ") || line == "USERS:alice,bob", "unexpected {line}");
    }

    stalled.writer.shutdown().await.ok();
    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn sink_sees_the_session_lifecycle() -> Result<()> {
    let sink = Arc::new(RecordingSink::default());
    let server = start_server_with(ServerConfig::local_ephemeral(), sink.clone()).await?;
    let (mut alice, mut bob) = alice_and_bob(server.local_addr()).await?;

    alice.send("hello").await?;
    assert_eq!(bob.recv().await?, "alice: hello");
    alice.send("/msg bob psst").await?;
    assert_eq!(bob.recv().await?, "PRIVATE:alice:psst");
    alice.send("/quit").await?;
    assert_eq!(bob.recv().await?, "SERVER: alice left the chat");

    server.stop().await;

    let entries = sink.entries();
    for expected in [
        "connect alice",
        "connect bob",
        "message alice: hello",
        "message alice -> bob: psst",
        "disconnect alice",
        "event server stopped",
    ] {
        assert!(
            entries.iter().any(|entry| entry == expected),
            "missing '{expected}' in {entries:?}"
        );
    }
    Ok(())
}
