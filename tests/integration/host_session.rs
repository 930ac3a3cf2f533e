//! Integration tests for the session driver: joining, guest renames on
//! collision, MOTD, chatting, `/exit`, disconnects, and operator seeding.
//!
//! Each client is a pair of in-memory duplex streams: one carrying typed
//! lines to the host, one carrying rendered output back.
//!
//! Verification command: `cargo test --test host_session`

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;

use parlor::auth::Auth;
use parlor::builtin::default_commands;
use parlor::conn::{LineTerminal, MAX_LINE_LEN, Peer};
use parlor::host::{Host, HostError};
use parlor::key::PublicKey;
use parlor::room::{Room, RoomConfig, RoomError};

// =============================================================================
// Helpers
// =============================================================================

struct Session {
    input: DuplexStream,
    output: Lines<BufReader<DuplexStream>>,
    peer: Arc<Peer>,
    task: JoinHandle<Result<(), HostError>>,
}

impl Session {
    fn start(host: &Arc<Host>, peer: Peer) -> Self {
        let (input, server_in) = tokio::io::duplex(4096);
        let (server_out, output) = tokio::io::duplex(64 * 1024);
        let peer = Arc::new(peer);
        let task = tokio::spawn({
            let host = Arc::clone(host);
            let peer = Arc::clone(&peer);
            async move {
                let mut term = LineTerminal::new(BufReader::new(server_in));
                host.connect(peer.as_ref(), &mut term, server_out).await
            }
        });
        Self {
            input,
            output: BufReader::new(output).lines(),
            peer,
            task,
        }
    }

    async fn type_line(&mut self, line: &str) {
        self.input
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("host reads input");
    }

    async fn read_until(&mut self, wanted: &str) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let line = tokio::time::timeout(Duration::from_secs(5), self.output.next_line())
                .await
                .expect("timed out waiting for output")
                .expect("output read failed")
                .unwrap_or_else(|| panic!("output ended before {wanted:?}; saw {seen:?}"));
            let line = line.trim_end_matches('\r').to_string();
            if line == wanted {
                return seen;
            }
            seen.push(line);
        }
    }

    async fn finish(self) -> Result<(), HostError> {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("session ends")
            .expect("session task panicked")
    }
}

fn setup(auth: Auth) -> (Arc<Host>, Arc<Room>) {
    let auth = Arc::new(auth);
    let room = Arc::new(Room::new(
        RoomConfig::default(),
        default_commands(Arc::clone(&auth)),
    ));
    let consumer = Arc::clone(&room);
    tokio::spawn(async move { consumer.serve().await });
    let host = Arc::new(Host::new(Arc::clone(&room), auth).with_theme(None));
    (host, room)
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn colliding_name_becomes_guest() {
    let (host, room) = setup(Auth::new());
    let mut first = Session::start(&host, Peer::new("foo"));
    first.read_until(" * foo joined. (Connected: 1)").await;

    let mut second = Session::start(&host, Peer::new("FOO"));
    first.read_until(" * Guest1 joined. (Connected: 2)").await;
    second.read_until(" * Guest1 joined. (Connected: 2)").await;

    let mut names = room.names();
    names.sort();
    assert_eq!(names, vec!["foo".to_string(), "Guest1".to_string()]);
}

#[tokio::test]
async fn concurrent_sessions_with_same_name_both_join() {
    let (host, room) = setup(Auth::new());
    let mut a = Session::start(&host, Peer::new("foo"));
    let mut b = Session::start(&host, Peer::new("foo"));

    a.read_until(" * Guest1 joined. (Connected: 2)").await;
    b.read_until(" * Guest1 joined. (Connected: 2)").await;
    assert!(room.member("foo").is_some());
    assert!(room.member("Guest1").is_some());
}

#[tokio::test]
async fn unusable_name_becomes_guest() {
    let (host, _room) = setup(Auth::new());
    let mut session = Session::start(&host, Peer::new(" \t"));
    session.read_until(" * Guest1 joined. (Connected: 1)").await;
}

#[tokio::test]
async fn motd_is_shown_after_join() {
    let (host, room) = setup(Auth::new());
    room.set_motd("Welcome to the parlor.");
    let mut session = Session::start(&host, Peer::new("alice"));
    session.read_until("-> Welcome to the parlor.").await;
}

#[tokio::test]
async fn chat_between_sessions() {
    let (host, _room) = setup(Auth::new());
    let mut alice = Session::start(&host, Peer::new("alice"));
    alice.read_until(" * alice joined. (Connected: 1)").await;
    let mut bob = Session::start(&host, Peer::new("bob"));
    alice.read_until(" * bob joined. (Connected: 2)").await;

    alice.type_line("good morning").await;
    bob.read_until("alice: good morning").await;

    bob.type_line("   ").await;
    bob.type_line("/me yawns").await;
    alice.read_until("** bob yawns").await;
}

#[tokio::test]
async fn overlong_line_is_dropped_and_session_continues() {
    let (host, _room) = setup(Auth::new());
    let mut alice = Session::start(&host, Peer::new("alice"));
    alice.read_until(" * alice joined. (Connected: 1)").await;
    let mut bob = Session::start(&host, Peer::new("bob"));
    alice.read_until(" * bob joined. (Connected: 2)").await;

    alice.type_line(&"x".repeat(2 * MAX_LINE_LEN)).await;
    alice
        .read_until(&format!("-> Input dropped: line exceeds {MAX_LINE_LEN} bytes."))
        .await;

    alice.type_line("still here").await;
    let seen = bob.read_until("alice: still here").await;
    assert!(seen.iter().all(|line| !line.contains("xxxx")));
}

#[tokio::test]
async fn invalid_utf8_input_is_relayed_with_replacement() {
    let (host, _room) = setup(Auth::new());
    let mut alice = Session::start(&host, Peer::new("alice"));
    alice.read_until(" * alice joined. (Connected: 1)").await;
    let mut bob = Session::start(&host, Peer::new("bob"));
    alice.read_until(" * bob joined. (Connected: 2)").await;

    alice.input.write_all(b"caf\xe9 au lait\n").await.unwrap();
    bob.read_until("alice: caf\u{FFFD} au lait").await;
}

#[tokio::test]
async fn exit_ends_session_and_announces_leave() {
    let (host, room) = setup(Auth::new());
    let mut alice = Session::start(&host, Peer::new("alice"));
    alice.read_until(" * alice joined. (Connected: 1)").await;
    let mut bob = Session::start(&host, Peer::new("bob"));
    alice.read_until(" * bob joined. (Connected: 2)").await;

    bob.type_line("/exit").await;
    alice.read_until(" * bob left.").await;
    let peer = Arc::clone(&bob.peer);
    bob.finish().await.unwrap();
    assert!(peer.is_closed());
    assert!(room.member("bob").is_none());
}

#[tokio::test]
async fn disconnect_ends_session() {
    let (host, room) = setup(Auth::new());
    let mut alice = Session::start(&host, Peer::new("alice"));
    alice.read_until(" * alice joined. (Connected: 1)").await;
    let mut bob = Session::start(&host, Peer::new("bob"));
    alice.read_until(" * bob joined. (Connected: 2)").await;

    bob.input.shutdown().await.unwrap();
    alice.read_until(" * bob left.").await;
    bob.finish().await.unwrap();
    assert_eq!(room.names(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn operator_key_is_seeded_from_auth() {
    let key = PublicKey::new("ssh-ed25519", vec![42; 32]);
    let auth = Auth::new();
    auth.op(&key, Duration::ZERO);
    let (host, _room) = setup(auth);

    let mut alice = Session::start(&host, Peer::new("alice").with_key(key));
    alice.read_until(" * alice joined. (Connected: 1)").await;
    let mut bob = Session::start(&host, Peer::new("bob"));
    alice.read_until(" * bob joined. (Connected: 2)").await;

    bob.type_line("/kick alice").await;
    bob.read_until("-> Err: must be an operator").await;

    alice.type_line("/kick bob").await;
    alice.read_until(" * bob was kicked by alice.").await;
    alice.read_until(" * bob left.").await;
    bob.finish().await.unwrap();
}

#[tokio::test]
async fn closed_room_refuses_session() {
    let (host, room) = setup(Auth::new());
    room.close();
    let session = Session::start(&host, Peer::new("alice"));
    let peer = Arc::clone(&session.peer);
    assert!(matches!(
        session.finish().await,
        Err(HostError::Room(RoomError::Closed))
    ));
    assert!(peer.is_closed());
}

#[tokio::test]
async fn room_close_ends_every_session() {
    let (host, room) = setup(Auth::new());
    let mut alice = Session::start(&host, Peer::new("alice"));
    alice.read_until(" * alice joined. (Connected: 1)").await;

    room.close();
    alice.finish().await.unwrap();
}
