//! Integration tests for room routing: ordering, quiet mode, private
//! messages, command dispatch, slow members, and shutdown.
//!
//! Every member's screen writes into an in-memory duplex stream, so the
//! assertions check the exact lines a client would see.
//!
//! Verification command: `cargo test --test room_broadcast`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;

use parlor::auth::Auth;
use parlor::builtin::default_commands;
use parlor::message::{CommandMsg, Message, parse_input};
use parlor::room::{Room, RoomConfig, RoomError};
use parlor::user::{Delivery, Identity, User};

// =============================================================================
// Helpers
// =============================================================================

/// A member whose screen output can be read line by line.
struct Client {
    user: Arc<User>,
    lines: Lines<BufReader<DuplexStream>>,
}

impl Client {
    fn new(name: &str) -> Self {
        Self::with_delivery(name, Delivery::default())
    }

    fn with_delivery(name: &str, delivery: Delivery) -> Self {
        let user = User::new(name, Identity::default(), &delivery);
        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let screen = Arc::clone(&user);
        tokio::spawn(async move { screen.consume(writer).await });
        Self {
            user,
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next rendered line, without the terminator.
    async fn next_line(&mut self) -> String {
        let line = tokio::time::timeout(Duration::from_secs(60), self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .expect("screen read failed")
            .expect("screen closed");
        line.trim_end_matches('\r').to_string()
    }

    /// Reads lines until one equals `wanted`, returning everything before it.
    async fn read_until(&mut self, wanted: &str) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let line = self.next_line().await;
            if line == wanted {
                return seen;
            }
            seen.push(line);
        }
    }

    /// Sends one line of input as this user.
    async fn say(&self, room: &Room, line: &str) {
        room.send(parse_input(line, Arc::clone(&self.user)))
            .await
            .expect("room accepts input");
    }
}

fn new_room(auth: &Arc<Auth>) -> Arc<Room> {
    let config = RoomConfig {
        history_len: 20,
        queue_len: 64,
    };
    Arc::new(Room::new(config, default_commands(Arc::clone(auth))))
}

fn serve(room: &Arc<Room>) -> JoinHandle<()> {
    let room = Arc::clone(room);
    tokio::spawn(async move { room.serve().await })
}

// =============================================================================
// Ordering and filtering
// =============================================================================

#[tokio::test]
async fn members_see_messages_in_send_order() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    let carol = Client::new("carol");
    for client in [&alice, &bob, &carol] {
        room.join(Arc::clone(&client.user), false).await.unwrap();
    }

    // Everything is queued before the consumer starts.
    for i in 0..20 {
        carol.say(&room, &format!("message {i}")).await;
    }
    serve(&room);

    for reader in [&mut alice, &mut bob] {
        let mut received = Vec::new();
        while received.len() < 20 {
            let line = reader.next_line().await;
            if let Some(body) = line.strip_prefix("carol: ") {
                received.push(body.to_string());
            }
        }
        let expected: Vec<String> = (0..20).map(|i| format!("message {i}")).collect();
        assert_eq!(received, expected);
    }
}

#[tokio::test]
async fn sender_does_not_receive_own_public_message() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    room.join(Arc::clone(&alice.user), false).await.unwrap();
    room.join(Arc::clone(&bob.user), false).await.unwrap();

    alice.say(&room, "hello").await;
    room.send(Message::system("marker", Arc::clone(&alice.user)))
        .await
        .unwrap();

    bob.read_until("alice: hello").await;
    let before_marker = alice.read_until("-> marker").await;
    assert!(!before_marker.iter().any(|l| l.contains("hello")));
}

#[tokio::test]
async fn quiet_member_skips_announcements() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    room.join(Arc::clone(&alice.user), false).await.unwrap();
    room.join(Arc::clone(&bob.user), false).await.unwrap();
    bob.user.set_config(|cfg| cfg.quiet = true);

    room.send(Message::announce("x joined")).await.unwrap();
    room.send(Message::system("marker", Arc::clone(&bob.user)))
        .await
        .unwrap();

    alice.read_until(" * x joined").await;
    let bob_saw = bob.read_until("-> marker").await;
    assert!(!bob_saw.iter().any(|l| l.contains("x joined")), "{bob_saw:?}");
}

#[tokio::test]
async fn history_is_replayed_on_join() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut alice = Client::new("alice");
    room.join(Arc::clone(&alice.user), false).await.unwrap();
    alice.say(&room, "first").await;
    alice.say(&room, "second").await;
    alice.say(&room, "/me waves").await;
    room.send(Message::system("marker", Arc::clone(&alice.user)))
        .await
        .unwrap();
    // The marker is handled after everything alice said.
    alice.read_until("-> marker").await;

    let mut dave = Client::new("dave");
    room.join(Arc::clone(&dave.user), false).await.unwrap();
    let replay = dave.read_until(" * dave joined. (Connected: 2)").await;
    let chat: Vec<&str> = replay
        .iter()
        .map(String::as_str)
        .filter(|l| !l.starts_with(" * "))
        .collect();
    assert_eq!(chat, vec!["alice: first", "alice: second", "** alice waves"]);
}

// =============================================================================
// Commands
// =============================================================================

#[tokio::test]
async fn emote_renders_for_other_members() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let alice = Client::new("alice");
    let mut bob = Client::new("bob");
    room.join(Arc::clone(&alice.user), false).await.unwrap();
    room.join(Arc::clone(&bob.user), false).await.unwrap();

    let msg = parse_input("/me waves", Arc::clone(&alice.user));
    let Message::Command(cmd) = &msg else {
        panic!("expected a command");
    };
    assert_eq!(cmd.name, "/me");
    room.send(msg).await.unwrap();

    bob.read_until("** alice waves").await;
}

#[tokio::test]
async fn private_messages_and_reply() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    let mut carol = Client::new("carol");
    for client in [&alice, &bob, &carol] {
        room.join(Arc::clone(&client.user), false).await.unwrap();
    }

    alice.say(&room, "/msg bob are you there?").await;
    bob.read_until("[PM from alice] are you there?").await;
    alice.read_until("[PM to bob] are you there?").await;

    bob.say(&room, "/reply yes").await;
    alice.read_until("[PM from bob] yes").await;

    room.send(Message::system("marker", Arc::clone(&carol.user)))
        .await
        .unwrap();
    let carol_saw = carol.read_until("-> marker").await;
    assert!(!carol_saw.iter().any(|l| l.contains("PM")), "{carol_saw:?}");
}

#[tokio::test]
async fn command_errors_reach_only_the_sender() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    room.join(Arc::clone(&alice.user), false).await.unwrap();
    room.join(Arc::clone(&bob.user), false).await.unwrap();

    alice.say(&room, "/frobnicate").await;
    alice.read_until("-> Err: invalid command: /frobnicate").await;
    alice.say(&room, "/kick bob").await;
    alice.read_until("-> Err: must be an operator").await;
    alice.say(&room, "/msg nobody hi").await;
    alice.read_until("-> Err: user not found").await;

    room.send(Message::system("marker", Arc::clone(&bob.user)))
        .await
        .unwrap();
    let bob_saw = bob.read_until("-> marker").await;
    assert!(!bob_saw.iter().any(|l| l.contains("Err")), "{bob_saw:?}");
}

#[tokio::test]
async fn ownerless_command_is_refused_without_stopping_the_room() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut alice = Client::new("alice");
    room.join(Arc::clone(&alice.user), false).await.unwrap();

    room.send(Message::Command(CommandMsg {
        from: None,
        name: "/kick".to_string(),
        args: vec!["alice".to_string()],
        body: "/kick alice".to_string(),
        timestamp: Utc::now(),
    }))
    .await
    .unwrap();
    room.send(Message::announce("still running")).await.unwrap();

    alice.read_until(" * still running").await;
    assert!(!alice.user.is_closed());
}

#[tokio::test]
async fn rename_is_announced_and_keeps_identity() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let alice = Client::new("alice");
    let mut bob = Client::new("bob");
    room.join(Arc::clone(&alice.user), false).await.unwrap();
    room.join(Arc::clone(&bob.user), false).await.unwrap();

    alice.say(&room, "/nick ally").await;
    bob.read_until(" * alice is now known as ally.").await;
    assert_eq!(alice.user.name(), "ally");
    assert!(Arc::ptr_eq(&room.member("ally").unwrap(), &alice.user));

    alice.say(&room, "hi").await;
    bob.read_until("ally: hi").await;
}

#[tokio::test]
async fn operator_kick_closes_target() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut alice = Client::new("alice");
    let bob = Client::new("bob");
    room.join(Arc::clone(&alice.user), true).await.unwrap();
    room.join(Arc::clone(&bob.user), false).await.unwrap();

    alice.say(&room, "/kick bob").await;
    alice.read_until(" * bob was kicked by alice.").await;
    bob.user.closed().await;
}

#[tokio::test]
async fn operator_ban_persists_in_auth() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut alice = Client::new("alice");
    let identity = Identity {
        addr: Some("203.0.113.5:4000".parse().unwrap()),
        ..Identity::default()
    };
    let mallory = User::new("mallory", identity, &Delivery::default());
    room.join(Arc::clone(&alice.user), true).await.unwrap();
    room.join(Arc::clone(&mallory), false).await.unwrap();

    alice.say(&room, "/ban mallory 1h").await;
    alice.read_until(" * mallory was banned by alice for 1h0m0s.").await;
    assert!(mallory.is_closed());
    assert_eq!(
        auth.check_bans(Some("203.0.113.5:1".parse().unwrap()), None, "test"),
        Err(parlor::auth::AuthError::Banned)
    );
}

#[tokio::test(start_paused = true)]
async fn temporary_operator_status_lapses() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    let carol = Client::new("carol");
    room.join(Arc::clone(&alice.user), true).await.unwrap();
    room.join(Arc::clone(&bob.user), false).await.unwrap();
    room.join(Arc::clone(&carol.user), false).await.unwrap();

    alice.say(&room, "/op bob 1m").await;
    alice.read_until("-> bob is now an operator for 1m0s.").await;
    bob.read_until("-> Made op by alice for 1m0s.").await;
    bob.say(&room, "/kick carol").await;
    alice.read_until(" * carol was kicked by bob.").await;

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(!room.is_op(&bob.user));
    bob.say(&room, "/kick alice").await;
    bob.read_until("-> Err: must be an operator").await;
    assert!(!alice.user.is_closed());
}

// =============================================================================
// Membership races, slow members, shutdown
// =============================================================================

#[tokio::test]
async fn concurrent_joins_with_same_name() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    let first = User::new("foo", Identity::default(), &Delivery::default());
    let second = User::new("foo", Identity::default(), &Delivery::default());

    let (a, b) = tokio::join!(
        room.join(Arc::clone(&first), false),
        room.join(Arc::clone(&second), false)
    );
    let outcomes = [a.is_ok(), b.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let err = a.err().or(b.err()).unwrap();
    assert_eq!(err, RoomError::Collision);
    assert_eq!(room.names(), vec!["foo".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn slow_member_is_dropped_without_stalling_others() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    serve(&room);
    let mut fast = Client::new("fast");
    let carol = Client::new("carol");
    // Room for the three join announcements and nothing more; nobody
    // ever drains it.
    let slow = User::new(
        "slow",
        Identity::default(),
        &Delivery {
            queue: 3,
            timeout: Duration::from_secs(5),
            ..Delivery::default()
        },
    );
    room.join(Arc::clone(&slow), false).await.unwrap();
    room.join(Arc::clone(&fast.user), false).await.unwrap();
    room.join(Arc::clone(&carol.user), false).await.unwrap();
    fast.read_until(" * carol joined. (Connected: 3)").await;
    assert!(!slow.is_closed());

    let started = tokio::time::Instant::now();
    carol.say(&room, "m0").await;
    fast.say(&room, "/version").await;
    fast.read_until("carol: m0").await;
    let reply = fast.next_line().await;
    assert!(reply.starts_with("-> parlor "), "unexpected reply {reply:?}");
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "healthy members waited {:?} on a stuck one",
        started.elapsed()
    );
    assert!(!slow.is_closed());

    tokio::time::timeout(Duration::from_secs(30), slow.closed())
        .await
        .expect("stuck member is closed");
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(matches!(
        slow.send(Message::announce("late")),
        Err(parlor::user::UserError::Closed)
    ));

    carol.say(&room, "m1").await;
    fast.read_until("carol: m1").await;
}

#[tokio::test]
async fn joiner_sees_history_then_live_without_repeats() {
    let auth = Arc::new(Auth::new());
    let room = Arc::new(Room::new(
        RoomConfig {
            history_len: 100,
            queue_len: 64,
        },
        default_commands(Arc::clone(&auth)),
    ));
    serve(&room);
    let carol = Client::new("carol");
    room.join(Arc::clone(&carol.user), false).await.unwrap();

    let talker = tokio::spawn({
        let room = Arc::clone(&room);
        let user = Arc::clone(&carol.user);
        async move {
            for i in 0..60 {
                room.send(parse_input(&format!("n{i}"), Arc::clone(&user)))
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }
    });
    tokio::task::yield_now().await;
    let mut bob = Client::new("bob");
    room.join(Arc::clone(&bob.user), false).await.unwrap();
    talker.await.unwrap();
    room.send(Message::system("marker", Arc::clone(&bob.user)))
        .await
        .unwrap();

    let seen: Vec<usize> = bob
        .read_until("-> marker")
        .await
        .iter()
        .filter_map(|line| line.strip_prefix("carol: n"))
        .map(|n| n.parse().unwrap())
        .collect();
    let expected: Vec<usize> = (0..60).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn close_is_idempotent_and_stops_the_consumer() {
    let auth = Arc::new(Auth::new());
    let room = new_room(&auth);
    let consumer = serve(&room);
    let alice = Client::new("alice");
    room.join(Arc::clone(&alice.user), false).await.unwrap();

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let room = Arc::clone(&room);
            tokio::spawn(async move { room.close() })
        })
        .collect();
    for closer in closers {
        closer.await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("consumer stops after close")
        .unwrap();
    assert!(alice.user.is_closed());
    assert!(room.members().is_empty());
    assert_eq!(
        room.send(Message::announce("late")).await,
        Err(RoomError::Closed)
    );
}
