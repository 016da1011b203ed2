//! Whole-engine flows: sockets talking to board and timer actors over the bus.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use retro_board::{BoardManager, BoardRef, Bus, ManagerConfig};
use retro_db::Database;
use retro_types::models::{Card, Column};

use common::{board_with_timer, config, connect, manager, user};

#[tokio::test]
async fn new_column_is_broadcast_as_snapshot() {
    let m = manager(config());
    let board_id = board_with_timer(&m).await;
    let mut alice = connect(&m, user("Alice"), board_id).await;
    let mut bob = connect(&m, user("Bob"), board_id).await;

    alice.send_type("column.new", json!({"name": "Good"}));

    for socket in [&mut alice, &mut bob] {
        let status = socket.next_of_type("board.status").await;
        assert_eq!(status["user"]["name"], "Alice");

        let columns = status["data"]["columns"].as_array().unwrap();
        assert_eq!(columns.len(), 2);
        let keep = columns.iter().find(|c| c["name"] == "Keep").unwrap();
        let good = columns.iter().find(|c| c["name"] == "Good").unwrap();
        assert!(good["order"].as_i64() > keep["order"].as_i64());
    }

    alice.close().await;
    bob.close().await;
    m.shutdown().await;
}

#[tokio::test]
async fn watch_carries_changes_to_every_session() {
    let m = manager(config());
    let board_id = board_with_timer(&m).await;
    let mut alice = connect(&m, user("Alice"), board_id).await;

    alice.send_type("column.new", json!({"name": "Good"}));
    let put = alice
        .next_matching(|msg| msg["type"] == "columns" && msg["obj"]["name"] == "Good")
        .await;
    assert_eq!(put["op"], "put");

    // bob joining shows up as a presence record for alice
    let bob = connect(&m, user("Bob"), board_id).await;
    let bob_id = bob.client_id.to_string();
    let joined = alice
        .next_matching(|msg| msg["type"] == "clients" && msg["id"] == bob_id.as_str())
        .await;
    assert_eq!(joined["obj"]["user"]["name"], "Bob");

    bob.close().await;
    let left = alice
        .next_matching(|msg| msg["type"] == "clients" && msg["op"] == "del")
        .await;
    assert_eq!(left["id"], bob_id.as_str());

    alice.close().await;
    m.shutdown().await;
}

#[tokio::test]
async fn timer_start_broadcasts_state_then_notification() {
    let m = manager(config());
    let board_id = board_with_timer(&m).await;
    let mut alice = connect(&m, user("Alice"), board_id).await;
    let mut bob = connect(&m, user("Bob"), board_id).await;

    alice.send_type("timer.cmd", json!({"cmd": "start", "value": "5s"}));

    for socket in [&mut alice, &mut bob] {
        let first = socket
            .next_matching(|msg| msg["type"] == "timer.state" || msg["type"] == "board.notification")
            .await;
        assert_eq!(first["type"], "timer.state");
        assert_eq!(first["data"]["status"], "running");
        assert_eq!(first["data"]["display"], "00:05");

        let note = socket.next_of_type("board.notification").await;
        assert_eq!(note["data"], "Alice started the timer");
        assert_eq!(note["user"]["name"], "Alice");
    }

    alice.close().await;
    bob.close().await;
    m.shutdown().await;
}

#[tokio::test]
async fn timer_ticks_down_to_done() {
    let m = manager(ManagerConfig {
        timer_tick: Duration::from_millis(20),
        ..config()
    });
    let board_id = board_with_timer(&m).await;
    let mut alice = connect(&m, user("Alice"), board_id).await;

    alice.send_type("timer.cmd", json!({"cmd": "start", "value": "2s"}));
    let done = alice
        .next_matching(|msg| msg["type"] == "timer.state" && msg["data"]["status"] == "done")
        .await;
    assert_eq!(done["data"]["elapsed"], 2);
    assert_eq!(done["data"]["display"], "00:00");

    alice.close().await;
    m.shutdown().await;
}

#[tokio::test]
async fn out_of_range_vote_is_dropped() {
    let m = manager(config());
    let board_id = board_with_timer(&m).await;
    let col = m.db().columns(board_id).create(&Column::new("Good", board_id)).unwrap();
    let card = m.db().cards(board_id).create(&Card::new("ship it", board_id, col.id)).unwrap();
    let mut alice = connect(&m, user("Alice"), board_id).await;

    alice.send_type("card.vote", json!({"id": card.id, "vote": 2}));
    alice.assert_none_of_type("board.status", Duration::from_millis(300)).await;
    assert_eq!(m.db().cards(board_id).get(card.id).unwrap().votes, 0);

    // the actor is still alive
    alice.send_type("card.vote", json!({"id": card.id, "vote": 1}));
    let status = alice.next_of_type("board.status").await;
    assert_eq!(status["data"]["cards"][0]["votes"], 1);

    alice.close().await;
    m.shutdown().await;
}

#[tokio::test]
async fn unknown_column_update_is_dropped() {
    let m = manager(config());
    let board_id = board_with_timer(&m).await;
    let mut alice = connect(&m, user("Alice"), board_id).await;

    alice.send_type("column.update", json!({"id": Uuid::new_v4(), "name": "Nope"}));
    alice.send_type("card.new", json!({"name": "orphan", "column_id": Uuid::new_v4()}));
    alice.send_type("card.delete", json!({"id": Uuid::new_v4()}));
    alice.assert_none_of_type("board.status", Duration::from_millis(300)).await;
    assert!(m.db().cards(board_id).list().unwrap().is_empty());

    // the actor keeps serving after the failed mutations
    alice.send_type("column.new", json!({"name": "Good"}));
    let status = alice.next_of_type("board.status").await;
    let columns = status["data"]["columns"].as_array().unwrap();
    assert_eq!(columns.len(), 2);
    assert!(columns.iter().any(|c| c["name"] == "Good"));

    alice.close().await;
    m.shutdown().await;
}

#[tokio::test]
async fn malformed_frames_do_not_end_the_session() {
    let m = manager(config());
    let board_id = board_with_timer(&m).await;
    let mut alice = connect(&m, user("Alice"), board_id).await;

    alice.send_raw("{not json");
    alice.send_type("board.users", json!({}));
    alice.send_type("me", json!({}));

    let reply = alice.next_of_type("messages").await;
    assert_eq!(reply["messages"][0]["type"], "me");

    alice.close().await;
    m.shutdown().await;
}

#[tokio::test]
async fn concurrent_votes_are_all_counted() {
    let m = manager(config());
    let board_id = board_with_timer(&m).await;
    let col = m.db().columns(board_id).create(&Column::new("Good", board_id)).unwrap();
    let card = m.db().cards(board_id).create(&Card::new("ship it", board_id, col.id)).unwrap();

    let mut sockets = Vec::new();
    for name in ["Alice", "Bob", "Carol"] {
        sockets.push(connect(&m, user(name), board_id).await);
    }
    for _ in 0..5 {
        for socket in &sockets {
            socket.send_type("card.vote", json!({"id": card.id, "vote": 1}));
        }
    }

    tokio::time::timeout(Duration::from_secs(3), async {
        while m.db().cards(board_id).get(card.id).unwrap().votes < 15 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("votes went missing");
    assert_eq!(m.db().cards(board_id).get(card.id).unwrap().votes, 15);

    for socket in sockets {
        socket.close().await;
    }
    m.shutdown().await;
}

#[tokio::test]
async fn me_includes_timer_only_while_active() {
    let m = manager(config());
    let board_id = board_with_timer(&m).await;
    let mut alice = connect(&m, user("Alice"), board_id).await;

    alice.send_type("me", json!({}));
    let reply = alice.next_of_type("messages").await;
    let messages = reply["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["user"]["name"], "Alice");
    assert_eq!(messages[0]["board_id"], board_id.to_string().as_str());

    alice.send_type("timer.cmd", json!({"cmd": "start", "value": "1m"}));
    alice.next_of_type("board.notification").await;
    alice.send_type("timer.cmd", json!({"cmd": "pause"}));
    alice.next_of_type("board.notification").await;

    alice.send_type("me", json!({}));
    let reply = alice.next_of_type("messages").await;
    let messages = reply["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["type"], "timer.state");
    assert_eq!(messages[1]["data"]["status"], "paused");

    alice.close().await;
    m.shutdown().await;
}

#[tokio::test]
async fn disconnect_removes_presence_record() {
    let m = manager(config());
    let board_id = board_with_timer(&m).await;
    let alice = connect(&m, user("Alice"), board_id).await;
    assert_eq!(m.db().clients(board_id).list().unwrap().len(), 1);

    let client_id = alice.client_id;
    alice.close().await;

    assert!(m.db().clients(board_id).get(client_id).unwrap_err().is_not_found());
    assert!(m.db().clients(board_id).list().unwrap().is_empty());
    m.shutdown().await;
}

#[tokio::test]
async fn second_process_finds_the_running_board() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let bus = Bus::new();
    let a = BoardManager::new(db.clone(), bus.clone(), config());
    let b = BoardManager::new(db.clone(), bus.clone(), config());
    let board_id = Uuid::new_v4();

    assert!(matches!(a.get_or_create(board_id).await.unwrap(), BoardRef::Local(_)));
    match b.get_or_create(board_id).await.unwrap() {
        BoardRef::Remote(board) => assert_eq!(board.id, board_id),
        other => panic!("expected remote board, got {other:?}"),
    }
    assert_eq!(db.columns(board_id).list().unwrap().len(), 1);

    // sessions on b still reach the actor on a
    let mut alice = connect(&b, user("Alice"), board_id).await;
    alice.send_type("column.new", json!({"name": "Good"}));
    let status = alice.next_of_type("board.status").await;
    assert_eq!(status["data"]["columns"].as_array().unwrap().len(), 2);

    alice.close().await;
    a.shutdown().await;
    b.shutdown().await;
}
