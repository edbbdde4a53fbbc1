//! Leader/follower end-to-end: two servers over real sockets, one AOF
//! stream between them.

mod common;

use std::net::TcpListener;
use std::path::Path;
use std::time::{Duration, Instant};

use common::*;
use meridian_common::config::MeridianConfig;
use meridian_server::conn;

fn spawn_server(dir: &Path) -> (Arc<Server>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let mut config = MeridianConfig::default();
    config.server.listen_addr = format!("127.0.0.1:{}", port);
    let server = Server::open(config, dir).expect("open server");
    server.start_background();
    {
        let server = server.clone();
        std::thread::spawn(move || {
            let _ = conn::serve(server, listener);
        });
    }
    (server, port)
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn test_follower_replays_leader_stream() {
    let leader_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();
    let (leader, leader_port) = spawn_server(leader_dir.path());
    let (follower, _follower_port) = spawn_server(follower_dir.path());

    // Seed the leader before the follower attaches.
    assert_eq!(
        do_cmd(&leader, &["SET", "fleet", "truck1", "POINT", "33", "-115"]),
        "OK"
    );

    assert_eq!(
        do_cmd(
            &follower,
            &["FOLLOW", "127.0.0.1", &leader_port.to_string()],
        ),
        "OK"
    );

    // The follower rejects writes immediately.
    assert_eq!(
        do_cmd(&follower, &["SET", "fleet", "truck2", "POINT", "1", "1"]),
        "ERR not the leader"
    );

    // Catch-up replays the backlog.
    assert!(
        wait_until(Duration::from_secs(10), || {
            do_cmd(&follower, &["GET", "fleet", "truck1", "POINT"]) == "[33 -115]"
        }),
        "follower never caught up; last reply: {}",
        do_cmd(&follower, &["GET", "fleet", "truck1", "POINT"])
    );

    // Live stream: new leader writes arrive without re-syncing.
    assert_eq!(
        do_cmd(&leader, &["SET", "fleet", "truck3", "POINT", "2", "3"]),
        "OK"
    );
    assert!(
        wait_until(Duration::from_secs(10), || {
            do_cmd(&follower, &["GET", "fleet", "truck3", "POINT"]) == "[2 3]"
        }),
        "live write never reached the follower"
    );

    // Detach: the follower becomes writable again.
    assert_eq!(do_cmd(&follower, &["FOLLOW", "no", "one"]), "OK");
    assert_eq!(
        do_cmd(&follower, &["SET", "fleet", "local1", "POINT", "9", "9"]),
        "OK"
    );

    follower.stop();
    leader.stop();
}

#[test]
fn test_follow_rejects_self_and_bad_leader() {
    let dir = tempfile::tempdir().unwrap();
    let (server, port) = spawn_server(dir.path());

    let reply = do_cmd(&server, &["FOLLOW", "127.0.0.1", &port.to_string()]);
    assert!(
        reply.contains("cannot follow self"),
        "unexpected reply: {}",
        reply
    );

    // Nothing is listening on this port.
    let reply = do_cmd(&server, &["FOLLOW", "127.0.0.1", "1"]);
    assert!(
        reply.contains("cannot follow"),
        "unexpected reply: {}",
        reply
    );
    assert!(!server.repl().is_follower());

    server.stop();
}

#[test]
fn test_aof_replay_restores_state() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (server, _port) = spawn_server(dir.path());
        do_cmd(&server, &["SET", "fleet", "truck1", "POINT", "5", "6"]);
        do_cmd(&server, &["SET", "fleet", "truck2", "POINT", "7", "8"]);
        do_cmd(&server, &["DEL", "fleet", "truck2"]);
        server.aof_flush().unwrap();
        server.stop();
    }

    let config = MeridianConfig::default();
    let server = Server::open(config, dir.path()).expect("reopen");
    assert_eq!(do_cmd(&server, &["GET", "fleet", "truck1", "POINT"]), "[5 6]");
    assert_eq!(do_cmd(&server, &["GET", "fleet", "truck2"]), "nil");
    server.stop();
}
