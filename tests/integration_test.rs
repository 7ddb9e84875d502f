use redis::Commands;
use std::sync::Arc;
use swarmkv::config::Config;
use swarmkv::snapshot::SnapshotStore;

fn start_server(port: u16, dir: &str, persist_after: i64) -> tokio::task::JoinHandle<()> {
    let config = Arc::new(Config {
        listen: format!("tcp://127.0.0.1:{port}"),
        dir: dir.to_string(),
        persist_after,
        ..Config::default()
    });
    let snapshots = Arc::new(SnapshotStore::open(dir).unwrap());
    tokio::spawn(async move {
        let _ = swarmkv::server::run_server(config, snapshots).await;
    })
}

fn test_dir(port: u16) -> String {
    let dir = std::env::temp_dir().join(format!("swarmkv-it-{port}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir.to_string_lossy().into_owned()
}

fn get_client(port: u16) -> redis::Connection {
    let client = redis::Client::open(format!("redis://127.0.0.1:{port}/")).unwrap();
    for i in 0..50 {
        match client.get_connection() {
            Ok(conn) => return conn,
            Err(_) if i < 49 => {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Err(e) => panic!("Failed to connect: {e}"),
        }
    }
    unreachable!()
}

#[tokio::test]
async fn test_ping_echo() {
    let port = 17001;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let pong: String = redis::cmd("PING").query(&mut conn).unwrap();
        assert_eq!(pong, "PONG");
        let echoed: String = redis::cmd("ECHO").arg("hello world").query(&mut conn).unwrap();
        assert_eq!(echoed, "hello world");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_set_get_strlen() {
    let port = 17002;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let _: () = conn.set("foo", "bar").unwrap();
        let value: String = conn.get("foo").unwrap();
        assert_eq!(value, "bar");
        let len: i64 = conn.strlen("foo").unwrap();
        assert_eq!(len, 3);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_missing_key_defaults() {
    let port = 17003;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let missing: Option<String> = conn.get("missing").unwrap();
        assert_eq!(missing, None);
        let pushed: i64 = redis::cmd("LPUSHX").arg("missing").arg("x").query(&mut conn).unwrap();
        assert_eq!(pushed, 0);
        let first: i64 = redis::cmd("SETNX").arg("k").arg("1").query(&mut conn).unwrap();
        assert_eq!(first, 1);
        let second: i64 = redis::cmd("SETNX").arg("k").arg("2").query(&mut conn).unwrap();
        assert_eq!(second, 0);
        let value: String = conn.get("k").unwrap();
        assert_eq!(value, "1");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_incr_decr() {
    let port = 17004;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let _: () = conn.set("counter", "10").unwrap();
        let up: i64 = conn.incr("counter", 1).unwrap();
        assert_eq!(up, 11);
        let more: i64 = conn.incr("counter", 5).unwrap();
        assert_eq!(more, 16);
        let down: i64 = redis::cmd("DECRBY").arg("counter").arg(3).query(&mut conn).unwrap();
        assert_eq!(down, 13);
        let fresh: i64 = redis::cmd("INCR").arg("newcounter").query(&mut conn).unwrap();
        assert_eq!(fresh, 1);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_list_commands() {
    let port = 17005;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let len: i64 = conn.rpush("l", &["a", "b", "c"]).unwrap();
        assert_eq!(len, 3);
        let all: Vec<String> = conn.lrange("l", 0, -1).unwrap();
        assert_eq!(all, vec!["a", "b", "c"]);

        // LREM takes an index and removes that element.
        let removed: i64 = redis::cmd("LREM").arg("l").arg(0).query(&mut conn).unwrap();
        assert_eq!(removed, 1);
        let rest: Vec<String> = conn.lrange("l", 0, -1).unwrap();
        assert_eq!(rest, vec!["b", "c"]);

        let popped: String = redis::cmd("LPOP").arg("l").query(&mut conn).unwrap();
        assert_eq!(popped, "b");
        let llen: i64 = conn.llen("l").unwrap();
        assert_eq!(llen, 1);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_hash_commands() {
    let port = 17006;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let new: i64 = conn.hset("h", "f1", "v1").unwrap();
        assert_eq!(new, 1);
        let again: i64 = conn.hset("h", "f1", "v2").unwrap();
        assert_eq!(again, 0);
        let value: String = conn.hget("h", "f1").unwrap();
        assert_eq!(value, "v2");
        let two: i64 = conn.hincr("h", "n", 2).unwrap();
        assert_eq!(two, 2);
        let five: i64 = conn.hincr("h", "n", 3).unwrap();
        assert_eq!(five, 5);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_sorted_set_commands() {
    let port = 17007;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let added: i64 = redis::cmd("ZADD")
            .arg("z").arg(1).arg("a").arg(2).arg("b").arg(3).arg("c")
            .query(&mut conn)
            .unwrap();
        assert_eq!(added, 3);

        let above_one: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg("z").arg("(1").arg("+inf").arg("WITHSCORES")
            .query(&mut conn)
            .unwrap();
        assert_eq!(above_one, vec!["b", "2", "c", "3"]);

        let rank: i64 = redis::cmd("ZRANK").arg("z").arg("b").query(&mut conn).unwrap();
        assert_eq!(rank, 1);

        let top: Vec<String> = redis::cmd("ZREVRANGE").arg("z").arg(0).arg(0).query(&mut conn).unwrap();
        assert_eq!(top, vec!["c"]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_set_algebra() {
    let port = 17008;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let _: i64 = conn.sadd("s1", &["a", "b", "c"]).unwrap();
        let _: i64 = conn.sadd("s2", &["b", "c", "d"]).unwrap();

        let mut union: Vec<String> = conn.sunion(&["s1", "s2"]).unwrap();
        union.sort();
        assert_eq!(union, vec!["a", "b", "c", "d"]);

        let mut inter: Vec<String> = conn.sinter(&["s1", "s2"]).unwrap();
        inter.sort();
        assert_eq!(inter, vec!["b", "c"]);

        let stored: i64 = redis::cmd("SUNIONSTORE").arg("dst").arg("s1").arg("s2").query(&mut conn).unwrap();
        assert_eq!(stored, 4);
        std::thread::sleep(std::time::Duration::from_millis(100));
        let mut members: Vec<String> = conn.smembers("dst").unwrap();
        members.sort();
        assert_eq!(members, vec!["a", "b", "c", "d"]);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_mset_mget_del() {
    let port = 17009;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let _: () = redis::cmd("MSET").arg("a").arg("1").arg("b").arg("2").query(&mut conn).unwrap();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg("a").arg("nope").arg("b").query(&mut conn).unwrap();
        assert_eq!(values, vec![Some("1".into()), None, Some("2".into())]);

        let deleted: i64 = conn.del(&["a", "b", "ghost"]).unwrap();
        assert_eq!(deleted, 2);
        let exists: bool = conn.exists("a").unwrap();
        assert!(!exists);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_wrong_type_error() {
    let port = 17010;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let _: i64 = conn.rpush("l", "x").unwrap();
        let err = redis::cmd("GET").arg("l").query::<String>(&mut conn).unwrap_err();
        assert!(err.to_string().contains("WRONGTYPE"), "got: {err}");
        // The list is untouched.
        let len: i64 = conn.llen("l").unwrap();
        assert_eq!(len, 1);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_expire_ttl() {
    let port = 17011;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let _: () = conn.set("k", "v").unwrap();
        let armed: i64 = redis::cmd("EXPIRE").arg("k").arg(1).query(&mut conn).unwrap();
        assert_eq!(armed, 1);
        let ttl: i64 = redis::cmd("TTL").arg("k").query(&mut conn).unwrap();
        assert!(ttl >= 0 && ttl <= 1, "ttl was {ttl}");

        std::thread::sleep(std::time::Duration::from_millis(1300));
        let gone: Option<String> = conn.get("k").unwrap();
        assert_eq!(gone, None);
        let ttl: i64 = redis::cmd("TTL").arg("k").query(&mut conn).unwrap();
        assert_eq!(ttl, -2);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_keys_and_dbsize() {
    let port = 17012;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        for key in ["user:1", "user:2", "other"] {
            let _: () = conn.set(key, "x").unwrap();
        }
        let mut users: Vec<String> = conn.keys("user:*").unwrap();
        users.sort();
        assert_eq!(users, vec!["user:1", "user:2"]);
        let size: i64 = redis::cmd("DBSIZE").query(&mut conn).unwrap();
        assert_eq!(size, 3);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_rename() {
    let port = 17013;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let _: () = conn.set("old", "value").unwrap();
        let _: () = redis::cmd("RENAME").arg("old").arg("new").query(&mut conn).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        let moved: String = conn.get("new").unwrap();
        assert_eq!(moved, "value");
        let gone: bool = conn.exists("old").unwrap();
        assert!(!gone);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_bitmap_commands() {
    let port = 17014;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let old: i64 = redis::cmd("SETBIT").arg("bits").arg(7).arg(1).query(&mut conn).unwrap();
        assert_eq!(old, 0);
        let bit: i64 = redis::cmd("GETBIT").arg("bits").arg(7).query(&mut conn).unwrap();
        assert_eq!(bit, 1);
        let count: i64 = redis::cmd("BITCOUNT").arg("bits").query(&mut conn).unwrap();
        assert_eq!(count, 1);
        let pos: i64 = redis::cmd("BITPOS").arg("bits").arg(1).query(&mut conn).unwrap();
        assert_eq!(pos, 7);
        // Missing key behaves as all zeros.
        let zero: i64 = redis::cmd("BITPOS").arg("none").arg(0).query(&mut conn).unwrap();
        assert_eq!(zero, 0);
        let none: i64 = redis::cmd("BITPOS").arg("none").arg(1).query(&mut conn).unwrap();
        assert_eq!(none, -1);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_hyperloglog_commands() {
    let port = 17015;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port);
        let changed: i64 = redis::cmd("PFADD").arg("hll").arg("a").arg("b").query(&mut conn).unwrap();
        assert_eq!(changed, 1);
        let unchanged: i64 = redis::cmd("PFADD").arg("hll").arg("a").query(&mut conn).unwrap();
        assert_eq!(unchanged, 0);
        let count: i64 = redis::cmd("PFCOUNT").arg("hll").query(&mut conn).unwrap();
        assert_eq!(count, 2);
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_subscribe_publish() {
    let port = 17016;
    let _server = start_server(port, &test_dir(port), -1);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let subscriber = get_client(port);
        let mut subscriber = subscriber;
        let mut pubsub = subscriber.as_pubsub();
        pubsub.subscribe("ch").unwrap();

        let mut publisher = get_client(port);
        // Give the subscription a beat to register across the mesh.
        std::thread::sleep(std::time::Duration::from_millis(100));
        let receivers: i64 = publisher.publish("ch", "hi").unwrap();
        assert_eq!(receivers, 1);

        let message = pubsub.get_message().unwrap();
        assert_eq!(message.get_channel_name(), "ch");
        let body: String = message.get_payload().unwrap();
        assert_eq!(body, "hi");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_values_survive_restart() {
    let port_a = 17017;
    let port_b = 17018;
    let dir = test_dir(port_a);

    let _first = start_server(port_a, &dir, 0);
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port_a);
        let _: () = conn.set("foo", "bar").unwrap();
        let _: i64 = conn.rpush("l", &["a", "b"]).unwrap();
    })
    .await
    .unwrap();

    // A second server over the same snapshot directory plays the part of
    // the restarted process.
    let _second = start_server(port_b, &dir, 0);
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    tokio::task::spawn_blocking(move || {
        let mut conn = get_client(port_b);
        let value: String = conn.get("foo").unwrap();
        assert_eq!(value, "bar");
        let list: Vec<String> = conn.lrange("l", 0, -1).unwrap();
        assert_eq!(list, vec!["a", "b"]);
    })
    .await
    .unwrap();
}
