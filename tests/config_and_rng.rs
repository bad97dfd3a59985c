//! Configuration loading and the deterministic generator

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use ferrous_scripting::scripting::Lrand48;
use ferrous_scripting::storage::CommandExecutor;
use ferrous_scripting::{
    ClientSession, CommandRegistry, KeyLockTable, MemoryStore, RespFrame, ScriptRunner, ScriptServer,
    ScriptingConfig,
};

#[test]
fn test_config_file_drives_the_server() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# scripting settings").unwrap();
    writeln!(file, "lua-time-limit 250").unwrap();
    writeln!(file, "lua-hook-interval 500").unwrap();
    writeln!(file, "lua-replicate-commands yes").unwrap();
    writeln!(file, "lua-lock-timeout 20").unwrap();
    file.flush().unwrap();

    let config = ScriptingConfig::from_file(file.path()).unwrap();
    assert_eq!(config.time_limit(), Some(Duration::from_millis(250)));
    assert_eq!(config.lock_timeout(), Some(Duration::from_millis(20)));
    assert_eq!(config.get("lua-replicate-commands").as_deref(), Some("yes"));
    assert_eq!(config.get("cluster-enabled").as_deref(), Some("no"));

    let server = ScriptServer::new(
        config,
        Arc::new(CommandRegistry::standard()),
        Arc::new(MemoryStore::new(1)) as Arc<dyn CommandExecutor>,
        Arc::new(KeyLockTable::new()),
    );
    let mut runner = ScriptRunner::new(server, 0).unwrap();

    // single-command replication lets a write follow a random command
    let reply = runner
        .eval(
            &ClientSession::new(),
            b"redis.call('randomkey') return redis.call('set', KEYS[1], 'v')",
            b"1",
            &[b"k".to_vec()],
        )
        .unwrap();
    assert_eq!(reply, RespFrame::ok());
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ScriptingConfig::from_file(dir.path().join("absent.conf")).is_err());
}

#[test]
fn test_generator_is_reproducible() {
    let mut a = Lrand48::new(0);
    let mut b = Lrand48::new(0);
    assert_eq!(a.next_i32(), 366850414);
    b.next_i32();
    for _ in 0..10_000 {
        assert_eq!(a.next_i32(), b.next_i32());
    }

    let mut c = Lrand48::new(12345);
    let mut d = Lrand48::new(12345);
    let first: Vec<f64> = (0..100).map(|_| c.next_upto(6).unwrap()).collect();
    let second: Vec<f64> = (0..100).map(|_| d.next_upto(6).unwrap()).collect();
    assert_eq!(first, second);
    assert!(first.iter().all(|&n| (1.0..=6.0).contains(&n) && n.fract() == 0.0));
}
