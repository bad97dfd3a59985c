//! End-to-end tests for EVAL / EVALSHA / SCRIPT
//!
//! Drives the command handlers exactly as the connection layer would, against
//! the in-memory store.

use std::sync::Arc;

use ferrous_scripting::scripting::registry::sha1hex;
use ferrous_scripting::storage::CommandExecutor;
use ferrous_scripting::{
    handle_lua_command, ClientSession, CommandRegistry, KeyLockTable, MemoryStore, RespFrame,
    ScriptRunner, ScriptServer, ScriptingConfig,
};

struct Harness {
    runner: ScriptRunner,
    store: Arc<MemoryStore>,
    session: ClientSession,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ScriptingConfig::default())
    }

    fn with_config(config: ScriptingConfig) -> Self {
        Self::with_store(config, MemoryStore::new(16))
    }

    fn with_store(config: ScriptingConfig, store: MemoryStore) -> Self {
        let store = Arc::new(store);
        let server = ScriptServer::new(
            config,
            Arc::new(CommandRegistry::standard()),
            Arc::clone(&store) as Arc<dyn CommandExecutor>,
            Arc::new(KeyLockTable::new()),
        );
        Harness {
            runner: ScriptRunner::new(server, 0).unwrap(),
            store,
            session: ClientSession::new(),
        }
    }

    fn command(&mut self, parts: &[&str]) -> RespFrame {
        let frames: Vec<RespFrame> = parts.iter().map(RespFrame::bulk_string).collect();
        handle_lua_command(&mut self.runner, &self.session, parts[0], &frames)
    }

    fn eval(&mut self, script: &str, keys: &[&str], args: &[&str]) -> RespFrame {
        let numkeys = keys.len().to_string();
        let mut parts = vec!["EVAL", script, numkeys.as_str()];
        parts.extend_from_slice(keys);
        parts.extend_from_slice(args);
        self.command(&parts)
    }
}

fn bulk(s: &str) -> RespFrame {
    RespFrame::bulk_string(s)
}

fn error_text(frame: &RespFrame) -> String {
    frame
        .error_message()
        .unwrap_or_else(|| panic!("expected an error reply, got {:?}", frame))
}

#[test]
fn test_mixed_array_reply() {
    let mut h = Harness::new();
    let reply = h.eval("return {1, 2, 'three', {4, 'five'}}", &[], &[]);
    assert_eq!(
        reply,
        RespFrame::array(vec![
            RespFrame::Integer(1),
            RespFrame::Integer(2),
            bulk("three"),
            RespFrame::array(vec![RespFrame::Integer(4), bulk("five")]),
        ])
    );
}

#[test]
fn test_reply_conversions() {
    let mut h = Harness::new();
    assert_eq!(h.eval("return 3.99", &[], &[]), RespFrame::Integer(3));
    assert_eq!(h.eval("return true", &[], &[]), RespFrame::Integer(1));
    assert_eq!(h.eval("return false", &[], &[]), RespFrame::null_bulk());
    assert_eq!(h.eval("return nil", &[], &[]), RespFrame::null_bulk());
    // an array stops at the first nil
    assert_eq!(
        h.eval("return {1, nil, 3}", &[], &[]),
        RespFrame::array(vec![RespFrame::Integer(1)])
    );
    assert_eq!(h.eval("return {err = 'My Error'}", &[], &[]), RespFrame::error("My Error"));
    assert_eq!(h.eval("return redis.status_reply('FINE')", &[], &[]), RespFrame::simple_string("FINE"));
    assert_eq!(h.eval("return redis.error_reply('NOPE')", &[], &[]), RespFrame::error("NOPE"));
}

#[test]
fn test_missing_key_is_nil() {
    let mut h = Harness::new();
    assert_eq!(h.eval("return redis.call('get', KEYS[1])", &["missing"], &[]), RespFrame::null_bulk());
    assert_eq!(
        h.eval("return redis.call('get', KEYS[1]) == false", &["missing"], &[]),
        RespFrame::Integer(1)
    );
}

#[test]
fn test_writes_land_in_caller_database() {
    let mut h = Harness::new();
    h.session = ClientSession::new().with_db(3);
    let reply = h.eval("return redis.call('set', KEYS[1], ARGV[1])", &["k"], &["v"]);
    assert_eq!(reply, RespFrame::ok());
    assert_eq!(h.store.get_string(3, b"k"), Some(b"v".to_vec()));
    assert_eq!(h.store.get_string(0, b"k"), None);
}

#[test]
fn test_numbers_are_passed_as_text() {
    let mut h = Harness::new();
    let reply = h.eval(
        "redis.call('set', KEYS[1], 10) return redis.call('incrby', KEYS[1], 0.5 * 4)",
        &["n"],
        &[],
    );
    assert_eq!(reply, RespFrame::Integer(12));
}

#[test]
fn test_evalsha_and_numkeys_errors() {
    let mut h = Harness::new();
    let reply = h.command(&["EVALSHA", "ffffffffffffffffffffffffffffffffffffffff", "0"]);
    assert_eq!(reply, RespFrame::error("NOSCRIPT No matching script. Please use EVAL."));

    let reply = h.eval("return 1", &[], &[]);
    assert_eq!(reply, RespFrame::Integer(1));
    let reply = h.command(&["EVALSHA", &sha1hex(b"return 1"), "0"]);
    assert_eq!(reply, RespFrame::Integer(1));

    let reply = h.command(&["EVAL", "return 1", "3", "a", "b"]);
    assert_eq!(reply, RespFrame::error("ERR Number of keys can't be greater than number of args"));
    let reply = h.command(&["EVAL", "return 1", "-1"]);
    assert_eq!(reply, RespFrame::error("ERR Number of keys can't be negative"));
}

#[test]
fn test_call_raises_and_pcall_returns_error() {
    let mut h = Harness::new();
    h.store.set_string(0, b"s", b"abc").unwrap();

    let reply = h.eval("return redis.pcall('incr', KEYS[1])", &["s"], &[]);
    assert_eq!(reply, RespFrame::error("ERR value is not an integer or out of range"));

    let reply = h.eval(
        "local r = redis.pcall('incr', KEYS[1]) return type(r) == 'table' and r.err ~= nil",
        &["s"],
        &[],
    );
    assert_eq!(reply, RespFrame::Integer(1));

    let reply = h.eval("redis.call('incr', KEYS[1]) return 'unreachable'", &["s"], &[]);
    let text = error_text(&reply);
    assert!(text.starts_with("ERR Error running script (call to f_"), "{text}");
    assert!(text.contains("ERR value is not an integer or out of range"), "{text}");
}

#[test]
fn test_unknown_and_forbidden_commands() {
    let mut h = Harness::new();
    let reply = h.eval("return redis.pcall('nosuchcommand')", &[], &[]);
    assert_eq!(reply, RespFrame::error("ERR unknown command 'nosuchcommand'"));

    let reply = h.eval("return redis.pcall('select', 1)", &[], &[]);
    assert!(error_text(&reply).contains("This Redis command is not allowed from scripts"));

    let reply = h.eval("redis.call('eval', 'return 1', 0) return 'unreachable'", &[], &[]);
    let text = error_text(&reply);
    assert!(text.contains("This Redis command is not allowed from scripts"), "{text}");
    assert!(text.contains("user_script"), "{text}");
}

#[test]
fn test_bad_call_arguments() {
    let mut h = Harness::new();
    let reply = h.eval("return redis.pcall()", &[], &[]);
    assert!(error_text(&reply).contains("Please specify at least one argument for redis.call()"));

    let reply = h.eval("return redis.pcall('get', {})", &[], &[]);
    assert!(error_text(&reply).contains("Lua redis() command arguments must be strings or integers"));

    let reply = h.eval("return redis.pcall('get')", &[], &[]);
    assert_eq!(reply, RespFrame::error("ERR wrong number of arguments for 'get' command"));
}

#[test]
fn test_write_after_random_is_refused() {
    let mut h = Harness::new();
    let reply = h.eval(
        "redis.call('time') redis.pcall('set', KEYS[1], 'v') return 'unreachable'",
        &["k"],
        &[],
    );
    let text = error_text(&reply);
    assert!(text.contains("Write commands not allowed after non deterministic commands"), "{text}");
    assert_eq!(h.store.get_string(0, b"k"), None);
    assert!(h.runner.last_outcome().random_dirty);
    assert!(!h.runner.last_outcome().write_dirty);
}

#[test]
fn test_write_after_random_in_single_command_mode() {
    let config = ScriptingConfig {
        always_replicate_commands: true,
        ..ScriptingConfig::default()
    };
    let mut h = Harness::with_config(config);
    let reply = h.eval("redis.call('time') return redis.call('set', KEYS[1], 'v')", &["k"], &[]);
    assert_eq!(reply, RespFrame::ok());
    assert_eq!(h.store.get_string(0, b"k"), Some(b"v".to_vec()));
}

#[test]
fn test_replicate_commands_switch() {
    let mut h = Harness::new();
    let reply = h.eval(
        "local switched = redis.replicate_commands() \
         redis.call('time') redis.call('set', KEYS[1], 'v') return switched",
        &["k"],
        &[],
    );
    assert_eq!(reply, RespFrame::Integer(1));

    // too late once the script has written
    let reply = h.eval(
        "redis.call('set', KEYS[1], 'w') return redis.replicate_commands()",
        &["k"],
        &[],
    );
    assert_eq!(reply, RespFrame::null_bulk());

    // the switch does not outlive its invocation
    let reply = h.eval("redis.call('time') return redis.pcall('set', KEYS[1], 'x')", &["k"], &[]);
    assert!(reply.is_error());
}

#[test]
fn test_unordered_replies_are_sorted() {
    let mut h = Harness::new();
    h.eval("return redis.call('sadd', KEYS[1], 'c', 'a', 'b', 'd')", &["s"], &[]);
    let reply = h.eval("return redis.call('smembers', KEYS[1])", &["s"], &[]);
    assert_eq!(reply, RespFrame::array(vec![bulk("a"), bulk("b"), bulk("c"), bulk("d")]));

    for key in ["k3", "k1", "k2"] {
        h.store.set_string(0, key.as_bytes(), b"x").unwrap();
    }
    let reply = h.eval("return redis.call('keys', 'k*')", &[], &[]);
    assert_eq!(reply, RespFrame::array(vec![bulk("k1"), bulk("k2"), bulk("k3")]));
}

#[test]
fn test_sandbox_restrictions() {
    let mut h = Harness::new();
    let reply = h.eval("return os.time()", &[], &[]);
    assert!(error_text(&reply).contains("Script attempted to access nonexistent global variable 'os'"));

    let reply = h.eval("leaked = 1 return leaked", &[], &[]);
    assert!(error_text(&reply).contains("Script attempted to create global variable 'leaked'"));

    let reply = h.eval("return loadfile", &[], &[]);
    assert!(reply.is_error());

    let reply = h.eval("local t = {} t.x = 1 return t.x", &[], &[]);
    assert_eq!(reply, RespFrame::Integer(1));
}

#[test]
fn test_body_cannot_escape_its_function() {
    let mut h = Harness::new();
    let reply = h.eval("return 1 end function evil() return 2", &[], &[]);
    assert!(error_text(&reply).starts_with("ERR Error compiling script"));
}

#[test]
fn test_helper_libraries() {
    let mut h = Harness::new();
    assert_eq!(
        h.eval("return redis.sha1hex('')", &[], &[]),
        bulk("da39a3ee5e6b4b0d3255bfef95601890afd80709")
    );
    assert_eq!(
        h.eval("return cjson.encode(cjson.decode(ARGV[1]).list)", &[], &[r#"{"list":[1,2,3]}"#]),
        bulk("[1,2,3]")
    );
    assert_eq!(h.eval("return bit.band(12, 10)", &[], &[]), RespFrame::Integer(8));
    assert_eq!(
        h.eval("return {cmsgpack.unpack(cmsgpack.pack(ARGV[1], 7))}", &[], &["payload"]),
        RespFrame::array(vec![bulk("payload"), RespFrame::Integer(7)])
    );
    assert_eq!(
        h.eval("return {struct.unpack('>I2', struct.pack('>I2', 258))}", &[], &[]),
        RespFrame::array(vec![RespFrame::Integer(258), RespFrame::Integer(3)])
    );
    assert_eq!(
        h.eval("redis.log(redis.LOG_WARNING, 'from', 'script', 1) return 1", &[], &[]),
        RespFrame::Integer(1)
    );
    assert!(h.eval("redis.log(42, 'bad level') return 1", &[], &[]).is_error());
}

#[test]
fn test_random_sequence_is_reproducible_across_slots() {
    let body = "return {math.random(100), math.random(100), math.random(1, 6)}";
    let mut first = Harness::new();
    let mut second = Harness::new();
    assert_eq!(first.eval(body, &[], &[]), second.eval(body, &[], &[]));

    let reply = first.eval("math.randomseed(7) local a = math.random() math.randomseed(7) return a == math.random()", &[], &[]);
    assert_eq!(reply, RespFrame::Integer(1));

    let reply = first.eval("return math.random(0)", &[], &[]);
    assert!(error_text(&reply).contains("interval is empty"));
}

#[test]
fn test_authentication_is_sticky() {
    let mut h = Harness::with_store(ScriptingConfig::default(), MemoryStore::new(16).with_required_auth());
    h.session = ClientSession::new().with_authenticated(false);
    let reply = h.eval("return redis.pcall('get', KEYS[1])", &["k"], &[]);
    assert_eq!(reply, RespFrame::error("NOAUTH Authentication required."));

    h.session = ClientSession::new();
    assert_eq!(h.eval("return redis.pcall('get', KEYS[1])", &["k"], &[]), RespFrame::null_bulk());

    // the fake session keeps the grant for later callers on this slot
    h.session = ClientSession::new().with_authenticated(false);
    assert_eq!(h.eval("return redis.pcall('get', KEYS[1])", &["k"], &[]), RespFrame::null_bulk());
}

#[test]
fn test_returned_error_is_single_line() {
    let mut h = Harness::new();
    let reply = h.eval("return {err = 'line one\\nline two'}", &[], &[]);
    assert_eq!(reply, RespFrame::error("line one line two"));
}
