//! Ferrous script CLI
//!
//! Runs Lua scripts through the same sandbox and bridge the server uses,
//! against a throwaway in-memory store.

use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process;
use std::sync::Arc;
use std::time::Instant;

use ferrous_scripting::storage::CommandExecutor;
use ferrous_scripting::{
    handle_lua_command, ClientSession, CommandRegistry, KeyLockTable, MemoryStore, RespFrame,
    ScriptRunner, ScriptServer, ScriptingConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct CliOptions {
    script: Option<String>,
    keys: Vec<String>,
    args: Vec<String>,
    config_path: Option<String>,
    interactive: bool,
    verbose: bool,
}

fn main() {
    let options = match parse_args(env::args().skip(1).collect()) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("Error: {}", message);
            print_usage();
            process::exit(1);
        }
    };

    let default_filter = if options.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with_writer(io::stderr)
        .init();

    let config = match &options.config_path {
        Some(path) => match ScriptingConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading config {}: {}", path, e);
                process::exit(1);
            }
        },
        None => ScriptingConfig::default(),
    };

    let store = Arc::new(MemoryStore::new(16));
    let server = ScriptServer::new(
        config,
        Arc::new(CommandRegistry::standard()),
        store as Arc<dyn CommandExecutor>,
        Arc::new(KeyLockTable::new()),
    );
    let mut runner = match ScriptRunner::new(server, 0) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("Error creating interpreter: {}", e);
            process::exit(1);
        }
    };

    if let Some(script) = &options.script {
        let reply = eval(&mut runner, script, &options.keys, &options.args, options.verbose);
        let failed = reply.is_error();
        println!("{}", render(&reply, 0));
        if failed && !options.interactive {
            process::exit(2);
        }
    }
    if options.interactive {
        if let Err(e) = repl(&mut runner, options.verbose) {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn parse_args(args: Vec<String>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| iter.next().ok_or_else(|| format!("{} requires a value", flag));
        match arg.as_str() {
            "-e" | "--eval" => options.script = Some(value("--eval")?),
            "-f" | "--file" => {
                let path = value("--file")?;
                let script = fs::read_to_string(&path).map_err(|e| format!("reading {}: {}", path, e))?;
                options.script = Some(script);
            }
            "-k" | "--keys" => options.keys = split_list(&value("--keys")?),
            "-a" | "--args" => options.args = split_list(&value("--args")?),
            "-c" | "--config" => options.config_path = Some(value("--config")?),
            "-i" | "--interactive" => options.interactive = true,
            "-v" | "--verbose" => options.verbose = true,
            "-h" | "--help" => {
                print_usage();
                process::exit(0);
            }
            other => return Err(format!("Unknown option: {}", other)),
        }
    }

    if options.script.is_none() && !options.interactive {
        return Err("no script provided".to_string());
    }
    Ok(options)
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn eval(runner: &mut ScriptRunner, script: &str, keys: &[String], args: &[String], verbose: bool) -> RespFrame {
    let mut parts = vec![
        RespFrame::bulk_string("EVAL"),
        RespFrame::bulk_string(script),
        RespFrame::Integer(keys.len() as i64),
    ];
    parts.extend(keys.iter().chain(args).map(RespFrame::bulk_string));

    let started = Instant::now();
    let reply = handle_lua_command(runner, &ClientSession::new(), "EVAL", &parts);
    if verbose {
        let outcome = runner.last_outcome();
        eprintln!(
            "({:.3}ms, write: {}, random: {}, slow: {})",
            started.elapsed().as_secs_f64() * 1000.0,
            outcome.write_dirty,
            outcome.random_dirty,
            outcome.timed_out
        );
    }
    reply
}

/// Read one script per line; `:load <file>` runs a file
fn repl(runner: &mut ScriptRunner, verbose: bool) -> io::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        write!(stdout, "lua> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim();
        let script = match line {
            "" => continue,
            ":quit" | ":q" => return Ok(()),
            _ => match line.strip_prefix(":load ") {
                Some(path) => match fs::read_to_string(path.trim()) {
                    Ok(script) => script,
                    Err(e) => {
                        eprintln!("Error reading {}: {}", path.trim(), e);
                        continue;
                    }
                },
                None => line.to_string(),
            },
        };
        let reply = eval(runner, &script, &[], &[], verbose);
        writeln!(stdout, "{}", render(&reply, 0))?;
    }
}

/// redis-cli style rendering of a reply
fn render(frame: &RespFrame, indent: usize) -> String {
    match frame {
        RespFrame::SimpleString(s) => String::from_utf8_lossy(s).into_owned(),
        RespFrame::Error(e) => format!("(error) {}", String::from_utf8_lossy(e)),
        RespFrame::Integer(n) => format!("(integer) {}", n),
        RespFrame::BulkString(Some(b)) => format!("\"{}\"", String::from_utf8_lossy(b)),
        RespFrame::BulkString(None) | RespFrame::Array(None) => "(nil)".to_string(),
        RespFrame::Array(Some(items)) if items.is_empty() => "(empty array)".to_string(),
        RespFrame::Array(Some(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let pad = if i == 0 { String::new() } else { " ".repeat(indent) };
                format!("{}{}) {}", pad, i + 1, render(item, indent + 3))
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn print_usage() {
    eprintln!("Usage: script_cli [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -e, --eval <script>     Run a script given inline");
    eprintln!("  -f, --file <path>       Run a script read from a file");
    eprintln!("  -k, --keys <k1,k2,...>  Comma-separated KEYS");
    eprintln!("  -a, --args <a1,a2,...>  Comma-separated ARGV");
    eprintln!("  -c, --config <path>     Load scripting settings from a config file");
    eprintln!("  -i, --interactive       Read scripts line by line from stdin");
    eprintln!("  -v, --verbose           Debug logging and per-script timing");
    eprintln!("  -h, --help              Show this help");
}
