//! sandjs REPL
//!
//! Interactive shell and script runner.
//!
//! Usage: sandjs [options] [file]
//!   -h, --help           List options
//!   -e, --eval EXPR      Evaluate EXPR and print the result
//!   -i, --interactive    Go to interactive mode after running a script
//!   --memory-limit N     Byte budget (supports k/K, m/M suffixes)
//!   --time-limit MS      Wall-clock limit per evaluation, in milliseconds

use sandjs::{Context, ContextConfig, Error, Value};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::time::Duration;

/// Command line options
struct Options {
    script: Option<String>,
    eval_expr: Option<String>,
    interactive: bool,
    memory_limit: Option<usize>,
    time_limit: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            script: None,
            eval_expr: None,
            interactive: false,
            memory_limit: None,
            time_limit: None,
        }
    }
}

fn print_help() {
    println!("usage: sandjs [options] [file]");
    println!("-h  --help            list options");
    println!("-e  --eval EXPR       evaluate EXPR and print the result");
    println!("-i  --interactive     go to interactive mode");
    println!("    --memory-limit n  limit the memory usage to 'n' bytes (k/m suffixes)");
    println!("    --time-limit ms   limit each evaluation to 'ms' milliseconds");
}

fn parse_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (num, multiplier) = if s.ends_with(['k', 'K']) {
        (&s[..s.len() - 1], 1024)
    } else if s.ends_with(['m', 'M']) {
        (&s[..s.len() - 1], 1024 * 1024)
    } else {
        (s, 1)
    };
    num.parse::<usize>().ok().map(|n| n * multiplier)
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut opts = Options::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-e" | "--eval" => {
                i += 1;
                let expr = args.get(i).ok_or("--eval requires an argument")?;
                opts.eval_expr = Some(expr.clone());
            }
            "-i" | "--interactive" => {
                opts.interactive = true;
            }
            "--memory-limit" => {
                i += 1;
                let raw = args.get(i).ok_or("--memory-limit requires an argument")?;
                opts.memory_limit =
                    Some(parse_size(raw).ok_or_else(|| format!("invalid size '{}'", raw))?);
            }
            "--time-limit" => {
                i += 1;
                let raw = args.get(i).ok_or("--time-limit requires an argument")?;
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid duration '{}'", raw))?;
                opts.time_limit = Some(Duration::from_millis(ms));
            }
            arg if !arg.starts_with('-') && opts.script.is_none() => {
                opts.script = Some(arg.to_string());
            }
            arg => return Err(format!("unknown option '{}'", arg)),
        }
        i += 1;
    }
    Ok(opts)
}

fn report(result: Result<Value, Error>, print_value: bool) {
    match result {
        Ok(value) => {
            if print_value && !value.is_undefined() {
                println!("{}", value);
            }
        }
        Err(e) => eprintln!("{}", e),
    }
}

fn repl(ctx: &mut Context) {
    let Ok(mut editor) = DefaultEditor::new() else {
        eprintln!("failed to initialise line editor");
        return;
    };
    println!("sandjs {} - type JS, ctrl-d to exit", env!("CARGO_PKG_VERSION"));
    loop {
        match editor.readline("js> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                report(ctx.eval(&line), true);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("readline error: {}", e);
                break;
            }
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let opts = match parse_args() {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(2);
        }
    };

    let config = ContextConfig {
        memory_limit: opts.memory_limit,
        time_limit: opts.time_limit,
        ..Default::default()
    };
    let mut ctx = match Context::with_config(config) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("failed to create context: {}", e);
            std::process::exit(1);
        }
    };

    let mut ran_something = false;

    if let Some(expr) = &opts.eval_expr {
        report(ctx.eval(expr), true);
        ran_something = true;
    }

    if let Some(path) = &opts.script {
        match std::fs::read_to_string(path) {
            Ok(source) => report(ctx.eval(&source), false),
            Err(e) => {
                eprintln!("cannot read {}: {}", path, e);
                std::process::exit(1);
            }
        }
        ran_something = true;
    }

    if !ran_something || opts.interactive {
        repl(&mut ctx);
    }
}
