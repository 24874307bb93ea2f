//! Hook Sandbox CLI
//!
//! Single-shot mode:
//!   hook-sandbox --host <host> [--path <hook-path>] [--param key=value]...
//!
//! Server mode (persistent session, reads from stdin):
//!   hook-sandbox --host <host> --server
//!
//! Protocol (server mode):
//!   Request (stdin):
//!     /hooks/get.jsx
//!     {"user":"alice"}
//!
//!   A first line of `retry /hooks/get.jsx` forces a manual retry. An empty
//!   path loads the host's default hook.
//!
//!   Response (stdout):
//!     Status:Ok
//!     Length:1234
//!
//!     {"type":"div","props":{},"children":[...]}
//!
//!   Error response:
//!     Status:Error
//!     Length:42
//!
//!     [fetch] git.example.org/hooks/get.jsx: ...

use anyhow::{anyhow, Result};
use clap::Parser;
use hook_sandbox::{
    logging, HookRuntime, LoadStatus, LoadedHook, Protocol, RuntimeConfig, MAX_RENDER_DEPTH,
};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hook-sandbox", version, about = "Fetch, compile and run repository UI hooks")]
struct Cli {
    /// Repository host, optionally with port
    #[arg(long)]
    host: Option<String>,

    /// Hook path; defaults to the host's advertised "get" hook
    #[arg(long)]
    path: Option<String>,

    /// Hook parameter as key=value (repeatable)
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// TOML config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Talk plain HTTP to the host
    #[arg(long)]
    insecure_http: bool,

    /// Compile service endpoint
    #[arg(long)]
    compile_url: Option<String>,

    /// Initial repository branch
    #[arg(long)]
    branch: Option<String>,

    /// Persistent mode reading requests from stdin
    #[arg(long)]
    server: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn build_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if cli.insecure_http {
        config.protocol = Protocol::Http;
    }
    if let Some(url) = &cli.compile_url {
        config.compile_url = Some(url.clone());
    }
    if let Some(branch) = &cli.branch {
        config.branch = Some(branch.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_console(hook: &LoadedHook) {
    for log in &hook.console.logs {
        eprintln!("[LOG] {}", log);
    }
    for warn in &hook.console.warns {
        eprintln!("[WARN] {}", warn);
    }
    for err in &hook.console.errors {
        eprintln!("[ERROR] {}", err);
    }
    for to in &hook.effects.navigations {
        eprintln!("[NAVIGATE] {}", to);
    }
}

/// Render a load outcome into a response body, reporting render failures
/// back to the session.
fn render(runtime: &HookRuntime, path: &str, status: LoadStatus) -> Result<String, String> {
    match status {
        LoadStatus::Loaded(hook) | LoadStatus::Cached(hook) => {
            print_console(&hook);
            match hook.element.render_outline(MAX_RENDER_DEPTH) {
                Ok(outline) => {
                    eprint!("{}", outline);
                    serde_json::to_string(&hook.element).map_err(|e| e.to_string())
                }
                Err(err) => {
                    runtime.report_render_failure(path, &err);
                    Err(format!("[render] {}{}: {}", runtime.config().host, path, err))
                }
            }
        }
        LoadStatus::Failed(err) => Err(format!("{}\n{}", err, err.failure.detail())),
        LoadStatus::Paused { attempts, last_error } => {
            let last = last_error.map(|e| e.to_string()).unwrap_or_default();
            Err(format!(
                "paused after {} failed attempts; send 'retry {}' to try again\n{}",
                attempts, path, last
            ))
        }
        LoadStatus::Throttled { retry_in } => {
            Err(format!("throttled: next attempt allowed in {}ms", retry_in.as_millis()))
        }
        LoadStatus::InFlight => Err(format!("{} is already loading", path)),
        LoadStatus::Superseded => Err(format!("{} was superseded", path)),
    }
}

async fn entry_path(runtime: &HookRuntime, path: Option<&str>) -> Result<String> {
    match path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => Ok(path.to_string()),
        None => Ok(runtime.default_entry().await?),
    }
}

/// Run in single-shot mode
async fn run_single_shot(runtime: &HookRuntime, path: Option<&str>, params: BTreeMap<String, String>) -> Result<()> {
    let path = entry_path(runtime, path).await?;
    let status = runtime.request(&path, &params).await;

    match render(runtime, &path, status) {
        Ok(body) => {
            println!("{}", body);
            Ok(())
        }
        Err(message) => Err(anyhow!(message)),
    }
}

/// Run in server mode (persistent session, reads requests from stdin)
async fn run_server(runtime: &HookRuntime) -> Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut reader = stdin.lock();

    tracing::info!(target: "hook_sandbox", host = %runtime.config().host, "server ready, reading from stdin");

    loop {
        let mut path_line = String::new();
        let mut params_line = String::new();

        // Read hook path (line 1)
        let bytes_read = reader.read_line(&mut path_line)?;
        if bytes_read == 0 {
            // EOF - stdin closed, exit gracefully
            break;
        }

        // Read params JSON (line 2)
        reader.read_line(&mut params_line)?;

        let (manual, path) = match path_line.trim().strip_prefix("retry ") {
            Some(rest) => (true, rest.trim()),
            None => (false, path_line.trim()),
        };
        let params_str = params_line.trim();

        let params: BTreeMap<String, String> = if params_str.is_empty() {
            BTreeMap::new()
        } else {
            match serde_json::from_str(params_str) {
                Ok(p) => p,
                Err(e) => {
                    write_response(&mut stdout, false, &format!("Invalid params JSON: {}", e))?;
                    continue;
                }
            }
        };

        let path = match entry_path(runtime, Some(path)).await {
            Ok(path) => path,
            Err(e) => {
                write_response(&mut stdout, false, &e.to_string())?;
                continue;
            }
        };

        let status = if manual {
            runtime.retry(&path, &params).await
        } else {
            runtime.request(&path, &params).await
        };

        match render(runtime, &path, status) {
            Ok(body) => write_response(&mut stdout, true, &body)?,
            Err(message) => write_response(&mut stdout, false, &message)?,
        }
    }

    tracing::info!(target: "hook_sandbox", "server shutting down");
    Ok(())
}

/// Write response in length-prefixed protocol
fn write_response(stdout: &mut std::io::Stdout, ok: bool, body: &str) -> Result<()> {
    let status = if ok { "Ok" } else { "Error" };
    let length = body.len();

    writeln!(stdout, "Status:{}", status)?;
    writeln!(stdout, "Length:{}", length)?;
    writeln!(stdout)?; // Empty line separator
    write!(stdout, "{}", body)?;
    stdout.flush()?;

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_subscriber(&cli.log_level);

    let config = build_config(&cli)?;
    // Create the session ONCE (V8 cold start happens here)
    let runtime = HookRuntime::connect(config)?;

    if cli.server {
        return run_server(&runtime).await;
    }

    let params: BTreeMap<String, String> = cli.params.iter().cloned().collect();
    run_single_shot(&runtime, cli.path.as_deref(), params).await
}
