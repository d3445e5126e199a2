//! lx: trace-driven function body synthesis for Go projects.
//!
//! A stub whose body calls `lx.Gen("<intent>")` is instrumented with trace
//! probes, observed under a real run of the program, and rewritten in
//! place with a generated implementation that keeps the signature intact.
//! Source files are mutated only transiently: every modification is undone
//! on every exit path, including crashes and interrupts.

mod config;
mod gosrc;
mod instrument;
mod llm;
mod merge;
mod restore;
mod runner;
mod scan;
mod synth;
mod trace;
mod util;

use anyhow::{bail, Result};
use clap::Parser;
use restore::{BackupSet, RestoreGuard};
use runner::CaptureOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use synth::SynthOptions;

#[derive(Parser, Debug)]
#[command(
    name = "lx",
    about = "Trace-driven function body synthesis for Go projects",
    version
)]
struct Args {
    /// Path to the Go project root
    #[arg(default_value = ".")]
    path: PathBuf,

    /// Deadline for the capture phase (e.g. 30s, 5m, 1h)
    #[arg(long, default_value = "5m", value_parser = parse_duration)]
    timeout: Duration,

    /// Echo the target program's stdout (excluding trace lines)
    #[arg(long)]
    show_stdout: bool,

    /// Max characters of the captured prompt sent to the LLM
    #[arg(long, default_value_t = 4096)]
    max_prompt: usize,

    /// Max characters of existing body context sent to the LLM (reserved)
    #[arg(long, default_value_t = 8192)]
    max_context: usize,

    /// Max bytes of the captured sample output sent to the LLM
    #[arg(long, default_value_t = 32 * 1024)]
    max_output: usize,

    /// Build tags forwarded to the capture run (e.g. "mock")
    #[arg(long, default_value = "")]
    tags: String,
}

/// Accepts `30s`, `5m`, `1h`, or bare seconds.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .char_indices()
        .rfind(|(_, c)| c.is_ascii_digit())
        .map(|(idx, _)| raw.split_at(idx + 1));
    let Some((value, unit)) = split else {
        return Err(format!("invalid duration: {raw}"));
    };
    let n: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration: {raw}"))?;
    let secs = match unit.trim() {
        "" | "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        other => return Err(format!("unknown duration unit '{other}'")),
    };
    Ok(Duration::from_secs(secs))
}

#[tokio::main]
async fn main() -> ExitCode {
    let started = Instant::now();
    let args = Args::parse();

    let (cfg, config_source) = match config::load() {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("[lx] config error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let client = match llm::LlmClient::new(&cfg) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            eprintln!("[lx] LLM init error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    let provider = if cfg.provider.trim().is_empty() {
        "gemini"
    } else {
        cfg.provider.trim()
    };
    println!("[lx] starting");
    println!("[lx] config: {config_source}");
    println!("[lx] provider: [{provider}] / model: [{}]", cfg.model);

    match run(args, cfg, client).await {
        Ok(()) => {
            println!("[lx] all tasks completed in {:.2?}", started.elapsed());
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args, cfg: config::Config, client: Arc<llm::LlmClient>) -> Result<()> {
    println!("[lx] instrumenting sources");
    let backups = BackupSet::new();
    let instrumented = instrument::instrument(&args.path, &backups);

    // From here on the tree may be modified: the signal task and the RAII
    // guard both hold the table, so interrupts, errors, and panics all
    // restore before exit.
    restore::install_signal_guard(backups.clone());
    let _guard = RestoreGuard::new(backups.clone());

    if let Err(err) = instrumented {
        bail!("[lx] instrumentation failed: {err:#}");
    }

    println!("[lx] running the program and collecting traces");
    let capture_opts = CaptureOptions {
        timeout: args.timeout,
        show_stdout: args.show_stdout,
        tags: args.tags.clone(),
    };
    let captured = runner::run_and_capture(&capture_opts, &args.path).await;

    println!("[lx] restoring source code");
    backups.restore_all();

    let capture = match captured {
        Ok(capture) => capture,
        Err(err) => bail!("[lx] capture failed: {err:#}"),
    };
    if !capture.failures.is_empty() {
        bail!(
            "[lx] execution failed, fix the Go program first:\n\t- {}",
            capture.failures.join("\n\t- ")
        );
    }

    println!("[lx] merging traces with targets");
    let targets = merge::scan_and_merge(&args.path, capture.traces);
    if targets.is_empty() {
        println!("[lx] no synthesis target was reached");
        return Ok(());
    }

    println!("[lx] generating implementations");
    let synth_opts = SynthOptions {
        timeout: args.timeout,
        max_prompt: args.max_prompt,
        max_output: args.max_output,
    };
    synth::synthesize_all(synth_opts, client, cfg.model.clone(), targets).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m5").is_err());
        assert!(parse_duration("5d").is_err());
    }
}
