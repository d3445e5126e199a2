//! Capture-phase execution of the user's entry points.
//!
//! Every directory declaring `package main` is run as `go run .` with a
//! restricted environment and a freshly generated trace token. A single
//! reader drains the child's stdout line by line, decoding framed trace
//! records and treating everything else as opaque program output. stderr
//! is inherited so compile errors and stack traces surface verbatim.

use crate::gosrc;
use crate::scan;
use crate::trace::{self, Framing, TraceRecord, LINE_BUFFER_CAP, TRACE_MAX_BYTES};
use anyhow::{anyhow, bail, Context, Result};
use rand::RngCore;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Environment names forwarded to the capture child; everything else in
/// the parent environment is withheld.
const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "GOPATH",
    "GOROOT",
    "GOMODCACHE",
    "GOPRIVATE",
    "GOPROXY",
    "GONOPROXY",
    "GONOSUMDB",
    "CGO_ENABLED",
    "GOOS",
    "GOARCH",
    "TMPDIR",
];

pub struct CaptureOptions {
    pub timeout: Duration,
    pub show_stdout: bool,
    pub tags: String,
}

/// Traces collected during the run plus any per-entry failures. Records
/// gathered before a failure are preserved.
pub struct Capture {
    pub traces: Vec<TraceRecord>,
    pub failures: Vec<String>,
}

/// Run every entry point under `root` and collect its trace records. The
/// configured timeout covers the whole capture phase.
pub async fn run_and_capture(opts: &CaptureOptions, root: &Path) -> Result<Capture> {
    let root = fs::canonicalize(root)
        .with_context(|| format!("failed to resolve {}", root.display()))?;

    let entries = find_entry_points(&root);
    if entries.is_empty() {
        bail!("no executable 'package main' found under {}", root.display());
    }

    let deadline = Instant::now() + opts.timeout;
    let mut traces = Vec::new();
    let mut failures = Vec::new();

    for dir in entries {
        let rel = dir
            .strip_prefix(&root)
            .ok()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        println!("\t[exec] running entry point: {rel}");

        let (mut collected, result) = run_entry(&dir, opts, deadline).await;
        traces.append(&mut collected);
        if let Err(err) = result {
            failures.push(format!("{rel}: {err:#}"));
        }
    }

    Ok(Capture { traces, failures })
}

/// Directories containing a file that declares `package main`. Only the
/// package clause matters, so files that fail to parse cleanly are still
/// considered via a lenient parse.
fn find_entry_points(root: &Path) -> Vec<PathBuf> {
    let mut entries = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for file in scan::walk_go_files(root) {
        let Some(dir) = file.parent().map(Path::to_path_buf) else {
            continue;
        };
        if seen.contains(&dir) {
            continue;
        }
        let Ok(src) = fs::read_to_string(&file) else {
            continue;
        };
        let Ok(tree) = gosrc::parse_lenient(&src) else {
            continue;
        };
        if gosrc::package_name(tree.root_node(), &src).as_deref() == Some("main") {
            seen.insert(dir.clone());
            entries.push(dir);
        }
    }
    entries
}

async fn run_entry(
    dir: &Path,
    opts: &CaptureOptions,
    deadline: Instant,
) -> (Vec<TraceRecord>, Result<()>) {
    let token = random_token();
    let framing = Framing::new(&token);

    let mut cmd = Command::new("go");
    cmd.arg("run");
    if !opts.tags.is_empty() {
        cmd.arg("-tags").arg(&opts.tags);
    }
    cmd.arg(".");
    cmd.current_dir(dir);
    cmd.env_clear();
    for key in ENV_ALLOWLIST {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd.env("LX_MODE", "capture");
    cmd.env("LX_TRACE_TOKEN", &token);
    cmd.env("LX_TRACE_MAX_BYTES", TRACE_MAX_BYTES.to_string());
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return (
                Vec::new(),
                Err(anyhow::Error::new(err)
                    .context("failed to start `go run` (is the Go toolchain on PATH?)")),
            )
        }
    };

    let Some(stdout) = child.stdout.take() else {
        kill_child(&mut child).await;
        let _ = child.wait().await;
        return (Vec::new(), Err(anyhow!("child stdout was not piped")));
    };

    let mut reader = BufReader::with_capacity(64 * 1024, stdout);
    let mut traces: Vec<TraceRecord> = Vec::new();

    let scanned = tokio::time::timeout_at(deadline, async {
        loop {
            match read_capped_line(&mut reader, LINE_BUFFER_CAP).await? {
                ScanLine::Eof => break,
                ScanLine::Overlong => continue,
                ScanLine::Text(line) => {
                    if let Some(record) = decode(&framing, &line, dir) {
                        println!(
                            "\t[{}] {}: {}",
                            record.kind,
                            record.function,
                            trace::value_preview(&record.value, 50)
                        );
                        traces.push(record);
                    } else if opts.show_stdout {
                        println!("\t[capture stdout] {line}");
                    }
                }
            }
        }
        Ok::<(), std::io::Error>(())
    })
    .await;

    match scanned {
        Err(_) => {
            kill_child(&mut child).await;
            let _ = child.wait().await;
            return (traces, Err(anyhow!("timeout")));
        }
        Ok(Err(err)) => {
            kill_child(&mut child).await;
            let _ = child.wait().await;
            return (
                traces,
                Err(anyhow::Error::new(err).context("reading child stdout")),
            );
        }
        Ok(Ok(())) => {}
    }

    match tokio::time::timeout_at(deadline, child.wait()).await {
        Err(_) => {
            kill_child(&mut child).await;
            let _ = child.wait().await;
            (traces, Err(anyhow!("timeout")))
        }
        Ok(Err(err)) => (
            traces,
            Err(anyhow::Error::new(err).context("waiting for child")),
        ),
        Ok(Ok(status)) if !status.success() => (traces, Err(anyhow!("{status}"))),
        Ok(Ok(_)) => (traces, Ok(())),
    }
}

/// Decode one stdout line into a trace record, normalizing the function
/// name and resolving the source path against the entry directory.
fn decode(framing: &Framing, line: &str, dir: &Path) -> Option<TraceRecord> {
    let mut record = trace::parse_line(framing, line)?;
    record.function = trace::normalize_function_name(&record.function);
    let file = if record.file.is_absolute() {
        record.file.clone()
    } else {
        dir.join(&record.file)
    };
    record.file = fs::canonicalize(&file).unwrap_or(file);
    Some(record)
}

/// Kill the child's whole process group where the platform supports it so
/// `go run` cannot leave the compiled binary behind as an orphan.
async fn kill_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if killpg(Pid::from_raw(pid as i32), Signal::SIGKILL).is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

enum ScanLine {
    Eof,
    Text(String),
    Overlong,
}

/// Read one `\n`-terminated line with a hard cap. An overlong line is
/// consumed through its newline and reported as `Overlong`, never
/// half-parsed as a trace.
async fn read_capped_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> std::io::Result<ScanLine> {
    let mut buf: Vec<u8> = Vec::new();
    let mut overlong = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() && !overlong {
                return Ok(ScanLine::Eof);
            }
            break;
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if !overlong {
                    buf.extend_from_slice(&available[..pos]);
                }
                reader.consume(pos + 1);
                break;
            }
            None => {
                let len = available.len();
                if !overlong {
                    buf.extend_from_slice(available);
                }
                reader.consume(len);
                if buf.len() > cap {
                    overlong = true;
                    buf.clear();
                }
            }
        }
    }
    if overlong || buf.len() > cap {
        return Ok(ScanLine::Overlong);
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(ScanLine::Text(String::from_utf8_lossy(&buf).into_owned()))
}

/// 128 bits of OS randomness as 32 lowercase hex characters.
fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
