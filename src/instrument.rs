//! Probe injection for the capture run.
//!
//! For every function whose body contains the `lx.Gen` marker, either a
//! `defer lx.SpyVoid("name")` probe is prepended (void functions) or each
//! returned expression is wrapped in `lx.Spy[T]("name", e)` (typed
//! functions). The marker call itself stays in place so the program still
//! emits its INPUT trace. Edits are byte splices applied back-to-front and
//! the result is re-emitted through gofmt so offsets are canonical for the
//! later stages.

use crate::gosrc;
use crate::restore::{BackupSet, FileBackup};
use crate::scan;
use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

/// Instrument every marker-bearing function under `root`, recording a
/// backup per modified file. Read and parse problems skip the file;
/// formatting and write problems abort. Backups recorded before a failure
/// stay in `backups` so the caller can always revert.
pub fn instrument(root: &Path, backups: &BackupSet) -> Result<()> {
    for path in scan::walk_go_files(root) {
        let Ok(abs) = fs::canonicalize(&path) else {
            continue;
        };
        let Ok(src) = fs::read_to_string(&abs) else {
            continue;
        };

        let injected = match inject_probes(&src) {
            Ok(Some(new_src)) => new_src,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("[lx] skipping {} ({err})", abs.display());
                continue;
            }
        };

        let formatted =
            gofmt_source(&injected).with_context(|| format!("formatting {}", abs.display()))?;

        let permissions = fs::metadata(&abs)
            .with_context(|| format!("reading metadata of {}", abs.display()))?
            .permissions();
        backups.insert(
            abs.clone(),
            FileBackup {
                data: src.into_bytes(),
                permissions: permissions.clone(),
            },
        );

        fs::write(&abs, formatted).with_context(|| format!("writing {}", abs.display()))?;
        fs::set_permissions(&abs, permissions)
            .with_context(|| format!("restoring mode of {}", abs.display()))?;
    }
    Ok(())
}

/// Apply the probe transformation to one file's source. Returns `None`
/// when nothing needed to change; the transformation is idempotent, so a
/// second pass over its own output also returns `None`.
pub fn inject_probes(src: &str) -> Result<Option<String>> {
    let tree = gosrc::parse(src)?;
    let mut edits: Vec<Edit> = Vec::new();

    for func in gosrc::functions(tree.root_node(), src) {
        if !gosrc::body_calls_gen(func.body, src) {
            continue;
        }
        if func.is_void() {
            if has_void_probe(&func, src) {
                continue;
            }
            edits.push(Edit {
                start: func.body_start() + 1,
                end: func.body_start() + 1,
                text: format!("\n\tdefer lx.SpyVoid(\"{}\")\n", func.name),
            });
        } else {
            collect_return_wraps(&func, src, &mut edits);
        }
    }

    if edits.is_empty() {
        return Ok(None);
    }
    Ok(Some(apply_edits(src, edits)))
}

/// Wrap each return expression of a typed function. Expressions past the
/// declared result count and expressions already wrapped are left alone.
fn collect_return_wraps(func: &gosrc::GoFunction, src: &str, edits: &mut Vec<Edit>) {
    gosrc::walk(func.body, &mut |node| {
        if node.kind() != "return_statement" {
            return;
        }
        for (i, expr) in gosrc::return_expressions(node).into_iter().enumerate() {
            if i >= func.results.len() || gosrc::is_spy_wrapped(expr, src) {
                continue;
            }
            edits.push(Edit {
                start: expr.start_byte(),
                end: expr.end_byte(),
                text: format!(
                    "lx.Spy[{}](\"{}\", {})",
                    func.results[i],
                    func.name,
                    gosrc::text(expr, src)
                ),
            });
        }
    });
}

/// True when the body's first statement is already the void probe.
fn has_void_probe(func: &gosrc::GoFunction, src: &str) -> bool {
    let mut cursor = func.body.walk();
    let result = func
        .body
        .named_children(&mut cursor)
        .find(|c| c.kind() != "comment")
        .map(|first| {
            first.kind() == "defer_statement"
                && gosrc::text(first, src).starts_with("defer lx.SpyVoid(")
        })
        .unwrap_or(false);
    result
}

/// Splice edits back-to-front. An edit nested inside one that was already
/// applied (a return inside a returned function literal) is dropped rather
/// than corrupting the outer replacement.
fn apply_edits(src: &str, mut edits: Vec<Edit>) -> String {
    edits.sort_by(|a, b| b.start.cmp(&a.start));
    let mut out = src.to_string();
    let mut applied_floor = usize::MAX;
    for edit in edits {
        if edit.end > applied_floor {
            continue;
        }
        out.replace_range(edit.start..edit.end, &edit.text);
        applied_floor = edit.start;
    }
    out
}

/// Pipe source through gofmt, stdin to stdout.
pub fn gofmt_source(src: &str) -> Result<String> {
    let mut child = Command::new("gofmt")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to run gofmt (is the Go toolchain installed?)")?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(src.as_bytes()).context("writing to gofmt")?;
    }
    let out = child.wait_with_output().context("waiting for gofmt")?;
    if !out.status.success() {
        bail!(
            "gofmt rejected the source: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    String::from_utf8(out.stdout).context("gofmt produced non-UTF-8 output")
}

/// Format a rewritten file in place.
pub fn gofmt_file(path: &Path) -> Result<()> {
    let out = Command::new("gofmt")
        .arg("-w")
        .arg(path)
        .output()
        .context("failed to run gofmt")?;
    if !out.status.success() {
        bail!("{}", String::from_utf8_lossy(&out.stderr).trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_void_function_gets_defer_probe() {
        let src = "package main\n\nfunc Notify() {\n\tlx.Gen(\"send a notification\")\n}\n";
        let out = inject_probes(src).unwrap().unwrap();
        assert!(out.contains("defer lx.SpyVoid(\"Notify\")"));
        // The marker stays so the INPUT trace is still emitted.
        assert!(out.contains("lx.Gen(\"send a notification\")"));
    }

    #[test]
    fn test_typed_returns_are_wrapped_per_position() {
        let src = "package main\n\nfunc Pair(n int) (int, string) {\n\tlx.Gen(\"pair it\")\n\treturn n, \"x\"\n}\n";
        let out = inject_probes(src).unwrap().unwrap();
        assert!(out.contains("return lx.Spy[int](\"Pair\", n), lx.Spy[string](\"Pair\", \"x\")"));
    }

    #[test]
    fn test_every_return_site_is_wrapped() {
        let src = "package main\n\nfunc Pick(f bool) int {\n\tlx.Gen(\"pick\")\n\tif f {\n\t\treturn 1\n\t}\n\treturn 2\n}\n";
        let out = inject_probes(src).unwrap().unwrap();
        assert_eq!(out.matches("lx.Spy[int](\"Pick\",").count(), 2);
    }

    #[test]
    fn test_reinstrumenting_is_a_no_op() {
        let src = "package main\n\nfunc Double(n int) int {\n\tlx.Gen(\"double\")\n\treturn n\n}\n\nfunc Notify() {\n\tlx.Gen(\"notify\")\n}\n";
        let first = inject_probes(src).unwrap().unwrap();
        assert!(inject_probes(&first).unwrap().is_none());
    }

    #[test]
    fn test_functions_without_marker_untouched() {
        let src = "package main\n\nfunc Plain(n int) int {\n\treturn n * 2\n}\n";
        assert!(inject_probes(src).unwrap().is_none());
    }

    #[test]
    fn test_bare_return_with_named_results_is_left_alone() {
        let src =
            "package main\n\nfunc Named() (n int) {\n\tlx.Gen(\"named\")\n\tn = 1\n\treturn\n}\n";
        assert!(inject_probes(src).unwrap().is_none());
    }

    #[test]
    fn test_broken_file_is_a_parse_error() {
        assert!(inject_probes("package main\n\nfunc Broken( {").is_err());
    }

    #[test]
    fn test_instrument_and_revert_roundtrip() {
        if gofmt_source("package main\n").is_err() {
            // Go toolchain not installed where the tests run.
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.go");
        fs::write(
            &path,
            "package main\n\nfunc Double(n int) int {\n\tlx.Gen(\"double n\")\n\treturn 0\n}\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o744)).unwrap();
        }
        let original = fs::read(&path).unwrap();

        let backups = BackupSet::new();
        instrument(dir.path(), &backups).unwrap();
        assert_eq!(backups.len(), 1);

        let instrumented = fs::read_to_string(&path).unwrap();
        assert!(instrumented.contains("lx.Spy[int](\"Double\", 0)"));

        backups.restore_all();
        assert_eq!(fs::read(&path).unwrap(), original);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(
                fs::metadata(&path).unwrap().permissions().mode() & 0o777,
                0o744
            );
        }
    }
}
