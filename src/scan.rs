//! Static discovery of synthesis targets.
//!
//! Walks the source tree for functions whose body calls the `lx.Gen`
//! marker. Function names are not globally unique, so a target is keyed by
//! `(function name, absolute file path)` and every recorded path is
//! canonicalized to allow a reliable join with runtime-captured paths.

use crate::gosrc;
use std::fs;
use std::path::{Path, PathBuf};
use tree_sitter::Node;
use walkdir::WalkDir;

/// A function selected for synthesis. `prompt` starts as the static marker
/// literal and is overwritten by the captured INPUT trace during merge;
/// `static_prompt` keeps the source form for the stamped comment.
#[derive(Debug, Clone)]
pub struct Target {
    pub file: PathBuf,
    pub func_name: String,
    pub static_prompt: String,
    pub prompt: String,
    pub output: String,
}

const SKIP_DIRS: &[&str] = &["vendor", ".git"];

/// Every regular `.go` file under `root`, skipping vendored trees, VCS
/// metadata, and symbolic links.
pub fn walk_go_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .map(|name| SKIP_DIRS.contains(&name))
                    .unwrap_or(false))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "go"))
        .map(|e| e.into_path())
        .collect()
}

/// Find every marker-bearing function under `root`. Per-file read and
/// parse problems are logged and skipped; the walk itself never fails.
pub fn scan_targets(root: &Path) -> Vec<Target> {
    let mut targets = Vec::new();
    for path in walk_go_files(root) {
        let abs = match fs::canonicalize(&path) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let src = match fs::read_to_string(&abs) {
            Ok(s) => s,
            Err(err) => {
                eprintln!("[lx] skipping {} (read failed: {err})", abs.display());
                continue;
            }
        };
        let tree = match gosrc::parse(&src) {
            Ok(t) => t,
            Err(err) => {
                eprintln!("[lx] skipping {} ({err})", abs.display());
                continue;
            }
        };
        for func in gosrc::functions(tree.root_node(), &src) {
            let Some(prompt) = first_gen_prompt(func.body, &src) else {
                continue;
            };
            targets.push(Target {
                file: abs.clone(),
                func_name: func.name.clone(),
                static_prompt: prompt.clone(),
                prompt,
                output: String::new(),
            });
        }
    }
    targets
}

/// Intent string of the first usable marker call in a body. A string
/// literal is taken verbatim with quotes or backticks stripped; any other
/// argument expression is carried as its source text. Empty prompts are
/// discarded.
fn first_gen_prompt(body: Node, src: &str) -> Option<String> {
    let mut found: Option<String> = None;
    gosrc::walk(body, &mut |node| {
        if found.is_some() || !gosrc::is_gen_call(node, src) {
            return;
        }
        let args = gosrc::call_arguments(node);
        let Some(first) = args.first() else {
            return;
        };
        let raw = gosrc::text(*first, src);
        let prompt = match first.kind() {
            "interpreted_string_literal" | "raw_string_literal" => raw
                .trim_matches(|c| c == '"' || c == '`')
                .to_string(),
            _ => raw.to_string(),
        };
        if !prompt.is_empty() {
            found = Some(prompt);
        }
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_scan_finds_targets_and_skips_vendor() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.go",
            "package main\n\nfunc Double(n int) int {\n\tlx.Gen(\"double n\")\n\treturn 0\n}\n",
        );
        write(
            dir.path(),
            "vendor/dep/dep.go",
            "package dep\n\nfunc Hidden() {\n\tlx.Gen(\"should not be seen\")\n}\n",
        );

        let targets = scan_targets(dir.path());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].func_name, "Double");
        assert_eq!(targets[0].static_prompt, "double n");
        assert!(targets[0].file.is_absolute());
    }

    #[test]
    fn test_same_name_in_two_files_yields_two_targets() {
        let dir = tempfile::tempdir().unwrap();
        let body = "package a\n\nfunc Dup() {\n\tlx.Gen(\"one\")\n}\n";
        write(dir.path(), "a/a.go", body);
        write(dir.path(), "b/b.go", &body.replace("\"one\"", "\"two\""));

        let mut targets = scan_targets(dir.path());
        targets.sort_by(|x, y| x.static_prompt.cmp(&y.static_prompt));
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].func_name, "Dup");
        assert_eq!(targets[1].func_name, "Dup");
        assert_ne!(targets[0].file, targets[1].file);
    }

    #[test]
    fn test_non_literal_prompt_uses_source_text() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.go",
            "package main\n\nfunc F() {\n\tlx.Gen(buildPrompt(name))\n}\n",
        );
        let targets = scan_targets(dir.path());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].static_prompt, "buildPrompt(name)");
    }

    #[test]
    fn test_empty_prompt_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.go",
            "package main\n\nfunc F() {\n\tlx.Gen(\"\")\n}\n",
        );
        assert!(scan_targets(dir.path()).is_empty());
    }

    #[test]
    fn test_parse_error_skips_file_not_walk() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "broken.go", "package main\n\nfunc Broken( {\n");
        write(
            dir.path(),
            "ok.go",
            "package main\n\nfunc Ok() {\n\tlx.Gen(\"fine\")\n}\n",
        );
        let targets = scan_targets(dir.path());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].func_name, "Ok");
    }
}
