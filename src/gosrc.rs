//! Tree-sitter helpers for reading Go source structure.
//!
//! Every stage that touches Go code goes through this module: the scanner
//! and instrumenter walk function bodies for marker calls, the runner reads
//! package clauses, and the synthesizer needs exact body byte offsets for
//! splicing.

use anyhow::{anyhow, bail, Result};
use tree_sitter::{Node, Parser, Tree};

/// Parse Go source. A tree whose root contains error nodes is rejected so
/// later byte-offset edits never operate on mis-read structure.
pub fn parse(src: &str) -> Result<Tree> {
    let tree = parse_lenient(src)?;
    if tree.root_node().has_error() {
        bail!("source contains syntax errors");
    }
    Ok(tree)
}

/// Parse without rejecting error nodes. Used where only coarse structure
/// matters, like reading a package clause out of a possibly broken file.
pub fn parse_lenient(src: &str) -> Result<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_go::LANGUAGE.into())
        .map_err(|e| anyhow!("failed to load Go grammar: {e}"))?;
    parser
        .parse(src, None)
        .ok_or_else(|| anyhow!("parser returned no tree"))
}

pub fn text<'s>(node: Node, src: &'s str) -> &'s str {
    &src[node.byte_range()]
}

/// Pre-order traversal over every node in the subtree.
pub fn walk<'t>(node: Node<'t>, f: &mut dyn FnMut(Node<'t>)) {
    f(node);
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, f);
    }
}

/// A function or method declaration with the byte geometry the pipeline
/// needs: the body block for probing/splicing and the positionally
/// expanded declared result types.
pub struct GoFunction<'t> {
    pub name: String,
    pub node: Node<'t>,
    pub body: Node<'t>,
    pub results: Vec<String>,
}

impl GoFunction<'_> {
    pub fn is_void(&self) -> bool {
        self.results.is_empty()
    }

    /// Byte offset of the body's opening brace.
    pub fn body_start(&self) -> usize {
        self.body.start_byte()
    }

    /// Byte offset just past the body's closing brace.
    pub fn body_end(&self) -> usize {
        self.body.end_byte()
    }

    /// The declaration's source with the body detached.
    pub fn signature<'s>(&self, src: &'s str) -> &'s str {
        src[self.node.start_byte()..self.body.start_byte()].trim_end()
    }
}

/// Every function and method declaration with a body, in source order.
pub fn functions<'t>(root: Node<'t>, src: &str) -> Vec<GoFunction<'t>> {
    let mut out = Vec::new();
    walk(root, &mut |node| {
        if node.kind() != "function_declaration" && node.kind() != "method_declaration" {
            return;
        }
        let Some(name) = node.child_by_field_name("name") else {
            return;
        };
        let Some(body) = node.child_by_field_name("body") else {
            return;
        };
        out.push(GoFunction {
            name: text(name, src).to_string(),
            node,
            body,
            results: result_types(node, src),
        });
    });
    out
}

pub fn find_function<'t>(root: Node<'t>, src: &str, name: &str) -> Option<GoFunction<'t>> {
    functions(root, src).into_iter().find(|f| f.name == name)
}

/// Declared result types, one entry per returned value. A grouped
/// declaration like `(a, b int)` contributes its type once per name.
fn result_types(node: Node, src: &str) -> Vec<String> {
    let Some(result) = node.child_by_field_name("result") else {
        return Vec::new();
    };
    if result.kind() != "parameter_list" {
        return vec![text(result, src).to_string()];
    }
    let mut out = Vec::new();
    let mut cursor = result.walk();
    for decl in result.named_children(&mut cursor) {
        if decl.kind() != "parameter_declaration" {
            continue;
        }
        let Some(ty) = decl.child_by_field_name("type") else {
            continue;
        };
        let ty = text(ty, src).to_string();
        let mut names = decl.walk();
        let count = decl.children_by_field_name("name", &mut names).count();
        for _ in 0..count.max(1) {
            out.push(ty.clone());
        }
    }
    out
}

fn is_lx_selector(node: Node, src: &str, method: &str) -> bool {
    if node.kind() != "selector_expression" {
        return false;
    }
    let Some(operand) = node.child_by_field_name("operand") else {
        return false;
    };
    let Some(field) = node.child_by_field_name("field") else {
        return false;
    };
    operand.kind() == "identifier" && text(operand, src) == "lx" && text(field, src) == method
}

/// A call of the synthesis marker `lx.Gen(...)`.
pub fn is_gen_call(node: Node, src: &str) -> bool {
    node.kind() == "call_expression"
        && node
            .child_by_field_name("function")
            .map(|f| is_lx_selector(f, src, "Gen"))
            .unwrap_or(false)
}

/// A return expression already wrapped by a typed probe, either inferred
/// `lx.Spy(...)` or instantiated `lx.Spy[T](...)`.
pub fn is_spy_wrapped(node: Node, src: &str) -> bool {
    if node.kind() != "call_expression" {
        return false;
    }
    let Some(f) = node.child_by_field_name("function") else {
        return false;
    };
    match f.kind() {
        "selector_expression" => is_lx_selector(f, src, "Spy"),
        "index_expression" => f
            .child_by_field_name("operand")
            .map(|o| is_lx_selector(o, src, "Spy"))
            .unwrap_or(false),
        _ => false,
    }
}

pub fn body_calls_gen(body: Node, src: &str) -> bool {
    let mut found = false;
    walk(body, &mut |node| {
        if !found && is_gen_call(node, src) {
            found = true;
        }
    });
    found
}

/// Named arguments of a call, comments excluded.
pub fn call_arguments<'t>(call: Node<'t>) -> Vec<Node<'t>> {
    let Some(args) = call.child_by_field_name("arguments") else {
        return Vec::new();
    };
    let mut cursor = args.walk();
    args.named_children(&mut cursor)
        .filter(|c| c.kind() != "comment")
        .collect()
}

/// Result expressions of a `return` statement, empty for a bare return.
pub fn return_expressions<'t>(ret: Node<'t>) -> Vec<Node<'t>> {
    let mut cursor = ret.walk();
    let Some(list) = ret
        .named_children(&mut cursor)
        .find(|c| c.kind() == "expression_list")
    else {
        return Vec::new();
    };
    let mut inner = list.walk();
    list.named_children(&mut inner)
        .filter(|c| c.kind() != "comment")
        .collect()
}

/// Name from the file's package clause, if present.
pub fn package_name(root: Node, src: &str) -> Option<String> {
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        if child.kind() != "package_clause" {
            continue;
        }
        let mut inner = child.walk();
        for part in child.named_children(&mut inner) {
            if part.kind() == "package_identifier" {
                return Some(text(part, src).to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"package main

import "example.com/lx"

func Double(n int) int {
	lx.Gen("double n")
	return 0
}

func Pair() (s string, err error) {
	return "x", nil
}

func Grouped() (a, b int) {
	return 1, 2
}

func Quiet() {
	println("nothing here")
}
"#;

    #[test]
    fn test_functions_and_results() {
        let tree = parse(SAMPLE).unwrap();
        let funcs = functions(tree.root_node(), SAMPLE);
        let names: Vec<&str> = funcs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["Double", "Pair", "Grouped", "Quiet"]);

        assert_eq!(funcs[0].results, ["int"]);
        assert_eq!(funcs[1].results, ["string", "error"]);
        assert_eq!(funcs[2].results, ["int", "int"]);
        assert!(funcs[3].is_void());
    }

    #[test]
    fn test_signature_slice() {
        let tree = parse(SAMPLE).unwrap();
        let f = find_function(tree.root_node(), SAMPLE, "Double").unwrap();
        assert_eq!(f.signature(SAMPLE), "func Double(n int) int");
    }

    #[test]
    fn test_body_offsets_cover_braces() {
        let tree = parse(SAMPLE).unwrap();
        let f = find_function(tree.root_node(), SAMPLE, "Quiet").unwrap();
        assert_eq!(&SAMPLE[f.body_start()..f.body_start() + 1], "{");
        assert_eq!(&SAMPLE[f.body_end() - 1..f.body_end()], "}");
    }

    #[test]
    fn test_gen_call_detection() {
        let tree = parse(SAMPLE).unwrap();
        let funcs = functions(tree.root_node(), SAMPLE);
        assert!(body_calls_gen(funcs[0].body, SAMPLE));
        assert!(!body_calls_gen(funcs[3].body, SAMPLE));
    }

    #[test]
    fn test_spy_wrapped_detection() {
        let src = r#"package main

func F() int {
	return lx.Spy[int]("F", compute())
}

func G() int {
	return lx.Spy("G", compute())
}

func H() int {
	return compute()
}
"#;
        let tree = parse(src).unwrap();
        let funcs = functions(tree.root_node(), src);
        for (i, wrapped) in [(0, true), (1, true), (2, false)] {
            let exprs: Vec<_> = {
                let mut out = Vec::new();
                walk(funcs[i].body, &mut |n| {
                    if n.kind() == "return_statement" {
                        out.extend(return_expressions(n));
                    }
                });
                out
            };
            assert_eq!(exprs.len(), 1, "function {i}");
            assert_eq!(is_spy_wrapped(exprs[0], src), wrapped, "function {i}");
        }
    }

    #[test]
    fn test_package_name() {
        let tree = parse("package widgets\n").unwrap();
        assert_eq!(
            package_name(tree.root_node(), "package widgets\n").as_deref(),
            Some("widgets")
        );
    }

    #[test]
    fn test_parse_rejects_broken_source() {
        assert!(parse("package main\n\nfunc Broken( {").is_err());
    }
}
