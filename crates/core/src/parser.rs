//! Parser capability.
//!
//! Per-language source parsing is explicitly a pluggable capability, not a
//! requirement to reimplement every language's grammar. `Parser` is the
//! capability trait; a small registry ships a handful of heuristic
//! (line/regex scanning) extractors good enough to produce symbols and
//! relations for the languages exercised by the end-to-end scenarios.
//! Anything beyond that is a plugin surface, not a gap.

use crate::models::{RelationKind, Relation, Symbol, SymbolKind};
use regex::Regex;
use std::sync::OnceLock;

pub trait Parser: Send + Sync {
    fn extensions(&self) -> &'static [&'static str];
    fn extract(&self, root_id: &str, rel_path: &str, text: &str) -> (Vec<Symbol>, Vec<Relation>);
}

pub struct ParserRegistry {
    parsers: Vec<Box<dyn Parser>>,
}

impl ParserRegistry {
    pub fn with_builtins() -> Self {
        ParserRegistry {
            parsers: vec![
                Box::new(RustHeuristicParser),
                Box::new(PythonHeuristicParser),
                Box::new(JavaScriptHeuristicParser),
                Box::new(GoHeuristicParser),
            ],
        }
    }

    pub fn for_extension(&self, ext: &str) -> Option<&dyn Parser> {
        self.parsers
            .iter()
            .find(|p| p.extensions().contains(&ext))
            .map(|b| b.as_ref())
    }
}

fn qualname(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

fn make_symbol(root_id: &str, path: &str, name: &str, kind: SymbolKind, line: u32, parent: &str, content: &str) -> Symbol {
    let qn = qualname(parent, name);
    Symbol {
        symbol_id: Symbol::compute_id(path, kind, &qn),
        root_id: root_id.to_string(),
        path: path.to_string(),
        name: name.to_string(),
        kind,
        start_line: line,
        end_line: line,
        content: content.to_string(),
        parent_qualname: parent.to_string(),
        qualname: qn,
        docstring: String::new(),
        importance: 0.0,
        metadata_json: "{}".to_string(),
    }
}

fn make_import_relation(root_id: &str, path: &str, target: &str, line: u32) -> Relation {
    Relation {
        from_root_id: root_id.to_string(),
        from_path: path.to_string(),
        from_symbol: String::new(),
        from_symbol_id: String::new(),
        to_root_id: root_id.to_string(),
        to_path: target.to_string(),
        to_symbol: String::new(),
        to_symbol_id: String::new(),
        kind: RelationKind::Imports,
        call_site_line: line,
        metadata_json: "{}".to_string(),
    }
}

macro_rules! regex_cell {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static CELL: OnceLock<Regex> = OnceLock::new();
            CELL.get_or_init(|| Regex::new($pat).unwrap())
        }
    };
}

// --- Rust ---------------------------------------------------------------

regex_cell!(rust_fn_re, r"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:async\s+)?fn\s+([A-Za-z_][A-Za-z0-9_]*)");
regex_cell!(rust_struct_re, r"^\s*(?:pub(?:\([^)]*\))?\s+)?struct\s+([A-Za-z_][A-Za-z0-9_]*)");
regex_cell!(rust_enum_re, r"^\s*(?:pub(?:\([^)]*\))?\s+)?enum\s+([A-Za-z_][A-Za-z0-9_]*)");
regex_cell!(rust_trait_re, r"^\s*(?:pub(?:\([^)]*\))?\s+)?trait\s+([A-Za-z_][A-Za-z0-9_]*)");
regex_cell!(rust_impl_re, r"^\s*impl(?:<[^>]*>)?\s+(?:([A-Za-z_][A-Za-z0-9_:]*)\s+for\s+)?([A-Za-z_][A-Za-z0-9_:]*)");
regex_cell!(rust_use_re, r"^\s*use\s+([A-Za-z_][A-Za-z0-9_:]*)");

struct RustHeuristicParser;
impl Parser for RustHeuristicParser {
    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn extract(&self, root_id: &str, rel_path: &str, text: &str) -> (Vec<Symbol>, Vec<Relation>) {
        let mut symbols = Vec::new();
        let mut relations = Vec::new();
        let mut current_impl = String::new();

        for (idx, line) in text.lines().enumerate() {
            let lineno = idx as u32 + 1;
            if let Some(c) = rust_impl_re().captures(line) {
                let trait_name = c.get(1).map(|m| m.as_str().to_string());
                let target = c.get(2).unwrap().as_str().to_string();
                current_impl = target.clone();
                if let Some(trait_name) = trait_name {
                    symbols.push(make_symbol(root_id, rel_path, &target, SymbolKind::Class, lineno, "", line.trim()));
                    relations.push(Relation {
                        from_root_id: root_id.to_string(),
                        from_path: rel_path.to_string(),
                        from_symbol: target,
                        from_symbol_id: String::new(),
                        to_root_id: root_id.to_string(),
                        to_path: rel_path.to_string(),
                        to_symbol: trait_name,
                        to_symbol_id: String::new(),
                        kind: RelationKind::Implements,
                        call_site_line: lineno,
                        metadata_json: "{}".to_string(),
                    });
                }
            } else if let Some(c) = rust_fn_re().captures(line) {
                let name = c.get(1).unwrap().as_str();
                let kind = if current_impl.is_empty() { SymbolKind::Function } else { SymbolKind::Method };
                symbols.push(make_symbol(root_id, rel_path, name, kind, lineno, &current_impl, line.trim()));
            } else if let Some(c) = rust_struct_re().captures(line) {
                symbols.push(make_symbol(root_id, rel_path, c.get(1).unwrap().as_str(), SymbolKind::Class, lineno, "", line.trim()));
            } else if let Some(c) = rust_enum_re().captures(line) {
                symbols.push(make_symbol(root_id, rel_path, c.get(1).unwrap().as_str(), SymbolKind::Class, lineno, "", line.trim()));
            } else if let Some(c) = rust_trait_re().captures(line) {
                symbols.push(make_symbol(root_id, rel_path, c.get(1).unwrap().as_str(), SymbolKind::Interface, lineno, "", line.trim()));
            } else if let Some(c) = rust_use_re().captures(line) {
                relations.push(make_import_relation(root_id, rel_path, c.get(1).unwrap().as_str(), lineno));
            }
            if line.trim() == "}" {
                current_impl.clear();
            }
        }
        (symbols, relations)
    }
}

// --- Python ---------------------------------------------------------------

regex_cell!(py_def_re, r"^(\s*)def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(");
regex_cell!(py_class_re, r"^(\s*)class\s+([A-Za-z_][A-Za-z0-9_]*)\s*(?:\(([^)]*)\))?:");
regex_cell!(py_import_re, r"^\s*(?:from\s+([A-Za-z_][A-Za-z0-9_.]*)\s+import|import\s+([A-Za-z_][A-Za-z0-9_.]*))");

struct PythonHeuristicParser;
impl Parser for PythonHeuristicParser {
    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn extract(&self, root_id: &str, rel_path: &str, text: &str) -> (Vec<Symbol>, Vec<Relation>) {
        let mut symbols = Vec::new();
        let mut relations = Vec::new();
        // stack of (indent, qualname)
        let mut stack: Vec<(usize, String)> = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let lineno = idx as u32 + 1;
            if line.trim().is_empty() {
                continue;
            }
            let indent = line.len() - line.trim_start().len();
            while stack.last().map(|(i, _)| indent <= *i).unwrap_or(false) {
                stack.pop();
            }
            let parent = stack.last().map(|(_, q)| q.clone()).unwrap_or_default();

            if let Some(c) = py_class_re().captures(line) {
                let name = c.get(2).unwrap().as_str();
                let sym = make_symbol(root_id, rel_path, name, SymbolKind::Class, lineno, &parent, line.trim());
                let qn = sym.qualname.clone();
                symbols.push(sym);
                if let Some(bases) = c.get(3) {
                    for base in bases.as_str().split(',') {
                        let base = base.trim();
                        if !base.is_empty() {
                            relations.push(Relation {
                                from_root_id: root_id.to_string(),
                                from_path: rel_path.to_string(),
                                from_symbol: name.to_string(),
                                from_symbol_id: String::new(),
                                to_root_id: root_id.to_string(),
                                to_path: rel_path.to_string(),
                                to_symbol: base.to_string(),
                                to_symbol_id: String::new(),
                                kind: RelationKind::Extends,
                                call_site_line: lineno,
                                metadata_json: "{}".to_string(),
                            });
                        }
                    }
                }
                stack.push((indent, qn));
            } else if let Some(c) = py_def_re().captures(line) {
                let name = c.get(2).unwrap().as_str();
                let kind = if parent.is_empty() { SymbolKind::Function } else { SymbolKind::Method };
                let sym = make_symbol(root_id, rel_path, name, kind, lineno, &parent, line.trim());
                let qn = sym.qualname.clone();
                symbols.push(sym);
                stack.push((indent, qn));
            } else if let Some(c) = py_import_re().captures(line) {
                let target = c.get(1).or_else(|| c.get(2)).unwrap().as_str();
                relations.push(make_import_relation(root_id, rel_path, target, lineno));
            }
        }
        (symbols, relations)
    }
}

// --- JavaScript / TypeScript ---------------------------------------------

regex_cell!(js_fn_re, r"^\s*(?:export\s+)?(?:async\s+)?function\s+([A-Za-z_$][A-Za-z0-9_$]*)");
regex_cell!(js_class_re, r"^\s*(?:export\s+)?class\s+([A-Za-z_$][A-Za-z0-9_$]*)(?:\s+extends\s+([A-Za-z_$][A-Za-z0-9_$.]*))?");
regex_cell!(js_method_re, r"^\s{2,}(?:async\s+)?([A-Za-z_$][A-Za-z0-9_$]*)\s*\([^)]*\)\s*\{");
regex_cell!(js_import_re, r#"^\s*import\s+.*from\s+['"]([^'"]+)['"]"#);

struct JavaScriptHeuristicParser;
impl Parser for JavaScriptHeuristicParser {
    fn extensions(&self) -> &'static [&'static str] {
        &["js", "jsx", "ts", "tsx", "mjs", "cjs"]
    }

    fn extract(&self, root_id: &str, rel_path: &str, text: &str) -> (Vec<Symbol>, Vec<Relation>) {
        let mut symbols = Vec::new();
        let mut relations = Vec::new();
        let mut current_class = String::new();

        for (idx, line) in text.lines().enumerate() {
            let lineno = idx as u32 + 1;
            if let Some(c) = js_class_re().captures(line) {
                let name = c.get(1).unwrap().as_str();
                current_class = name.to_string();
                symbols.push(make_symbol(root_id, rel_path, name, SymbolKind::Class, lineno, "", line.trim()));
                if let Some(base) = c.get(2) {
                    relations.push(Relation {
                        from_root_id: root_id.to_string(),
                        from_path: rel_path.to_string(),
                        from_symbol: name.to_string(),
                        from_symbol_id: String::new(),
                        to_root_id: root_id.to_string(),
                        to_path: rel_path.to_string(),
                        to_symbol: base.as_str().to_string(),
                        to_symbol_id: String::new(),
                        kind: RelationKind::Extends,
                        call_site_line: lineno,
                        metadata_json: "{}".to_string(),
                    });
                }
            } else if let Some(c) = js_fn_re().captures(line) {
                symbols.push(make_symbol(root_id, rel_path, c.get(1).unwrap().as_str(), SymbolKind::Function, lineno, "", line.trim()));
            } else if !current_class.is_empty() {
                if let Some(c) = js_method_re().captures(line) {
                    let name = c.get(1).unwrap().as_str();
                    if !["if", "for", "while", "switch", "catch"].contains(&name) {
                        symbols.push(make_symbol(root_id, rel_path, name, SymbolKind::Method, lineno, &current_class, line.trim()));
                    }
                }
            }
            if let Some(c) = js_import_re().captures(line) {
                relations.push(make_import_relation(root_id, rel_path, c.get(1).unwrap().as_str(), lineno));
            }
            if line.trim() == "}" {
                current_class.clear();
            }
        }
        (symbols, relations)
    }
}

// --- Go ---------------------------------------------------------------

regex_cell!(go_func_re, r"^func\s+(?:\(([^)]*)\)\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*\(");
regex_cell!(go_type_re, r"^type\s+([A-Za-z_][A-Za-z0-9_]*)\s+(struct|interface)\b");
regex_cell!(go_import_re, r#"^\s*"([^"]+)""#);

struct GoHeuristicParser;
impl Parser for GoHeuristicParser {
    fn extensions(&self) -> &'static [&'static str] {
        &["go"]
    }

    fn extract(&self, root_id: &str, rel_path: &str, text: &str) -> (Vec<Symbol>, Vec<Relation>) {
        let mut symbols = Vec::new();
        let mut relations = Vec::new();
        let mut in_import_block = false;

        for (idx, line) in text.lines().enumerate() {
            let lineno = idx as u32 + 1;
            let trimmed = line.trim();
            if trimmed == "import (" {
                in_import_block = true;
                continue;
            }
            if in_import_block {
                if trimmed == ")" {
                    in_import_block = false;
                } else if let Some(c) = go_import_re().captures(trimmed) {
                    relations.push(make_import_relation(root_id, rel_path, c.get(1).unwrap().as_str(), lineno));
                }
                continue;
            }
            if let Some(c) = go_type_re().captures(line) {
                let name = c.get(1).unwrap().as_str();
                let kind = if c.get(2).unwrap().as_str() == "interface" { SymbolKind::Interface } else { SymbolKind::Class };
                symbols.push(make_symbol(root_id, rel_path, name, kind, lineno, "", line.trim()));
            } else if let Some(c) = go_func_re().captures(line) {
                let name = c.get(2).unwrap().as_str();
                let receiver = c.get(1).map(|m| m.as_str()).unwrap_or("");
                let parent = receiver
                    .split_whitespace()
                    .last()
                    .unwrap_or("")
                    .trim_start_matches('*')
                    .to_string();
                let kind = if parent.is_empty() { SymbolKind::Function } else { SymbolKind::Method };
                symbols.push(make_symbol(root_id, rel_path, name, kind, lineno, &parent, line.trim()));
            }
        }
        (symbols, relations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rust_parser_finds_function() {
        let parser = RustHeuristicParser;
        let (symbols, _) = parser.extract("root", "src/main.rs", "fn hello() {\n    println!(\"world\");\n}\n");
        assert_eq!(symbols.len(), 1);
        assert_eq!(symbols[0].name, "hello");
        assert_eq!(symbols[0].kind, SymbolKind::Function);
    }

    #[test]
    fn python_parser_finds_method_under_class() {
        let parser = PythonHeuristicParser;
        let src = "class Greeter:\n    def hello(self):\n        print('world')\n";
        let (symbols, _) = parser.extract("root", "src/main.py", src);
        assert_eq!(symbols.len(), 2);
        let method = symbols.iter().find(|s| s.name == "hello").unwrap();
        assert_eq!(method.kind, SymbolKind::Method);
        assert_eq!(method.qualname, "Greeter.hello");
    }

    #[test]
    fn symbol_ids_are_stable_for_same_inputs() {
        let a = Symbol::compute_id("p.rs", SymbolKind::Function, "foo");
        let b = Symbol::compute_id("p.rs", SymbolKind::Function, "foo");
        assert_eq!(a, b);
    }
}
