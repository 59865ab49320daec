//! Pre-execution validation of one Python snippet: syntax surface checks,
//! dependency extraction, undefined-name detection against the notebook
//! context, a light lint pass, and per-library API anti-pattern rules.
//!
//! The server does not embed a Python interpreter, so the analysis is a
//! line-oriented surface scan; anything it cannot prove is left for the
//! post-execution verifier to catch.

use std::collections::{BTreeSet, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use shared_types::{
    DependencyInfo, IssueCategory, IssueSeverity, NotebookContext, ValidationIssue,
    ValidationResult,
};

static BUILTIN_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "True", "False", "None", "print", "len", "range", "str", "int", "float", "list", "dict",
        "set", "tuple", "bool", "type", "object", "super", "open", "input", "sorted", "reversed",
        "enumerate", "zip", "map", "filter", "sum", "min", "max", "abs", "round", "pow", "divmod",
        "isinstance", "issubclass", "hasattr", "getattr", "setattr", "delattr", "callable",
        "iter", "next", "id", "hash", "repr", "ascii", "bin", "hex", "oct", "ord", "chr",
        "format", "vars", "dir", "help", "locals", "globals", "staticmethod", "classmethod",
        "property", "slice", "frozenset", "bytes", "bytearray", "memoryview", "complex", "any",
        "all", "exec", "eval", "compile", "Exception", "BaseException", "ValueError", "TypeError",
        "KeyError", "IndexError", "AttributeError", "ImportError", "ModuleNotFoundError",
        "RuntimeError", "StopIteration", "GeneratorExit", "AssertionError",
        "NotImplementedError", "FileNotFoundError", "OSError", "ZeroDivisionError",
        "UnicodeDecodeError", "KeyboardInterrupt", "__name__", "__file__", "__doc__",
        "__package__",
        // Jupyter / IPython ambient names.
        "In", "Out", "get_ipython", "display",
    ])
});

/// Aliases so common in data-science notebooks that flagging them would be
/// pure noise, whether or not this snippet imports them.
static COMMON_LIBRARY_NAMES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "pd", "np", "dd", "da", "xr", "plt", "sns", "px", "go", "fig", "ax", "tf", "torch", "sk",
        "nn", "F", "optim", "scipy", "cv2", "PIL", "Image", "requests", "json", "os", "sys", "re",
        "datetime", "time", "math", "random", "collections", "itertools", "functools", "tqdm",
        "glob", "Path", "pickle", "csv", "io", "logging", "warnings", "gc", "subprocess",
        "shutil", "pathlib", "typing", "copy", "multiprocessing",
    ])
});

static PYTHON_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
        "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
        "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
        "try", "while", "with", "yield", "match", "case", "self",
    ])
});

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*import\s+(.+)$").expect("import regex"));
static FROM_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*from\s+([\w.]+)\s+import\s+(.+)$").expect("from-import regex"));
static DEF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(([^)]*)").expect("def regex")
});
static CLASS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*class\s+([A-Za-z_]\w*)").expect("class regex"));
static ASSIGN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(.+?)\s*=(?:[^=]|$)").expect("assign regex"));
static ANN_ASSIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([A-Za-z_]\w*)\s*:\s*[^=]+=(?:[^=]|$)").expect("annotated assign regex")
});
static FOR_TARGET_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bfor\s+(.+?)\s+in\s").expect("for target regex"));
static AS_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bas\s+([A-Za-z_]\w*)").expect("as name regex"));
static WALRUS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z_]\w*)\s*:=").expect("walrus regex"));
static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("identifier regex"));
static BLOCK_HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:async\s+)?(def|class|if|elif|else|for|while|try|except|finally|with)\b")
        .expect("block header regex")
});
static BARE_IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_]\w*$").expect("bare identifier regex"));

static PLOT_CALL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"plt\.(plot|bar|barh|hist|scatter|imshow|pie|boxplot)\b").expect("plot call regex"));

/// One source line with string contents blanked and comments removed.
struct StrippedLine {
    code: String,
    /// Bracket nesting depth at the start of the line.
    depth_before: i32,
    /// Bracket nesting depth at the end of the line.
    depth_after: i32,
}

struct StripOutcome {
    lines: Vec<StrippedLine>,
    issues: Vec<ValidationIssue>,
}

pub struct CodeValidator {
    known_names: HashSet<String>,
}

impl CodeValidator {
    pub fn new(notebook_context: &NotebookContext) -> Self {
        let mut known_names: HashSet<String> = BUILTIN_NAMES.iter().map(|s| s.to_string()).collect();
        known_names.extend(COMMON_LIBRARY_NAMES.iter().map(|s| s.to_string()));
        known_names.extend(notebook_context.defined_variables.iter().cloned());
        known_names.extend(notebook_context.imported_libraries.iter().cloned());
        Self { known_names }
    }

    /// Shell (`!`) and magic (`%`) lines are replaced with a no-op so the
    /// rest of the body scans as plain Python.
    fn preprocess_magics(code: &str) -> String {
        code.lines()
            .map(|line| {
                let stripped = line.trim_start();
                if stripped.starts_with('!') || stripped.starts_with('%') {
                    let indent = line.len() - stripped.len();
                    format!("{}pass", " ".repeat(indent))
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Blank out string contents and comments, tracking bracket depth and
    /// reporting unterminated strings and unbalanced brackets.
    fn strip_sources(code: &str) -> StripOutcome {
        let mut issues = Vec::new();
        let mut lines = Vec::new();

        let mut triple_quote: Option<char> = None;
        let mut bracket_stack: Vec<(char, u32)> = Vec::new();

        for (idx, raw_line) in code.lines().enumerate() {
            let line_no = (idx as u32) + 1;
            let depth_before = bracket_stack.len() as i32;
            let mut out = String::with_capacity(raw_line.len());

            let chars: Vec<char> = raw_line.chars().collect();
            let mut i = 0;
            let mut single_quote: Option<char> = None;

            while i < chars.len() {
                let c = chars[i];

                if let Some(q) = triple_quote {
                    if c == q && chars.get(i + 1) == Some(&q) && chars.get(i + 2) == Some(&q) {
                        triple_quote = None;
                        i += 3;
                    } else {
                        i += 1;
                    }
                    continue;
                }

                if let Some(q) = single_quote {
                    if c == '\\' {
                        i += 2;
                    } else if c == q {
                        single_quote = None;
                        out.push('"');
                        i += 1;
                    } else {
                        i += 1;
                    }
                    continue;
                }

                match c {
                    '#' => break,
                    '\'' | '"' => {
                        if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                            triple_quote = Some(c);
                            i += 3;
                        } else {
                            single_quote = Some(c);
                            out.push('"');
                            i += 1;
                        }
                    }
                    '(' | '[' | '{' => {
                        bracket_stack.push((c, line_no));
                        out.push(c);
                        i += 1;
                    }
                    ')' | ']' | '}' => {
                        let expected = match c {
                            ')' => '(',
                            ']' => '[',
                            _ => '{',
                        };
                        match bracket_stack.pop() {
                            Some((open, _)) if open == expected => {}
                            _ => {
                                issues.push(ValidationIssue {
                                    severity: IssueSeverity::Error,
                                    category: IssueCategory::Syntax,
                                    message: format!("unmatched '{c}'"),
                                    line: Some(line_no),
                                    column: Some(i as u32 + 1),
                                    code_snippet: Some(raw_line.trim().to_string()),
                                });
                            }
                        }
                        out.push(c);
                        i += 1;
                    }
                    _ => {
                        out.push(c);
                        i += 1;
                    }
                }
            }

            if single_quote.is_some() && !raw_line.trim_end().ends_with('\\') {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Error,
                    category: IssueCategory::Syntax,
                    message: "unterminated string literal".to_string(),
                    line: Some(line_no),
                    column: None,
                    code_snippet: Some(raw_line.trim().to_string()),
                });
            }

            let in_triple = triple_quote.is_some();
            lines.push(StrippedLine {
                code: if in_triple { String::new() } else { out },
                depth_before,
                depth_after: bracket_stack.len() as i32,
            });
        }

        if triple_quote.is_some() {
            issues.push(ValidationIssue {
                severity: IssueSeverity::Error,
                category: IssueCategory::Syntax,
                message: "unterminated triple-quoted string".to_string(),
                line: Some(code.lines().count() as u32),
                column: None,
                code_snippet: None,
            });
        }

        if let Some((open, line)) = bracket_stack.first() {
            issues.push(ValidationIssue {
                severity: IssueSeverity::Error,
                category: IssueCategory::Syntax,
                message: format!("'{open}' was never closed"),
                line: Some(*line),
                column: None,
                code_snippet: None,
            });
        }

        StripOutcome { lines, issues }
    }

    /// Surface-level syntax check. Any error aborts the deeper passes.
    pub fn validate_syntax(&self, code: &str) -> ValidationResult {
        let processed = Self::preprocess_magics(code);
        let outcome = Self::strip_sources(&processed);
        let mut issues = outcome.issues;

        // A block header forming a complete statement must end with ':'.
        for (idx, line) in outcome.lines.iter().enumerate() {
            let trimmed = line.code.trim_end();
            if trimmed.is_empty() || line.depth_before > 0 || line.depth_after > 0 {
                continue;
            }
            if trimmed.ends_with('\\') {
                continue;
            }
            if BLOCK_HEADER_RE.is_match(trimmed) && !trimmed.ends_with(':') {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Error,
                    category: IssueCategory::Syntax,
                    message: "expected ':' at end of block header".to_string(),
                    line: Some(idx as u32 + 1),
                    column: None,
                    code_snippet: Some(trimmed.trim().to_string()),
                });
            }
        }

        let has_errors = issues.iter().any(|i| i.severity == IssueSeverity::Error);
        ValidationResult {
            is_valid: !has_errors,
            has_errors,
            has_warnings: false,
            summary: if has_errors {
                format!("found {} syntax errors", issues.len())
            } else {
                "no syntax errors".to_string()
            },
            issues,
            dependencies: None,
        }
    }

    /// Collect imports, definitions and uses from the snippet.
    pub fn analyze_dependencies(&self, code: &str) -> DependencyInfo {
        let processed = Self::preprocess_magics(code);
        let outcome = Self::strip_sources(&processed);

        let mut deps = DependencyInfo::default();
        let mut defined: BTreeSet<String> = BTreeSet::new();
        let mut used: BTreeSet<String> = BTreeSet::new();

        for line in &outcome.lines {
            let code_line = line.code.as_str();
            if code_line.trim().is_empty() {
                continue;
            }

            if let Some(caps) = FROM_IMPORT_RE.captures(code_line) {
                let module = caps[1].to_string();
                let mut names = Vec::new();
                for part in caps[2].split(',') {
                    let part = part.trim().trim_start_matches('(').trim_end_matches(')').trim();
                    if part.is_empty() || part == "*" {
                        continue;
                    }
                    let name = match part.split_once(" as ") {
                        Some((_, alias)) => alias.trim(),
                        None => part,
                    };
                    if BARE_IDENT_RE.is_match(name) {
                        names.push(name.to_string());
                        defined.insert(name.to_string());
                    }
                }
                deps.from_imports.insert(module, names);
                continue;
            }

            if let Some(caps) = IMPORT_RE.captures(code_line) {
                for part in caps[1].split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    match part.split_once(" as ") {
                        Some((module, alias)) => {
                            let alias = alias.trim();
                            deps.imports.push(alias.to_string());
                            defined.insert(alias.to_string());
                        }
                        None => {
                            deps.imports.push(part.to_string());
                            let root = part.split('.').next().unwrap_or(part);
                            defined.insert(root.to_string());
                        }
                    }
                }
                continue;
            }

            if let Some(caps) = DEF_RE.captures(code_line) {
                defined.insert(caps[1].to_string());
                for param in caps[2].split(',') {
                    let name = param
                        .split([':', '='])
                        .next()
                        .unwrap_or("")
                        .trim()
                        .trim_start_matches('*');
                    if BARE_IDENT_RE.is_match(name) {
                        defined.insert(name.to_string());
                    }
                }
            } else if let Some(caps) = CLASS_RE.captures(code_line) {
                defined.insert(caps[1].to_string());
            } else if let Some(caps) = ANN_ASSIGN_RE.captures(code_line) {
                defined.insert(caps[1].to_string());
            } else if line.depth_before == 0 {
                if let Some(caps) = ASSIGN_RE.captures(code_line) {
                    let lhs = caps[1].trim();
                    let first_word = lhs.split_whitespace().next().unwrap_or("");
                    let keyword_context = PYTHON_KEYWORDS.contains(first_word);
                    let operator_tail = lhs
                        .chars()
                        .last()
                        .map(|c| "+-*/%&|^<>!:=".contains(c))
                        .unwrap_or(true);
                    if !keyword_context && !operator_tail {
                        for piece in lhs.split(',') {
                            let name = piece
                                .trim()
                                .trim_start_matches(['(', '[', '*'])
                                .trim_end_matches([')', ']'])
                                .trim();
                            if BARE_IDENT_RE.is_match(name) {
                                defined.insert(name.to_string());
                            }
                        }
                    }
                }
            }

            for caps in FOR_TARGET_RE.captures_iter(code_line) {
                for piece in caps[1].split(',') {
                    let name = piece
                        .trim()
                        .trim_start_matches(['(', '['])
                        .trim_end_matches([')', ']'])
                        .trim();
                    if BARE_IDENT_RE.is_match(name) {
                        defined.insert(name.to_string());
                    }
                }
            }
            for caps in AS_NAME_RE.captures_iter(code_line) {
                defined.insert(caps[1].to_string());
            }
            for caps in WALRUS_RE.captures_iter(code_line) {
                defined.insert(caps[1].to_string());
            }
        }

        // Used names: every identifier in load position.
        for line in &outcome.lines {
            let code_line = line.code.as_str();
            if IMPORT_RE.is_match(code_line) || FROM_IMPORT_RE.is_match(code_line) {
                continue;
            }
            let bytes = code_line.as_bytes();
            for m in IDENT_RE.find_iter(code_line) {
                let name = m.as_str();
                if PYTHON_KEYWORDS.contains(name) {
                    continue;
                }

                let prev = code_line[..m.start()]
                    .chars()
                    .rev()
                    .find(|c| !c.is_whitespace());
                if prev == Some('.') {
                    continue;
                }

                // `name=` (not `name==`) is a binding or keyword argument,
                // not a load.
                let mut rest = m.end();
                while rest < bytes.len() && bytes[rest] == b' ' {
                    rest += 1;
                }
                if rest < bytes.len() && bytes[rest] == b'=' && bytes.get(rest + 1) != Some(&b'=') {
                    continue;
                }

                used.insert(name.to_string());
            }
        }

        deps.defined_names = defined.into_iter().collect();
        deps.used_names = used.into_iter().collect();
        deps
    }

    fn attribute_roots(code: &str) -> BTreeSet<String> {
        let mut roots = BTreeSet::new();
        for line in code.lines() {
            let bytes = line.as_bytes();
            for m in IDENT_RE.find_iter(line) {
                if bytes.get(m.end()) == Some(&b'.') && !PYTHON_KEYWORDS.contains(m.as_str()) {
                    roots.insert(m.as_str().to_string());
                }
            }
        }
        roots
    }

    fn first_use_lines(code: &str) -> HashMap<String, u32> {
        let mut lines = HashMap::new();
        for (idx, line) in code.lines().enumerate() {
            for m in IDENT_RE.find_iter(line) {
                lines
                    .entry(m.as_str().to_string())
                    .or_insert(idx as u32 + 1);
            }
        }
        lines
    }

    /// Flag used names that nothing defines. A name seen only as the root of
    /// an attribute access may be a pending import, so it downgrades to a
    /// warning.
    pub fn check_undefined_names(&self, code: &str) -> Vec<ValidationIssue> {
        let processed = Self::preprocess_magics(code);
        let deps = self.analyze_dependencies(&processed);
        let defined: HashSet<&String> = deps.defined_names.iter().collect();
        let roots = Self::attribute_roots(&processed);
        let use_lines = Self::first_use_lines(&processed);

        let mut issues = Vec::new();
        let mut seen: HashSet<&String> = HashSet::new();

        for name in &deps.used_names {
            if name.starts_with('_')
                || defined.contains(name)
                || self.known_names.contains(name)
                || !seen.insert(name)
            {
                continue;
            }

            let line = use_lines.get(name).copied();
            if roots.contains(name) {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Warning,
                    category: IssueCategory::UndefinedName,
                    message: format!("'{name}' is not defined (may need an import)"),
                    line,
                    column: None,
                    code_snippet: None,
                });
            } else {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Error,
                    category: IssueCategory::UndefinedName,
                    message: format!("'{name}' is not defined"),
                    line,
                    column: None,
                    code_snippet: None,
                });
            }
        }

        issues
    }

    /// Unused imports, unused variables, and redefinitions.
    fn lint_issues(&self, code: &str, deps: &DependencyInfo) -> Vec<ValidationIssue> {
        let processed = Self::preprocess_magics(code);
        let used: HashSet<&String> = deps.used_names.iter().collect();
        let use_lines = Self::first_use_lines(&processed);
        let mut issues = Vec::new();

        let mut import_roots: Vec<String> = Vec::new();
        for import in &deps.imports {
            let root = import.split('.').next().unwrap_or(import).to_string();
            import_roots.push(root);
        }
        for names in deps.from_imports.values() {
            import_roots.extend(names.iter().cloned());
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for root in &import_roots {
            *counts.entry(root.as_str()).or_insert(0) += 1;
        }

        for (root, count) in &counts {
            let owned = root.to_string();
            if !used.contains(&owned) {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Warning,
                    category: IssueCategory::UnusedImport,
                    message: format!("'{root}' imported but unused"),
                    line: use_lines.get(*root).copied(),
                    column: None,
                    code_snippet: None,
                });
            }
            if *count > 1 {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Warning,
                    category: IssueCategory::Redefined,
                    message: format!("redefinition of '{root}'"),
                    line: use_lines.get(*root).copied(),
                    column: None,
                    code_snippet: None,
                });
            }
        }

        let import_set: HashSet<&str> = import_roots.iter().map(String::as_str).collect();
        for name in &deps.defined_names {
            if name.starts_with('_') || import_set.contains(name.as_str()) {
                continue;
            }
            if !used.contains(name) {
                issues.push(ValidationIssue {
                    severity: IssueSeverity::Info,
                    category: IssueCategory::UnusedVariable,
                    message: format!("'{name}' assigned to but never used"),
                    line: use_lines.get(name).copied(),
                    column: None,
                    code_snippet: None,
                });
            }
        }

        issues
    }

    /// Library-specific anti-pattern rules for the detected guide set.
    pub fn api_pattern_issues(code: &str, libraries: &[String]) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for library in libraries {
            match library.as_str() {
                "dask" => {
                    let plots = code.contains("plt.") || code.contains(".plot(");
                    if code.contains("dd.") && plots && !code.contains(".compute(") {
                        issues.push(ValidationIssue {
                            severity: IssueSeverity::Warning,
                            category: IssueCategory::TypeError,
                            message:
                                "dask dataframe is plotted without .compute(); materialize first"
                                    .to_string(),
                            line: None,
                            column: None,
                            code_snippet: None,
                        });
                    }
                }
                "polars" => {
                    if code.contains("scan_") && !code.contains(".collect(") {
                        issues.push(ValidationIssue {
                            severity: IssueSeverity::Warning,
                            category: IssueCategory::TypeError,
                            message: "polars LazyFrame is never collected; call .collect()"
                                .to_string(),
                            line: None,
                            column: None,
                            code_snippet: None,
                        });
                    }
                }
                "matplotlib" => {
                    if PLOT_CALL_RE.is_match(code) && !code.contains("plt.show(") {
                        issues.push(ValidationIssue {
                            severity: IssueSeverity::Warning,
                            category: IssueCategory::TypeError,
                            message: "figure is drawn but plt.show() is never called".to_string(),
                            line: None,
                            column: None,
                            code_snippet: None,
                        });
                    }
                }
                _ => {}
            }
        }

        issues
    }

    /// The full pass: syntax, dependencies, undefined names, lint, and API
    /// patterns, with message-level dedup.
    pub fn full_validation(&self, code: &str, detected_libraries: &[String]) -> ValidationResult {
        let syntax = self.validate_syntax(code);
        if syntax.has_errors {
            let count = syntax.issues.len();
            return ValidationResult {
                summary: format!("validation aborted on syntax errors: {count}"),
                ..syntax
            };
        }

        let mut issues = syntax.issues;
        let mut deps = self.analyze_dependencies(code);

        issues.extend(self.check_undefined_names(code));

        let mut seen_messages: HashSet<String> = issues.iter().map(|i| i.message.clone()).collect();
        for issue in self.lint_issues(code, &deps) {
            if seen_messages.insert(issue.message.clone()) {
                issues.push(issue);
            }
        }
        for issue in Self::api_pattern_issues(code, detected_libraries) {
            if seen_messages.insert(issue.message.clone()) {
                issues.push(issue);
            }
        }

        deps.undefined_names = issues
            .iter()
            .filter(|i| i.category == IssueCategory::UndefinedName)
            .filter_map(|i| {
                i.message
                    .split('\'')
                    .nth(1)
                    .map(str::to_string)
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let has_errors = issues.iter().any(|i| i.severity == IssueSeverity::Error);
        let has_warnings = issues.iter().any(|i| i.severity == IssueSeverity::Warning);
        let error_count = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .count();
        let warning_count = issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .count();

        let summary = if has_errors {
            format!("validation failed: {error_count} errors, {warning_count} warnings")
        } else if has_warnings {
            format!("validation passed ({warning_count} warnings)")
        } else {
            "validation passed".to_string()
        };

        ValidationResult {
            is_valid: !has_errors,
            issues,
            dependencies: Some(deps),
            has_errors,
            has_warnings,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> CodeValidator {
        CodeValidator::new(&NotebookContext::default())
    }

    fn validator_with_context(vars: &[&str], libs: &[&str]) -> CodeValidator {
        let ctx = NotebookContext {
            defined_variables: vars.iter().map(|s| s.to_string()).collect(),
            imported_libraries: libs.iter().map(|s| s.to_string()).collect(),
            ..NotebookContext::default()
        };
        CodeValidator::new(&ctx)
    }

    #[test]
    fn shell_and_magic_lines_are_neutralized() {
        let result = validator().full_validation("!pip install dask\n%matplotlib inline", &[]);
        assert!(result.is_valid, "{:?}", result.issues);
    }

    #[test]
    fn clean_code_passes() {
        let code = "import pandas as pd\ndf = pd.read_csv('x.csv')\nprint(df.shape)";
        let result = validator().full_validation(code, &[]);
        assert!(result.is_valid);
        assert!(!result.has_errors);
    }

    #[test]
    fn unbalanced_bracket_is_a_syntax_error() {
        let result = validator().validate_syntax("x = (1 + 2");
        assert!(result.has_errors);
        assert_eq!(result.issues[0].category, IssueCategory::Syntax);
    }

    #[test]
    fn unmatched_closer_is_a_syntax_error() {
        let result = validator().validate_syntax("x = 1)");
        assert!(result.has_errors);
    }

    #[test]
    fn unterminated_string_is_a_syntax_error() {
        let result = validator().validate_syntax("name = 'unclosed");
        assert!(result.has_errors);
        assert!(result.issues[0].message.contains("unterminated"));
    }

    #[test]
    fn block_header_without_colon_is_flagged() {
        let result = validator().validate_syntax("for i in range(3)\n    print(i)");
        assert!(result.has_errors);
        assert!(result.issues[0].message.contains("':'"));
    }

    #[test]
    fn multiline_call_is_not_a_missing_colon() {
        let code = "result = func(\n    a,\n    b,\n)";
        let result = validator().validate_syntax(code);
        assert!(result.is_valid, "{:?}", result.issues);
    }

    #[test]
    fn syntax_error_aborts_deeper_checks() {
        let result = validator().full_validation("x = (1\nundefined_name_here", &[]);
        assert!(result.has_errors);
        assert!(result.summary.contains("aborted"));
        assert!(result.dependencies.is_none());
    }

    #[test]
    fn dependency_extraction_covers_python_binding_forms() {
        let code = "\
import dask.dataframe as dd
from pathlib import Path as P
x, y = 1, 2
total: int = 0
for i, row in enumerate(rows):
    pass
with open('f.txt') as fh:
    pass
try:
    pass
except ValueError as err:
    pass
squares = [n * n for n in range(10)]
";
        let deps = validator().analyze_dependencies(code);
        for name in ["dd", "P", "x", "y", "total", "i", "row", "fh", "err", "n", "squares"] {
            assert!(
                deps.defined_names.contains(&name.to_string()),
                "missing {name} in {:?}",
                deps.defined_names
            );
        }
        assert_eq!(deps.from_imports["pathlib"], vec!["P"]);
    }

    #[test]
    fn undefined_name_is_an_error() {
        let issues = validator().check_undefined_names("print(mystery_value)");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Error);
        assert_eq!(issues[0].category, IssueCategory::UndefinedName);
    }

    #[test]
    fn attribute_root_downgrades_to_warning() {
        // `somelib.load()` may just be missing its import.
        let issues = validator().check_undefined_names("data = somelib.load('x')");
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, IssueSeverity::Warning);
    }

    #[test]
    fn notebook_context_names_are_known() {
        let v = validator_with_context(&["df"], &["dask"]);
        let issues = v.check_undefined_names("print(df.shape)\ndask.compute()");
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn common_aliases_are_never_flagged() {
        let issues = validator().check_undefined_names("plt.plot(np.arange(10))");
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn unused_import_is_a_warning() {
        let result = validator().full_validation("import json\nprint('hi')", &[]);
        assert!(result.is_valid);
        assert!(result
            .issues
            .iter()
            .any(|i| i.category == IssueCategory::UnusedImport));
    }

    #[test]
    fn duplicate_import_is_a_redefinition() {
        let code = "import io\nimport io\nprint(io.StringIO())";
        let result = validator().full_validation(code, &[]);
        assert!(result
            .issues
            .iter()
            .any(|i| i.category == IssueCategory::Redefined));
    }

    #[test]
    fn dask_plot_without_compute_is_flagged() {
        let code = "df = dd.read_csv('x.csv')\ndf['age'].plot()";
        let issues = CodeValidator::api_pattern_issues(code, &["dask".to_string()]);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].message.contains(".compute()"));
    }

    #[test]
    fn dask_plot_with_compute_passes() {
        let code = "df = dd.read_csv('x.csv')\ndf['age'].compute().plot()";
        let issues = CodeValidator::api_pattern_issues(code, &["dask".to_string()]);
        assert!(issues.is_empty());
    }

    #[test]
    fn polars_scan_without_collect_is_flagged() {
        let code = "lf = pl.scan_csv('x.csv')\nprint(lf.head())";
        let issues = CodeValidator::api_pattern_issues(code, &["polars".to_string()]);
        assert_eq!(issues.len(), 1);
    }

    #[test]
    fn kwargs_are_not_counted_as_uses() {
        // `encoding` is a keyword argument, not a name load.
        let issues = validator().check_undefined_names("df = pd.read_csv('x', encoding='utf-8')");
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn string_contents_are_ignored() {
        let issues = validator().check_undefined_names("print('mystery_value and more')");
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn comment_contents_are_ignored() {
        let issues = validator().check_undefined_names("x = 1  # mystery_value here\nprint(x)");
        assert!(issues.is_empty(), "{issues:?}");
    }
}
