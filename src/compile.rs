//! Compile Gateway adapters and the textual post-process of compiled output.
//!
//! The compiler itself is an external service. Whatever it emits is massaged
//! so it can run as the body of the sandbox function:
//!
//! - `export default X` becomes an assignment onto `exports`
//! - named exports lose the `export` keyword and are collected onto `exports`
//! - static imports of allowlisted names become `require(...)` lookups
//! - dynamic `import(...)` calls go through the injected `__hookImport`

use async_trait::async_trait;
use regex::{Captures, Regex};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use url::Url;

/// Name of the import-routing parameter injected into every module body.
pub const IMPORT_ROUTER: &str = "__hookImport";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// The compiler rejected the source; carries its diagnostic text.
    #[error("{0}")]
    Diagnostic(String),

    #[error("compile service unavailable: {0}")]
    Unavailable(String),
}

/// Turns hook source (UI-templating dialect) into executable text.
#[async_trait(?Send)]
pub trait CompileGateway {
    async fn compile(&self, source: &str, filename: &str) -> Result<String, CompileError>;
}

/// For hosts that already serve executable text.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCompiler;

#[async_trait(?Send)]
impl CompileGateway for PassthroughCompiler {
    async fn compile(&self, source: &str, _filename: &str) -> Result<String, CompileError> {
        Ok(source.to_string())
    }
}

#[derive(Serialize)]
struct CompileRequest<'a> {
    source: &'a str,
    filename: &'a str,
}

#[derive(Deserialize)]
struct CompileResponse {
    code: String,
}

/// Client for a compile service: `POST {source, filename}` -> `{code}`.
pub struct HttpCompileGateway {
    client: Client,
    endpoint: Url,
}

impl HttpCompileGateway {
    pub fn new(endpoint: Url) -> Result<Self, CompileError> {
        let client = Client::builder()
            .build()
            .map_err(|e| CompileError::Unavailable(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait(?Send)]
impl CompileGateway for HttpCompileGateway {
    async fn compile(&self, source: &str, filename: &str) -> Result<String, CompileError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&CompileRequest { source, filename })
            .send()
            .await
            .map_err(|e| CompileError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let diagnostic = response
                .text()
                .await
                .unwrap_or_else(|e| format!("unreadable diagnostic: {}", e));
            return Err(CompileError::Diagnostic(diagnostic));
        }
        if !status.is_success() {
            return Err(CompileError::Unavailable(format!("compile service answered {}", status)));
        }

        let body: CompileResponse = response
            .json()
            .await
            .map_err(|e| CompileError::Unavailable(format!("malformed compile response: {}", e)))?;
        Ok(body.code)
    }
}

static STATIC_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^([ \t]*)import\s+([^;'"]+?)\s+from\s*["']([^"']+)["'][ \t]*;?"#).unwrap()
});
static BARE_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^([ \t]*)import\s*["']([^"']+)["'][ \t]*;?"#).unwrap());
static DYNAMIC_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[^\w$.])import\s*\(").unwrap());
static DEFAULT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^([ \t]*)export\s+default\s+((?:async\s+)?function\b\s*\*?\s*([A-Za-z_$][\w$]*)?|class\b\s*([A-Za-z_$][\w$]*)?)",
    )
    .unwrap()
});
static DEFAULT_EXPR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*)export\s+default\s+").unwrap());
static NAMED_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^([ \t]*)export\s+((?:async\s+)?function\b\s*\*?\s*|class\s+|const\s+|let\s+|var\s+)([A-Za-z_$][\w$]*)",
    )
    .unwrap()
});
static DESTRUCTURED_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*)export\s+(const|let|var)(\s*[\{\[])").unwrap());
static REEXPORT_LIST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^([ \t]*)export\s*\{([^}]*)\}\s*from\s*["']([^"']+)["'][ \t]*;?"#).unwrap()
});
static EXPORT_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^([ \t]*)export\s*\{([^}]*)\}[ \t]*;?").unwrap());

/// `a as b` pairs of an import/export specifier list.
fn specifiers(list: &str) -> Vec<(String, String)> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|spec| match spec.split_once(" as ") {
            Some((local, exported)) => (local.trim().to_string(), exported.trim().to_string()),
            None => (spec.to_string(), spec.to_string()),
        })
        .collect()
}

fn import_bindings(clause: &str, module: &str) -> String {
    let require = format!("require({})", js_string(module));
    let clause = clause.trim();

    let (default, rest) = if clause.starts_with('{') || clause.starts_with('*') {
        (None, clause)
    } else {
        match clause.split_once(',') {
            Some((default, rest)) => (Some(default.trim()), rest.trim()),
            None => (Some(clause), ""),
        }
    };

    let mut statements = Vec::new();
    if let Some(name) = default {
        statements.push(format!("const {name} = {require}.default;"));
    }
    if let Some(namespace) = rest.strip_prefix('*') {
        let name = namespace.trim().trim_start_matches("as").trim();
        statements.push(format!("const {name} = {require};"));
    } else if let Some(list) = rest.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
        let pattern = specifiers(list)
            .into_iter()
            .map(|(imported, local)| {
                if imported == local {
                    local
                } else {
                    format!("{imported}: {local}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        statements.push(format!("const {{ {pattern} }} = {require};"));
    }
    statements.join(" ")
}

fn js_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{}\"", text))
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'$'
}

/// Index just past the string or template literal opening at `start`.
fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Index just past the comment opening at `start`, if there is one.
fn skip_comment(bytes: &[u8], start: usize) -> Option<usize> {
    match bytes.get(start + 1) {
        Some(b'/') => Some(
            bytes[start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |end| start + end + 1),
        ),
        Some(b'*') => Some(
            bytes[start + 2..]
                .windows(2)
                .position(|w| w == b"*/")
                .map_or(bytes.len(), |end| start + 2 + end + 2),
        ),
        _ => None,
    }
}

/// Whether the function whose head starts at `rest` uses `await` in its own
/// body. Awaits inside nested functions, arrows and methods don't count.
fn body_awaits(rest: &str) -> bool {
    let bytes = rest.as_bytes();
    let Some(params) = rest.find('(') else {
        return false;
    };

    let mut depth = 0usize;
    let mut i = params;
    let mut body = None;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' | b'`' => {
                i = skip_quoted(bytes, i);
                continue;
            }
            b'(' => depth += 1,
            b')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    body = rest[i..].find('{').map(|offset| i + offset);
                    break;
                }
            }
            _ => {}
        }
        i += 1;
    }
    let Some(start) = body else {
        return false;
    };

    // One entry per open brace: true when it opened a nested function body.
    let mut scopes: Vec<bool> = Vec::new();
    let mut nested = 0usize;
    // Paren depth at which a nested function head started.
    let mut pending: Option<usize> = None;
    let mut parens = 0usize;
    let mut i = start;
    while i < bytes.len() {
        let byte = bytes[i];
        match byte {
            b'"' | b'\'' | b'`' => {
                i = skip_quoted(bytes, i);
                continue;
            }
            b'/' => {
                if let Some(end) = skip_comment(bytes, i) {
                    i = end;
                    continue;
                }
            }
            b'(' => parens += 1,
            b')' => {
                parens = parens.saturating_sub(1);
                if pending.is_some_and(|at| parens < at) {
                    pending = None;
                }
            }
            b',' | b';' => {
                if pending.is_some_and(|at| parens <= at) {
                    pending = None;
                }
            }
            b'=' if bytes.get(i + 1) == Some(&b'>') => {
                pending = Some(parens);
                i += 2;
                continue;
            }
            b'{' => {
                let opens_function = pending.take().is_some();
                nested += usize::from(opens_function);
                scopes.push(opens_function);
            }
            b'}' => {
                if scopes.pop() == Some(true) {
                    nested -= 1;
                }
                if scopes.is_empty() {
                    return false;
                }
            }
            _ if is_ident_byte(byte) && !byte.is_ascii_digit() => {
                let word_start = i;
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                let property = word_start > 0 && bytes[word_start - 1] == b'.';
                match &rest[word_start..i] {
                    "function" | "async" if !property => pending = Some(parens),
                    "await" if !property && nested == 0 && pending.is_none() => return true,
                    _ => {}
                }
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    false
}

/// Rewrite compiled output so it evaluates as a plain function body.
pub fn rewrite_compiled(code: &str) -> String {
    let mut trailer: Vec<String> = Vec::new();

    let code = STATIC_IMPORT.replace_all(code, |caps: &Captures| {
        format!("{}{}", &caps[1], import_bindings(&caps[2], &caps[3]))
    });
    let code = BARE_IMPORT.replace_all(&code, |caps: &Captures| {
        format!("{}require({});", &caps[1], js_string(&caps[2]))
    });
    let code = DYNAMIC_IMPORT.replace_all(&code, |caps: &Captures| {
        format!("{}{}(", &caps[1], IMPORT_ROUTER)
    });

    let code = DEFAULT_DECL.replace_all(&code, |caps: &Captures| {
        // Entries are awaited by the host, so a plain function that awaits
        // becomes an async one instead of a syntax error.
        let head = &caps[2];
        let decl = if head.starts_with("function")
            && !head.contains('*')
            && body_awaits(&code[caps.get(0).map_or(0, |m| m.end())..])
        {
            format!("async {}", head)
        } else {
            head.to_string()
        };
        let name = caps.get(3).or_else(|| caps.get(4));
        match name {
            Some(name) => {
                trailer.push(format!("exports.default = {};", name.as_str()));
                format!("{}{}", &caps[1], decl)
            }
            None => format!("{}exports.default = {}", &caps[1], decl),
        }
    });
    let code = DEFAULT_EXPR.replace_all(&code, "${1}exports.default = ");

    let code = NAMED_DECL.replace_all(&code, |caps: &Captures| {
        trailer.push(format!("exports.{0} = {0};", &caps[3]));
        format!("{}{}{}", &caps[1], &caps[2], &caps[3])
    });
    let code = DESTRUCTURED_DECL.replace_all(&code, "${1}${2}${3}");

    let code = REEXPORT_LIST.replace_all(&code, |caps: &Captures| {
        let module = js_string(&caps[3]);
        let assignments = specifiers(&caps[2])
            .into_iter()
            .map(|(imported, exported)| format!("exports.{exported} = require({module}).{imported};"))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{}{}", &caps[1], assignments)
    });
    let code = EXPORT_LIST.replace_all(&code, |caps: &Captures| {
        for (local, exported) in specifiers(&caps[2]) {
            trailer.push(format!("exports.{exported} = {local};"));
        }
        caps[1].to_string()
    });

    let mut out = code.into_owned();
    if !trailer.is_empty() {
        out.push_str("\n;");
        out.push_str(&trailer.join("\n"));
        out.push('\n');
    }
    out
}
