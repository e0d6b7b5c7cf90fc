//! Radix-tree URI router
//!
//! One prefix-compressed tree per HTTP method. Static lookups walk the
//! tree comparing bytes and allocate nothing; typed placeholders
//! (`<name>`, `<int:name>`, `<path:name>`, `*`) capture byte ranges of the
//! URL into the request context. A terminal node either rewrites the
//! request (method and/or URL, from a pre-parsed destination template) or
//! runs a registered callback.
//!
//! Registration takes the writer lock and reports conflicts immediately;
//! lookups share the reader lock and never fail — an unmatched URL simply
//! falls through to the server's default handler.

use std::any::Any;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use super::context::RequestContext;
use super::request::{HttpMethod, METHOD_COUNT};

/// Callback signature of a routed endpoint. The return value is the HTTP
/// status to report; returning 0 lets the request fall through to the
/// server's default handler.
pub type RouteCallback = Arc<dyn Fn(&mut RequestContext) -> u16 + Send + Sync>;

/// Route registration error; raised at setup time, never during dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// Malformed pattern or destination template
    InvalidPattern(String),
    /// The same parameter name appears twice in one pattern
    DuplicateName(String),
    /// The `(method, pattern)` pair is already registered with a different action
    ConflictingRoute(String),
    /// A destination template references a name the pattern does not capture
    UnknownCaptureName(String),
    /// A status destination outside 200..=599
    InvalidStatus(u16),
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::InvalidPattern(p) => write!(f, "invalid route pattern: {}", p),
            RouterError::DuplicateName(n) => write!(f, "duplicate parameter name: {}", n),
            RouterError::ConflictingRoute(p) => {
                write!(f, "pattern already registered with a different action: {}", p)
            }
            RouterError::UnknownCaptureName(n) => {
                write!(f, "destination references unknown capture: {}", n)
            }
            RouterError::InvalidStatus(s) => write!(f, "status destination out of range: {}", s),
        }
    }
}

impl std::error::Error for RouterError {}

/// Typed placeholder kinds, in match-preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Anything up to the next slash (the default)
    Str,
    /// Decimal digits only, up to the next slash
    Int,
    /// The remainder of the URL, slashes included
    Path,
}

/// One literal/capture piece of a rewrite destination template
#[derive(Debug, Clone, PartialEq, Eq)]
struct TemplatePart {
    lit_off: usize,
    lit_len: usize,
    /// Index into the source pattern's capture list, or `None` for literals
    capture: Option<usize>,
}

/// Pre-parsed rewrite destination
struct RewriteRule {
    destination: String,
    method: HttpMethod,
    /// `Some` means "answer this status, do not rewrite"
    status: Option<u16>,
    static_len: usize,
    parts: Vec<TemplatePart>,
}

struct CallbackRule {
    callback: RouteCallback,
    opaque: Option<Arc<dyn Any + Send + Sync>>,
}

enum Payload {
    Empty,
    Rewrite(RewriteRule),
    Callback(CallbackRule),
}

impl Payload {
    fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }
}

struct ParamChild {
    kind: ParamKind,
    name: Arc<str>,
    node: Box<Node>,
}

/// One radix node: a compressed literal run, static children discriminated
/// by first byte, and up to one parameter child per kind.
struct Node {
    text: String,
    children: Vec<Node>,
    params: Vec<ParamChild>,
    payload: Payload,
}

impl Node {
    fn new(text: String) -> Self {
        Self { text, children: Vec::new(), params: Vec::new(), payload: Payload::Empty }
    }

    /// Descend to (or create) the node reached after consuming `lit`,
    /// splitting existing edges where the prefixes diverge.
    fn insert_literal(&mut self, lit: &str) -> &mut Node {
        if lit.is_empty() {
            return self;
        }
        let first = lit.as_bytes()[0];
        let pos = self.children.iter().position(|c| c.text.as_bytes()[0] == first);
        match pos {
            None => {
                self.children.push(Node::new(lit.to_string()));
                self.children.last_mut().expect("just pushed")
            }
            Some(i) => {
                let common = common_prefix_len(&self.children[i].text, lit);
                if common == self.children[i].text.len() {
                    self.children[i].insert_literal(&lit[common..])
                } else {
                    // Split the edge at the divergence point
                    let mut old = std::mem::replace(
                        &mut self.children[i],
                        Node::new(lit[..common].to_string()),
                    );
                    old.text = old.text[common..].to_string();
                    self.children[i].children.push(old);
                    self.children[i].insert_literal(&lit[common..])
                }
            }
        }
    }

    /// Find or create the parameter child for `kind`, checking name clashes.
    fn insert_param(&mut self, kind: ParamKind, name: &str) -> Result<&mut Node, RouterError> {
        if let Some(i) = self.params.iter().position(|p| p.kind == kind) {
            if self.params[i].name.as_ref() != name {
                return Err(RouterError::DuplicateName(format!(
                    "{} vs existing {}",
                    name, self.params[i].name
                )));
            }
            return Ok(&mut self.params[i].node);
        }
        self.params.push(ParamChild {
            kind,
            name: Arc::from(name),
            node: Box::new(Node::new(String::new())),
        });
        // Keep the match-preference order stable: Str, Int, Path
        self.params.sort_by_key(|p| match p.kind {
            ParamKind::Str => 0,
            ParamKind::Int => 1,
            ParamKind::Path => 2,
        });
        let i = self
            .params
            .iter()
            .position(|p| p.kind == kind)
            .expect("param child inserted above");
        Ok(&mut self.params[i].node)
    }

    /// Recursive descent. `pos` is the offset already consumed; captures are
    /// appended on the way down and truncated on backtrack.
    fn lookup<'n>(
        &'n self,
        url: &str,
        pos: usize,
        end: usize,
        captures: &mut Vec<(usize, usize, &'n Arc<str>)>,
    ) -> Option<&'n Payload> {
        if pos == end {
            if !self.payload.is_empty() {
                return Some(&self.payload);
            }
            // A trailing path parameter may capture the empty remainder
            for p in &self.params {
                if p.kind == ParamKind::Path {
                    captures.push((pos, 0, &p.name));
                    if let Some(hit) = p.node.lookup(url, end, end, captures) {
                        return Some(hit);
                    }
                    captures.pop();
                }
            }
            return None;
        }

        let bytes = url.as_bytes();

        // Static children first: a static path always wins over a parameter
        let first = bytes[pos];
        for child in &self.children {
            if child.text.as_bytes()[0] != first {
                continue;
            }
            let len = child.text.len();
            if pos + len <= end && &url[pos..pos + len] == child.text {
                if let Some(hit) = child.lookup(url, pos + len, end, captures) {
                    return Some(hit);
                }
            }
            break;
        }

        // Parameter children in preference order (kept sorted at insert)
        for p in &self.params {
            let seg_end = match p.kind {
                ParamKind::Path => end,
                _ => {
                    let mut e = pos;
                    while e < end && bytes[e] != b'/' {
                        e += 1;
                    }
                    e
                }
            };
            if seg_end == pos && p.kind != ParamKind::Path {
                continue;
            }
            if p.kind == ParamKind::Int && !bytes[pos..seg_end].iter().all(u8::is_ascii_digit) {
                continue;
            }
            captures.push((pos, seg_end - pos, &p.name));
            if let Some(hit) = p.node.lookup(url, seg_end, end, captures) {
                return Some(hit);
            }
            captures.pop();
        }
        None
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

/// A pattern split into literal runs and typed captures
struct ParsedPattern {
    pieces: Vec<PatternPiece>,
    names: Vec<Arc<str>>,
}

enum PatternPiece {
    Literal(String),
    Param { kind: ParamKind, name: Arc<str> },
}

fn parse_pattern(pattern: &str) -> Result<ParsedPattern, RouterError> {
    if !pattern.starts_with('/') {
        return Err(RouterError::InvalidPattern(pattern.to_string()));
    }
    let mut pieces = Vec::new();
    let mut names: Vec<Arc<str>> = Vec::new();
    let mut lit = String::new();
    let mut rest = pattern;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('*') {
            // `*` is sugar for `<path:path>`
            if !after.is_empty() {
                return Err(RouterError::InvalidPattern(pattern.to_string()));
            }
            push_param(&mut pieces, &mut names, &mut lit, ParamKind::Path, "path")?;
            rest = after;
        } else if let Some(after) = rest.strip_prefix('<') {
            let close = after
                .find('>')
                .ok_or_else(|| RouterError::InvalidPattern(pattern.to_string()))?;
            let inner = &after[..close];
            let (kind, name) = match inner.split_once(':') {
                Some(("int", n)) => (ParamKind::Int, n),
                Some(("path", n)) => (ParamKind::Path, n),
                Some(("string", n)) => (ParamKind::Str, n),
                Some(_) => return Err(RouterError::InvalidPattern(pattern.to_string())),
                None => (ParamKind::Str, inner),
            };
            if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
                return Err(RouterError::InvalidPattern(pattern.to_string()));
            }
            push_param(&mut pieces, &mut names, &mut lit, kind, name)?;
            rest = &after[close + 1..];
            if kind == ParamKind::Path && !rest.is_empty() {
                // A path capture consumes the remainder; nothing can follow
                return Err(RouterError::InvalidPattern(pattern.to_string()));
            }
        } else {
            let next = rest.find(['<', '*']).unwrap_or(rest.len());
            lit.push_str(&rest[..next]);
            rest = &rest[next..];
        }
    }
    if !lit.is_empty() {
        pieces.push(PatternPiece::Literal(lit));
    }
    Ok(ParsedPattern { pieces, names })
}

fn push_param(
    pieces: &mut Vec<PatternPiece>,
    names: &mut Vec<Arc<str>>,
    lit: &mut String,
    kind: ParamKind,
    name: &str,
) -> Result<(), RouterError> {
    if names.iter().any(|n| n.as_ref() == name) {
        return Err(RouterError::DuplicateName(name.to_string()));
    }
    if !lit.is_empty() {
        pieces.push(PatternPiece::Literal(std::mem::take(lit)));
    }
    let name: Arc<str> = Arc::from(name);
    names.push(name.clone());
    pieces.push(PatternPiece::Param { kind, name });
    Ok(())
}

/// Parse a rewrite destination: either a bare 3-digit status, or a URL
/// template whose `<name>` references resolve against the source captures.
fn parse_destination(
    destination: &str,
    names: &[Arc<str>],
) -> Result<(Option<u16>, usize, Vec<TemplatePart>), RouterError> {
    if destination.len() == 3 && destination.bytes().all(|b| b.is_ascii_digit()) {
        let status: u16 = destination.parse().expect("three digits");
        if !(200..=599).contains(&status) {
            return Err(RouterError::InvalidStatus(status));
        }
        return Ok((Some(status), 0, Vec::new()));
    }
    let mut parts = Vec::new();
    let mut static_len = 0usize;
    let mut pos = 0usize;
    let bytes = destination.as_bytes();
    while pos < bytes.len() {
        if bytes[pos] == b'<' {
            let close = destination[pos..]
                .find('>')
                .map(|c| pos + c)
                .ok_or_else(|| RouterError::InvalidPattern(destination.to_string()))?;
            let name = &destination[pos + 1..close];
            let idx = names
                .iter()
                .position(|n| n.as_ref() == name)
                .ok_or_else(|| RouterError::UnknownCaptureName(name.to_string()))?;
            parts.push(TemplatePart { lit_off: 0, lit_len: 0, capture: Some(idx) });
            pos = close + 1;
        } else {
            let start = pos;
            while pos < bytes.len() && bytes[pos] != b'<' {
                pos += 1;
            }
            parts.push(TemplatePart { lit_off: start, lit_len: pos - start, capture: None });
            static_len += pos - start;
        }
    }
    Ok((None, static_len, parts))
}

enum Action {
    Rewrite { to_method: HttpMethod, destination: String },
    Callback(CallbackRule),
}

/// The per-method routing forest
pub struct Router {
    trees: RwLock<[Option<Box<Node>>; METHOD_COUNT]>,
    counters: [AtomicU32; METHOD_COUNT],
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            trees: RwLock::new(std::array::from_fn(|_| None)),
            counters: std::array::from_fn(|_| AtomicU32::new(0)),
        }
    }

    /// Register a rewrite: requests matching `pattern` continue dispatch as
    /// `to_method destination`, with `<name>` references substituted from
    /// the pattern's captures. A 3-digit `destination` short-circuits with
    /// that status instead.
    pub fn rewrite(
        &self,
        method: HttpMethod,
        pattern: &str,
        to_method: HttpMethod,
        destination: &str,
    ) -> Result<(), RouterError> {
        self.register(method, pattern, Action::Rewrite {
            to_method,
            destination: destination.to_string(),
        })
    }

    /// Register a rewrite keeping the method unchanged.
    pub fn rewrite_same(
        &self,
        method: HttpMethod,
        pattern: &str,
        destination: &str,
    ) -> Result<(), RouterError> {
        self.rewrite(method, pattern, method, destination)
    }

    /// Register a callback for one or more methods. `opaque` is surfaced to
    /// the callback through [`RequestContext::route_opaque`].
    pub fn run(
        &self,
        methods: &[HttpMethod],
        pattern: &str,
        callback: RouteCallback,
        opaque: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<(), RouterError> {
        for method in methods {
            self.register(*method, pattern, Action::Callback(CallbackRule {
                callback: callback.clone(),
                opaque: opaque.clone(),
            }))?;
        }
        Ok(())
    }

    fn register(
        &self,
        method: HttpMethod,
        pattern: &str,
        action: Action,
    ) -> Result<(), RouterError> {
        let parsed = parse_pattern(pattern)?;
        let payload = match action {
            Action::Rewrite { to_method, destination } => {
                let (status, static_len, parts) = parse_destination(&destination, &parsed.names)?;
                Payload::Rewrite(RewriteRule { destination, method: to_method, status, static_len, parts })
            }
            Action::Callback(rule) => Payload::Callback(rule),
        };

        let mut trees = self.trees.write().expect("router lock poisoned");
        let root = trees[method.index()].get_or_insert_with(|| Box::new(Node::new(String::new())));
        let mut node: &mut Node = root;
        for piece in &parsed.pieces {
            node = match piece {
                PatternPiece::Literal(lit) => node.insert_literal(lit),
                PatternPiece::Param { kind, name } => node.insert_param(*kind, name)?,
            };
        }
        if node.payload.is_empty() {
            node.payload = payload;
            self.counters[method.index()].fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let idempotent = match (&node.payload, &payload) {
            (Payload::Rewrite(old), Payload::Rewrite(new)) => {
                old.destination == new.destination
                    && old.method == new.method
                    && old.status == new.status
            }
            (Payload::Callback(old), Payload::Callback(new)) => {
                Arc::ptr_eq(&old.callback, &new.callback)
            }
            _ => false,
        };
        if idempotent {
            Ok(())
        } else {
            Err(RouterError::ConflictingRoute(pattern.to_string()))
        }
    }

    /// Routes registered for one method
    pub fn route_count(&self, method: HttpMethod) -> u32 {
        self.counters[method.index()].load(Ordering::Relaxed)
    }

    /// Routes registered across all methods
    pub fn total_routes(&self) -> u32 {
        self.counters.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Match `ctx.url` against the tree of `ctx.method`.
    ///
    /// Returns 0 when nothing matched (continue to the default handler), a
    /// status when a callback ran or a status-rewrite fired, or 0 after a
    /// URL/method rewrite mutated the context in place.
    pub fn process(&self, ctx: &mut RequestContext) -> u16 {
        if ctx.query_offset.is_none() {
            ctx.query_offset = ctx.url.find('?');
        }
        let end = ctx.query_offset.unwrap_or(ctx.url.len());

        let trees = self.trees.read().expect("router lock poisoned");
        let Some(root) = trees[ctx.method.index()].as_deref() else {
            return 0;
        };

        let mut captures: Vec<(usize, usize, &Arc<str>)> = Vec::new();
        // The context cannot be borrowed mutably while the match borrows its
        // URL, so resolve against a detached view first.
        let url = std::mem::take(&mut ctx.url);
        let hit = root.lookup(&url, 0, end, &mut captures);

        match hit {
            None => {
                ctx.url = url;
                0
            }
            Some(Payload::Callback(rule)) => {
                let committed: Vec<(usize, usize, Arc<str>)> =
                    captures.iter().map(|(o, l, n)| (*o, *l, (*n).clone())).collect();
                ctx.url = url;
                ctx.clear_captures();
                for (off, len, name) in committed {
                    ctx.push_capture(off, len, name);
                }
                ctx.set_route_opaque(rule.opaque.clone());
                let callback = rule.callback.clone();
                drop(trees);
                callback(ctx)
            }
            Some(Payload::Rewrite(rule)) => {
                if let Some(status) = rule.status {
                    ctx.url = url;
                    return status;
                }
                let captured_len: usize = captures.iter().map(|(_, l, _)| *l).sum();
                let query = &url[end..];
                let mut rewritten =
                    String::with_capacity(rule.static_len + captured_len + query.len());
                for part in &rule.parts {
                    match part.capture {
                        Some(idx) => {
                            let (off, len, _) = captures[idx];
                            rewritten.push_str(&url[off..off + len]);
                        }
                        None => rewritten
                            .push_str(&rule.destination[part.lit_off..part.lit_off + part.lit_len]),
                    }
                }
                rewritten.push_str(query);
                ctx.method = rule.method;
                ctx.url = rewritten;
                ctx.query_offset = ctx.url.find('?');
                // The old capture offsets point into the pre-rewrite URL
                ctx.clear_captures();
                0
            }
            Some(Payload::Empty) => {
                ctx.url = url;
                0
            }
        }
    }
}
