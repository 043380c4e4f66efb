//! Source identity: canonical source keys, client/server path mapping and
//! the registry of synthetic (not-on-disk) sources.
//!
//! Breakpoint matching needs one canonical form per source: front-ends send
//! paths in user terms, the interpreter reports its own chunk names. Both
//! sides funnel through [`PathConvert`] before any comparison.

use serde::Deserialize;
use std::fmt;

/// Canonical identifier of a source file or synthetic chunk.
///
/// Keys are slash-separated, absolutized, `.`/`..`-free and lowercased on
/// case-insensitive platforms. Synthetic chunks get `<source:N>` keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A source as resolved by the adapter: its canonical key plus a reference
/// id when the front-end must fetch the text by id instead of path.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub key: SourceKey,
    pub source_reference: Option<i64>,
}

/// One `(from → to)` prefix-mapping rule from the launch configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceMapRule(pub String, pub String);

#[derive(Debug, Default)]
pub struct PathConvert {
    /// Interpreter-side prefix (normalized) to client prefix (raw).
    server_to_client: Vec<(String, String)>,
    /// Client prefix (normalized) to interpreter-side prefix (raw).
    client_to_server: Vec<(String, String)>,
    /// Skip-files globs, normalized like keys.
    skip: Vec<String>,
    /// Synthetic chunk registry: `chunks[i]` owns reference id `i + 1`.
    chunks: Vec<String>,
}

impl PathConvert {
    /// Build from the resolved source-map table and skip list of the launch
    /// configuration. Rule order is by prefix length, longest first, so the
    /// most specific mapping wins.
    pub fn new(rules: &[SourceMapRule], skip_files: &[String]) -> Self {
        let mut convert = PathConvert::default();
        for SourceMapRule(server, client) in rules {
            convert
                .server_to_client
                .push((norm_prefix(server), client.clone()));
            convert
                .client_to_server
                .push((norm_prefix(client), server.clone()));
        }
        convert
            .server_to_client
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        convert
            .client_to_server
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        convert.skip = skip_files.iter().map(|g| normalize_path(g)).collect();
        convert
    }

    /// Canonical key for a path sent by the front-end.
    pub fn client_to_server(&self, path: &str) -> SourceKey {
        let mapped = apply_map(path, &self.client_to_server);
        SourceKey(normalize_path(&mapped))
    }

    /// Client-facing path for a key produced by the adapter.
    pub fn server_to_client(&self, key: &SourceKey) -> String {
        apply_map(key.as_str(), &self.server_to_client)
    }

    /// Resolve an interpreter-reported chunk name.
    ///
    /// `@path` chunks are on-disk sources; `=name` chunks and raw code
    /// chunks are synthetic and get a positive source reference so the
    /// front-end can fetch their text by id.
    pub fn resolve_chunk(&mut self, chunk: &str) -> ResolvedSource {
        if let Some(path) = chunk.strip_prefix('@') {
            return ResolvedSource {
                key: SourceKey(normalize_path(path)),
                source_reference: None,
            };
        }

        let reference = self.intern_chunk(chunk);
        let key = match chunk.strip_prefix('=') {
            // `=name` is a display name, not a path.
            Some(name) => SourceKey(name.to_string()),
            None => SourceKey(format!("<source:{reference}>")),
        };
        ResolvedSource {
            key,
            source_reference: Some(reference),
        }
    }

    /// Original chunk name behind a source reference id.
    pub fn chunk_by_reference(&self, reference: i64) -> Option<&str> {
        let idx = usize::try_from(reference.checked_sub(1)?).ok()?;
        self.chunks.get(idx).map(String::as_str)
    }

    /// True when the key matches a skip-files glob: such sources never stop.
    pub fn is_skipped(&self, key: &SourceKey) -> bool {
        self.skip.iter().any(|glob| glob_match(glob, key.as_str()))
    }

    fn intern_chunk(&mut self, chunk: &str) -> i64 {
        if let Some(idx) = self.chunks.iter().position(|c| c == chunk) {
            return idx as i64 + 1;
        }
        self.chunks.push(chunk.to_string());
        self.chunks.len() as i64
    }
}

fn apply_map(path: &str, mapping: &[(String, String)]) -> String {
    let normalized = normalize_path(path);
    for (from, to) in mapping {
        if let Some(suffix) = normalized.strip_prefix(from.as_str()) {
            let mut out = to.trim_end_matches(['/', '\\']).to_string();
            if !suffix.is_empty() {
                out.push('/');
                out.push_str(suffix);
            }
            return out;
        }
    }
    path.to_string()
}

fn norm_prefix(s: &str) -> String {
    let mut out = normalize_path(s);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

/// Reduce a path to the canonical form: forward slashes, no `.`/`..`
/// components, no trailing slash, absolute, lowercased on case-insensitive
/// platforms.
pub fn normalize_path(path: &str) -> String {
    let mut path = path.replace('\\', "/");
    if cfg!(windows) {
        path = path.to_lowercase();
    }

    let absolute = path.starts_with('/') || has_drive_prefix(&path);
    let keep_relative = !absolute && looks_relative_glob(&path);

    let mut components: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if matches!(components.last(), Some(&last) if last != "..") {
                    components.pop();
                } else if !absolute {
                    components.push("..");
                }
            }
            other => components.push(other),
        }
    }

    let joined = components.join("/");
    if absolute {
        if has_drive_prefix(&path) {
            joined
        } else {
            format!("/{joined}")
        }
    } else if keep_relative {
        joined
    } else {
        // Front-ends normally send absolute paths; a relative one is
        // resolved against the host working directory.
        match std::env::current_dir() {
            Ok(cwd) => normalize_path(&format!("{}/{joined}", cwd.display())),
            Err(_) => joined,
        }
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let mut chars = path.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(c), Some(':')) if c.is_ascii_alphabetic()
    )
}

/// Globs and synthetic names must not be absolutized.
fn looks_relative_glob(path: &str) -> bool {
    path.contains(['*', '?']) || path.starts_with('<')
}

/// Minimal glob matcher for skip-files patterns: `*` matches any run of
/// characters (including `/`), `?` matches one character.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    // Iterative backtracking over the last `*`.
    let (mut p, mut t) = (0usize, 0usize);
    let (mut star, mut star_t) = (None::<usize>, 0usize);
    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            star_t = t;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_t += 1;
            t = star_t;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
