//! Canonical paths and link values for CommonTools documents.
//!
//! A [`Path`] is a sequence of JSON-Pointer tokens (RFC 6901 escaping:
//! `~0` for `~`, `~1` for `/`). [`child`] is pure append, [`Path::is_ancestor`]
//! is a prefix compare. Links serialize exclusively as
//! `{"/": {"link@1": {"id": .., "path": [..]}}}` (see [`Link`]).

mod ids;
mod link;
mod token;

pub use ids::{Entity, Space};
pub use link::Link;
pub use token::Token;

/// An owned sequence of [`Token`]s rooted at some entity.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PathBuf(Vec<Token>);

impl PathBuf {
    /// An empty path (the document root).
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Builds a path from a slice of tokens.
    pub fn from_tokens(tokens: &[Token]) -> Self {
        Self(tokens.to_vec())
    }

    /// Returns the tokens making up this path.
    pub fn tokens(&self) -> &[Token] {
        &self.0
    }

    /// Returns a borrowed view.
    pub fn as_path(&self) -> Path<'_> {
        Path(&self.0)
    }

    /// Appends one token, returning the extended path.
    pub fn child(&self, seg: Token) -> Self {
        let mut tokens = self.0.clone();
        tokens.push(seg);
        Self(tokens)
    }

    /// Appends a whole path's tokens.
    pub fn extend(&mut self, other: Path<'_>) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Removes the last token, if any.
    pub fn pop(&mut self) -> Option<Token> {
        self.0.pop()
    }

    /// Parses a JSON-Pointer string (`"/a/0/b"`, `""` for root) into a path.
    pub fn from_json_pointer(ptr: &str) -> Self {
        if ptr.is_empty() {
            return Self::root();
        }
        let ptr = ptr.strip_prefix('/').unwrap_or(ptr);
        if ptr.is_empty() {
            return Self::root();
        }
        let tokens = ptr
            .split('/')
            .map(|raw| Token::from_escaped(raw))
            .collect();
        Self(tokens)
    }

    /// Renders this path as a JSON-Pointer string.
    pub fn to_json_pointer(&self) -> String {
        self.as_path().to_json_pointer()
    }
}

impl std::fmt::Display for PathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json_pointer())
    }
}

impl FromIterator<Token> for PathBuf {
    fn from_iter<I: IntoIterator<Item = Token>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A borrowed view over a [`PathBuf`]'s tokens.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Path<'a>(&'a [Token]);

impl<'a> Path<'a> {
    /// Wraps a token slice.
    pub fn new(tokens: &'a [Token]) -> Self {
        Self(tokens)
    }

    /// True for the document root.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the tokens.
    pub fn tokens(&self) -> &'a [Token] {
        self.0
    }

    /// Returns an owned copy.
    pub fn to_owned(&self) -> PathBuf {
        PathBuf(self.0.to_vec())
    }

    /// True iff `self` is a prefix of (or equal to) `other`.
    pub fn is_ancestor(&self, other: Path<'_>) -> bool {
        self.0.len() <= other.0.len() && self.0 == &other.0[..self.0.len()]
    }

    /// Path with the first token removed.
    pub fn child(&self) -> Option<Path<'a>> {
        if self.0.is_empty() {
            None
        } else {
            Some(Path(&self.0[1..]))
        }
    }

    /// Path with the last token removed.
    pub fn parent(&self) -> Option<Path<'a>> {
        if self.0.is_empty() {
            None
        } else {
            Some(Path(&self.0[..self.0.len() - 1]))
        }
    }

    /// The first token.
    pub fn first(&self) -> Option<&'a Token> {
        self.0.first()
    }

    /// The last token.
    pub fn last(&self) -> Option<&'a Token> {
        self.0.last()
    }

    /// Returns the suffix of `self` relative to `base`, if `base` is an
    /// ancestor of `self`.
    pub fn strip_prefix(&self, base: Path<'_>) -> Option<PathBuf> {
        if base.is_ancestor(*self) {
            Some(PathBuf(self.0[base.0.len()..].to_vec()))
        } else {
            None
        }
    }

    /// A stable content hash for this path, useful as a map key for
    /// provenance indices.
    pub fn digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        for tok in self.0 {
            tok.hash_into(&mut hasher);
        }
        hasher.finalize()
    }

    /// Renders this path as a JSON-Pointer string.
    pub fn to_json_pointer(&self) -> String {
        let mut out = String::new();
        for tok in self.0 {
            out.push('/');
            tok.push_escaped(&mut out);
        }
        out
    }
}

impl<'a> IntoIterator for Path<'a> {
    type Item = &'a Token;
    type IntoIter = std::slice::Iter<'a, Token>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<'a> std::fmt::Display for Path<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json_pointer())
    }
}
