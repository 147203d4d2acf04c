//! Hierarchical paths and their mapping onto backend keys.
//!
//! Two types keep the two address spaces apart:
//! - [`FsPath`]: the absolute, normalized path a guest sees (`/docs/a.txt`)
//! - backend keys: plain strings produced by [`KeyMapper`] (`docs/a.txt`,
//!   or `docs/` for the directory marker of `/docs`)
//!
//! Mapping is pure and holds no state besides the configured root prefix,
//! so every key can be turned back into the path that produced it.

use std::fmt;

use crate::error::{FsError, FsResult};

/// Separator used by both paths and object keys.
pub const SEPARATOR: char = '/';

/// Absolute path within the exported namespace.
///
/// Always starts with `/`, never ends with `/` (except the root itself) and
/// never contains empty, `.` or `..` components.
///
/// # Examples
///
/// ```
/// use bucketfs_core::path::FsPath;
///
/// let docs = FsPath::parse("/docs//reports/").unwrap();
/// assert_eq!(docs.as_str(), "/docs/reports");
///
/// let file = docs.join("q1.txt").unwrap();
/// assert_eq!(file.as_str(), "/docs/reports/q1.txt");
/// assert_eq!(file.parent().unwrap(), docs);
/// assert_eq!(file.name(), Some("q1.txt"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsPath(String);

impl FsPath {
    /// The root path `/`.
    #[inline]
    pub fn root() -> Self {
        FsPath(String::from("/"))
    }

    /// Parses and normalizes a path string.
    ///
    /// Leading, trailing and repeated separators are collapsed. A missing
    /// leading `/` is tolerated. `.` and `..` components are rejected.
    pub fn parse(path: &str) -> FsResult<Self> {
        let mut normalized = String::with_capacity(path.len() + 1);
        for component in path.split(SEPARATOR).filter(|c| !c.is_empty()) {
            validate_name(component)?;
            normalized.push(SEPARATOR);
            normalized.push_str(component);
        }
        if normalized.is_empty() {
            return Ok(Self::root());
        }
        Ok(FsPath(normalized))
    }

    /// Resolves `name` inside this directory path.
    pub fn join(&self, name: &str) -> FsResult<Self> {
        validate_name(name)?;
        let mut joined = String::with_capacity(self.0.len() + name.len() + 1);
        joined.push_str(self.0.trim_end_matches(SEPARATOR));
        joined.push(SEPARATOR);
        joined.push_str(name);
        Ok(FsPath(joined))
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parent directory, `None` for the root.
    pub fn parent(&self) -> Option<FsPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(FsPath(self.0[..idx].to_string())),
        }
    }

    /// Final component, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit(SEPARATOR).next()
    }

    /// Path components from the root down.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|c| !c.is_empty())
    }

    /// Whether `self` equals `ancestor` or lies underneath it.
    pub fn starts_with(&self, ancestor: &FsPath) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self.0 == ancestor.0
            || (self.0.starts_with(&ancestor.0)
                && self.0.as_bytes().get(ancestor.0.len()) == Some(&b'/'))
    }

    /// Re-roots `self` from `from` onto `to`.
    ///
    /// Returns `None` when `self` is not `from` or a descendant of it.
    ///
    /// ```
    /// use bucketfs_core::path::FsPath;
    ///
    /// let p = FsPath::parse("/a/b/c.txt").unwrap();
    /// let moved = p
    ///     .rebase(&FsPath::parse("/a").unwrap(), &FsPath::parse("/z").unwrap())
    ///     .unwrap();
    /// assert_eq!(moved.as_str(), "/z/b/c.txt");
    /// ```
    pub fn rebase(&self, from: &FsPath, to: &FsPath) -> Option<FsPath> {
        if !self.starts_with(from) {
            return None;
        }
        let rest = if from.is_root() {
            &self.0[1..]
        } else {
            self.0[from.0.len()..].trim_start_matches(SEPARATOR)
        };
        if rest.is_empty() {
            return Some(to.clone());
        }
        let mut out = to.0.trim_end_matches(SEPARATOR).to_string();
        out.push(SEPARATOR);
        out.push_str(rest);
        Some(FsPath(out))
    }
}

impl AsRef<str> for FsPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves a child name against a parent path.
pub fn resolve(parent: &FsPath, name: &str) -> FsResult<FsPath> {
    parent.join(name)
}

/// Checks that `name` is a single usable path component.
pub fn validate_name(name: &str) -> FsResult<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::InvalidArgument(format!("invalid name {name:?}")));
    }
    if name.contains(SEPARATOR) || name.contains('\0') {
        return Err(FsError::InvalidArgument(format!(
            "name {name:?} contains a separator or NUL"
        )));
    }
    Ok(())
}

/// Maps [`FsPath`]s onto backend keys under an optional root prefix.
///
/// Files map to `prefix + relative path`; directories additionally carry a
/// trailing `/`, which is also the key of their zero-byte marker object.
///
/// ```
/// use bucketfs_core::path::{FsPath, KeyMapper};
///
/// let mapper = KeyMapper::new("exports/vm1");
/// let p = FsPath::parse("/a/b").unwrap();
/// assert_eq!(mapper.to_backend_key(&p, false), "exports/vm1/a/b");
/// assert_eq!(mapper.to_backend_key(&p, true), "exports/vm1/a/b/");
/// assert_eq!(mapper.from_backend_key("exports/vm1/a/b/"), Some((p, true)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMapper {
    /// Empty, or a prefix ending in `/`.
    prefix: String,
}

impl KeyMapper {
    /// Creates a mapper rooted at `root_dir` (`""` or `"/"` for the whole backend).
    pub fn new(root_dir: &str) -> Self {
        let trimmed: Vec<&str> = root_dir.split(SEPARATOR).filter(|c| !c.is_empty()).collect();
        if trimmed.is_empty() {
            return Self::default();
        }
        let mut prefix = trimmed.join("/");
        prefix.push(SEPARATOR);
        Self { prefix }
    }

    /// The root prefix, empty or ending in `/`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of `path`, shaped as a directory marker when `as_dir` is set.
    ///
    /// The root always maps to the prefix (a directory key).
    pub fn to_backend_key(&self, path: &FsPath, as_dir: bool) -> String {
        if path.is_root() {
            return self.prefix.clone();
        }
        let relative = &path.as_str()[1..];
        let mut key = String::with_capacity(self.prefix.len() + relative.len() + 1);
        key.push_str(&self.prefix);
        key.push_str(relative);
        if as_dir {
            key.push(SEPARATOR);
        }
        key
    }

    /// Inverse of [`to_backend_key`](Self::to_backend_key).
    ///
    /// Returns the path and whether the key is directory-shaped, or `None`
    /// for keys outside the prefix or with components no path can have.
    pub fn from_backend_key(&self, key: &str) -> Option<(FsPath, bool)> {
        let relative = key.strip_prefix(self.prefix.as_str())?;
        if relative.is_empty() {
            return Some((FsPath::root(), true));
        }
        let (body, is_dir) = match relative.strip_suffix(SEPARATOR) {
            Some(body) => (body, true),
            None => (relative, false),
        };
        if body.is_empty() || body.split(SEPARATOR).any(|c| validate_name(c).is_err()) {
            return None;
        }
        let mut path = String::with_capacity(body.len() + 1);
        path.push(SEPARATOR);
        path.push_str(body);
        Some((FsPath(path), is_dir))
    }

    /// Name of the immediate child `key` of directory key `dir_key`.
    ///
    /// `None` when `key` is the marker itself or not a direct child.
    pub fn child_name<'k>(dir_key: &str, key: &'k str) -> Option<(&'k str, bool)> {
        let rest = key.strip_prefix(dir_key)?;
        let (name, is_dir) = match rest.strip_suffix(SEPARATOR) {
            Some(name) => (name, true),
            None => (rest, false),
        };
        if name.is_empty() || name.contains(SEPARATOR) {
            return None;
        }
        Some((name, is_dir))
    }
}
