//! Type-safe wrappers around git primitives and store names.

use std::fmt;
use std::path::{Path, PathBuf};

use git2::Oid;
use serde::{Deserialize, Serialize};

/// Identifier of a commit in the store.
///
/// Keeps blob, tree and commit ids from being mixed up. The inner `Oid`
/// is only reachable from inside the storage module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId(pub(crate) Oid);

impl CommitId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }

    /// Parse a commit id from its hex form.
    pub fn from_hex(hex: &str) -> Result<Self, git2::Error> {
        Oid::from_str(hex).map(CommitId)
    }

    /// Abbreviated hex form (7 characters).
    pub fn short(&self) -> String {
        self.0.to_string()[..7].to_string()
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a document blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobId(pub(crate) Oid);

impl BlobId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a tree (a directory snapshot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeId(pub(crate) Oid);

impl TreeId {
    pub(crate) fn new(oid: Oid) -> Self {
        Self(oid)
    }

    pub(crate) fn raw(&self) -> Oid {
        self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated collection name.
///
/// Collection names become top-level directories of the store, so they are
/// restricted to keep them path-safe:
/// - 1-64 characters
/// - ASCII letters, digits, underscores and hyphens
/// - must start with a letter (underscore-prefixed names belong to the store)
/// - reserved names are rejected
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionName(String);

impl CollectionName {
    const RESERVED: &'static [&'static str] = &["_meta", "_system", "_git", "session"];

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_identifier(&name, 64)?;
        if Self::RESERVED.contains(&name.to_lowercase().as_str()) {
            return Err(InvalidNameError::Reserved(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CollectionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated database name (the last segment of a connection string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseName(String);

impl DatabaseName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        validate_identifier(&name, 64)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn validate_identifier(name: &str, max_len: usize) -> Result<(), InvalidNameError> {
    let first_char = name.chars().next().ok_or(InvalidNameError::Empty)?;

    if name.len() > max_len {
        return Err(InvalidNameError::TooLong(name.len()));
    }

    if !first_char.is_ascii_alphabetic() {
        return Err(InvalidNameError::InvalidStart(first_char));
    }

    for (i, c) in name.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
            return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
        }
    }

    Ok(())
}

/// A validated document id (the `_id` field).
///
/// Ids are used as file names, so they share the collection name character set
/// but may start with any allowed character (ULIDs, UUIDs, slugs).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidNameError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    fn validate(id: &str) -> Result<(), InvalidNameError> {
        if id.is_empty() {
            return Err(InvalidNameError::Empty);
        }

        if id.len() > 128 {
            return Err(InvalidNameError::TooLong(id.len()));
        }

        for (i, c) in id.chars().enumerate() {
            if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
                return Err(InvalidNameError::InvalidCharacter { char: c, position: i });
            }
        }

        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Generate a new ULID-based document id.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }

    /// File name of the document blob inside its collection directory.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DocumentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Full path of a document: `{collection}/{id}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    pub collection: CollectionName,
    pub id: DocumentId,
}

impl DocumentPath {
    pub fn new(collection: CollectionName, id: DocumentId) -> Self {
        Self { collection, id }
    }

    /// Parse a tree path back into a document path.
    ///
    /// Returns `None` for anything that is not a document (store metadata,
    /// nested directories, non-JSON files).
    pub fn parse(path: &Path) -> Option<Self> {
        let mut components = path.components();
        let collection = components.next()?.as_os_str().to_str()?;
        let file = components.next()?.as_os_str().to_str()?;
        if components.next().is_some() {
            return None;
        }

        let id = file.strip_suffix(".json")?;
        Some(Self {
            collection: CollectionName::new(collection).ok()?,
            id: DocumentId::new(id).ok()?,
        })
    }

    pub fn to_path_buf(&self) -> PathBuf {
        PathBuf::from(self.to_string())
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.json", self.collection, self.id)
    }
}

/// A branch name, with special handling for session branches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BranchName(String);

impl BranchName {
    pub const MAIN: &'static str = "main";

    /// Prefix of branches that hold in-flight session transactions.
    pub const SESSION_PREFIX: &'static str = "session/";

    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidNameError::Empty);
        }
        if name.contains("..") || name.ends_with('/') || name.starts_with('/') {
            return Err(InvalidNameError::InvalidPath(name));
        }
        Ok(Self(name))
    }

    pub fn main() -> Self {
        Self(Self::MAIN.to_string())
    }

    pub fn for_session(session_id: &str) -> Self {
        Self(format!("{}{}", Self::SESSION_PREFIX, session_id))
    }

    pub fn is_session_branch(&self) -> bool {
        self.0.starts_with(Self::SESSION_PREFIX)
    }

    /// Session id if this is a session branch.
    pub fn session_id(&self) -> Option<&str> {
        self.0.strip_prefix(Self::SESSION_PREFIX)
    }

    /// Full ref path, e.g. `refs/heads/main`.
    pub fn as_ref_path(&self) -> String {
        format!("refs/heads/{}", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author/committer of store commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSignature {
    pub name: String,
    pub email: String,
}

impl GitSignature {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    pub fn gitdoc() -> Self {
        Self::new("gitdoc", "gitdoc@localhost")
    }

    pub(crate) fn to_git2_signature(&self) -> Result<git2::Signature<'static>, git2::Error> {
        git2::Signature::now(&self.name, &self.email)
    }
}

impl Default for GitSignature {
    fn default() -> Self {
        Self::gitdoc()
    }
}

/// Why a collection name, document id or branch name was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidNameError {
    Empty,
    TooLong(usize),
    InvalidStart(char),
    InvalidCharacter { char: char, position: usize },
    Reserved(String),
    InvalidPath(String),
}

impl fmt::Display for InvalidNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "name cannot be empty"),
            Self::TooLong(len) => write!(f, "name too long: {} characters", len),
            Self::InvalidStart(c) => write!(f, "name cannot start with '{}'", c),
            Self::InvalidCharacter { char, position } => {
                write!(f, "invalid character '{}' at position {}", char, position)
            }
            Self::Reserved(name) => write!(f, "'{}' is a reserved name", name),
            Self::InvalidPath(path) => write!(f, "invalid path: '{}'", path),
        }
    }
}

impl std::error::Error for InvalidNameError {}

/// A changed path between two commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub path: PathBuf,
    pub status: ChangeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Added,
    Deleted,
    Modified,
    Renamed,
    Copied,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_name_valid() {
        assert!(CollectionName::new("products").is_ok());
        assert!(CollectionName::new("test_products").is_ok());
        assert!(CollectionName::new("Orders2024").is_ok());
        assert!(CollectionName::new("line-items").is_ok());
    }

    #[test]
    fn test_collection_name_invalid() {
        assert!(CollectionName::new("").is_err());
        assert!(CollectionName::new("1products").is_err());
        assert!(CollectionName::new("_meta").is_err());
        assert!(CollectionName::new("a/b").is_err());
        assert!(CollectionName::new("session").is_err());
        assert!(CollectionName::new("a".repeat(65)).is_err());
    }

    #[test]
    fn test_document_id() {
        assert!(DocumentId::new("p-001").is_ok());
        assert!(DocumentId::new("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(DocumentId::new("01ARZ3NDEKTSV4RRFFQ69G5FAV").is_ok());
        assert_eq!(DocumentId::new(""), Err(InvalidNameError::Empty));
        assert!(DocumentId::new("../etc").is_err());
        assert!(DocumentId::new("a b").is_err());

        let a = DocumentId::generate();
        let b = DocumentId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26);
    }

    #[test]
    fn test_document_path_parse() {
        let path = DocumentPath::parse(Path::new("products/p1.json")).unwrap();
        assert_eq!(path.collection.as_str(), "products");
        assert_eq!(path.id.as_str(), "p1");
        assert_eq!(path.to_string(), "products/p1.json");

        assert!(DocumentPath::parse(Path::new("_meta/store.json")).is_none());
        assert!(DocumentPath::parse(Path::new("products/p1.txt")).is_none());
        assert!(DocumentPath::parse(Path::new("products")).is_none());
        assert!(DocumentPath::parse(Path::new("a/b/c.json")).is_none());
    }

    #[test]
    fn test_session_branch() {
        let branch = BranchName::for_session("01h2x");
        assert!(branch.is_session_branch());
        assert_eq!(branch.session_id(), Some("01h2x"));
        assert_eq!(branch.as_ref_path(), "refs/heads/session/01h2x");

        let main = BranchName::main();
        assert!(!main.is_session_branch());
        assert_eq!(main.session_id(), None);
        assert_eq!(main.as_ref_path(), "refs/heads/main");
    }
}
