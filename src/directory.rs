use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Lightweight display record for a class, teacher or subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRecord {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectoryKind {
    Class,
    Teacher,
    Subject,
}

impl std::fmt::Display for DirectoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DirectoryKind::Class => "class",
            DirectoryKind::Teacher => "teacher",
            DirectoryKind::Subject => "subject",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    NotFound(DirectoryKind, Ulid),
    Unavailable(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::NotFound(kind, id) => write!(f, "{kind} not found: {id}"),
            DirectoryError::Unavailable(e) => write!(f, "directory unavailable: {e}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

/// Resolves the foreign keys a booking refers to. The engine treats the
/// returned records as immutable display data.
#[async_trait]
pub trait ResourceDirectory: Send + Sync {
    async fn resolve_class(&self, id: Ulid) -> Result<DisplayRecord, DirectoryError>;
    async fn resolve_teacher(&self, id: Ulid) -> Result<DisplayRecord, DirectoryError>;
    async fn resolve_subject(&self, id: Ulid) -> Result<DisplayRecord, DirectoryError>;
}

/// JSON seed file layout.
#[derive(Debug, Default, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub classes: Vec<DisplayRecord>,
    #[serde(default)]
    pub teachers: Vec<DisplayRecord>,
    #[serde(default)]
    pub subjects: Vec<DisplayRecord>,
}

/// Process-local directory, filled from a seed file and/or at runtime.
#[derive(Default)]
pub struct InMemoryDirectory {
    classes: DashMap<Ulid, String>,
    teachers: DashMap<Ulid, String>,
    subjects: DashMap<Ulid, String>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let dir = Self::new();
        for r in seed.classes {
            dir.register(DirectoryKind::Class, r.id, r.name);
        }
        for r in seed.teachers {
            dir.register(DirectoryKind::Teacher, r.id, r.name);
        }
        for r in seed.subjects {
            dir.register(DirectoryKind::Subject, r.id, r.name);
        }
        dir
    }

    /// Load a seed file. A missing file yields an empty directory.
    pub fn load_json(path: &Path) -> io::Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e),
        };
        let seed: DirectorySeed =
            serde_json::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Self::from_seed(seed))
    }

    fn table(&self, kind: DirectoryKind) -> &DashMap<Ulid, String> {
        match kind {
            DirectoryKind::Class => &self.classes,
            DirectoryKind::Teacher => &self.teachers,
            DirectoryKind::Subject => &self.subjects,
        }
    }

    /// Insert or rename an entry.
    pub fn register(&self, kind: DirectoryKind, id: Ulid, name: String) {
        self.table(kind).insert(id, name);
    }

    pub fn len(&self, kind: DirectoryKind) -> usize {
        self.table(kind).len()
    }

    fn lookup(&self, kind: DirectoryKind, id: Ulid) -> Result<DisplayRecord, DirectoryError> {
        self.table(kind)
            .get(&id)
            .map(|e| DisplayRecord { id, name: e.value().clone() })
            .ok_or(DirectoryError::NotFound(kind, id))
    }
}

#[async_trait]
impl ResourceDirectory for InMemoryDirectory {
    async fn resolve_class(&self, id: Ulid) -> Result<DisplayRecord, DirectoryError> {
        self.lookup(DirectoryKind::Class, id)
    }

    async fn resolve_teacher(&self, id: Ulid) -> Result<DisplayRecord, DirectoryError> {
        self.lookup(DirectoryKind::Teacher, id)
    }

    async fn resolve_subject(&self, id: Ulid) -> Result<DisplayRecord, DirectoryError> {
        self.lookup(DirectoryKind::Subject, id)
    }
}
