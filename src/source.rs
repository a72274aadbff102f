//! Installed dictionaries and the lookups behind them.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use fst::automaton::{Automaton, Str};
use fst::{IntoStreamer, Map, MapBuilder, Streamer};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SourceError;

/// Id of the translation pseudo-dictionary. Hits from it never count as
/// having found a word.
pub const TRANSLATOR_ID: &str = "gtranslate";
pub const DEFAULT_LOGO: &str = "logo.ico";
const METADATA_FILE: &str = "dictionary.json";
const ENTRIES_FILE: &str = "entries.tsv";

/// Lookup collaborator behind a dictionary.
pub trait EntryLookup: Send + Sync {
    /// Records for `word`, compared case-insensitively, in source order.
    fn lookup_entries(&self, word: &str) -> Vec<String>;

    /// Raw bytes of a bundled resource such as a stylesheet or an image.
    fn lookup_resource(&self, _path: &str) -> Option<Vec<u8>> {
        None
    }

    /// Headwords starting with `prefix`.
    fn suggest(&self, _prefix: &str, _limit: usize) -> Vec<String> {
        Vec::new()
    }
}

/// Translation service client; its output is treated like dictionary records.
pub trait Translator: Send + Sync {
    fn translate(&self, word: &str) -> Vec<String>;
}

pub struct TranslatorSource<T>(pub T);

impl<T: Translator> EntryLookup for TranslatorSource<T> {
    fn lookup_entries(&self, word: &str) -> Vec<String> {
        self.0.translate(word)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    StaticLookup,
    DynamicApp,
}

/// Immutable description of one installed dictionary.
#[derive(Clone)]
pub struct DictionarySource {
    pub id: String,
    pub title: String,
    pub logo: String,
    pub about: String,
    pub kind: SourceKind,
    lookup: Arc<dyn EntryLookup>,
}

impl DictionarySource {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        kind: SourceKind,
        lookup: Arc<dyn EntryLookup>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            logo: DEFAULT_LOGO.to_string(),
            about: String::new(),
            kind,
            lookup,
        }
    }

    pub fn with_logo(mut self, logo: impl Into<String>) -> Self {
        self.logo = logo.into();
        self
    }

    pub fn with_about(mut self, about: impl Into<String>) -> Self {
        self.about = about.into();
        self
    }

    /// The translation pseudo-dictionary.
    pub fn translator<T: Translator + 'static>(translator: T) -> Self {
        Self::new(
            TRANSLATOR_ID,
            "Google Translate",
            SourceKind::DynamicApp,
            Arc::new(TranslatorSource(translator)),
        )
    }

    /// Loads a dictionary directory; the id is the directory name.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let id = dir
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                SourceError::InvalidFormat(format!("{} has no usable name", dir.display()))
            })?
            .to_string();
        let meta_path = dir.join(METADATA_FILE);
        let meta: DictionaryMeta = if meta_path.exists() {
            serde_json::from_slice(&fs::read(&meta_path)?)?
        } else {
            DictionaryMeta::default()
        };
        let dictionary = StaticDictionary::load(dir)?;
        info!(
            %id,
            headwords = dictionary.headword_count(),
            path = %dir.display(),
            "Loaded dictionary"
        );
        let title = meta.title.unwrap_or_else(|| id.clone());
        let mut source = Self::new(id, title, SourceKind::StaticLookup, Arc::new(dictionary));
        if let Some(logo) = meta.logo {
            source.logo = logo;
        }
        source.about = meta.about.unwrap_or_default();
        Ok(source)
    }

    pub fn lookup_entries(&self, word: &str) -> Vec<String> {
        self.lookup.lookup_entries(word)
    }

    pub fn lookup_resource(&self, path: &str) -> Option<Vec<u8>> {
        self.lookup.lookup_resource(path)
    }

    pub fn suggest(&self, prefix: &str, limit: usize) -> Vec<String> {
        self.lookup.suggest(prefix, limit)
    }

    pub fn is_translator(&self) -> bool {
        self.id == TRANSLATOR_ID
    }
}

impl std::fmt::Debug for DictionarySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictionarySource")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
struct DictionaryMeta {
    title: Option<String>,
    logo: Option<String>,
    about: Option<String>,
}

/// Headword-indexed records kept in memory, with resources read from disk.
pub struct StaticDictionary {
    root: Option<PathBuf>,
    index: Map<Vec<u8>>,
    groups: Vec<Vec<String>>,
}

impl StaticDictionary {
    /// Reads `entries.tsv` (`headword<TAB>html` per line) from `dir`.
    pub fn load(dir: &Path) -> Result<Self, SourceError> {
        let text = fs::read_to_string(dir.join(ENTRIES_FILE))?;
        let mut rows = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let Some((headword, html)) = line.split_once('\t') else {
                warn!(line = line_no + 1, "skipping entry line without a tab separator");
                continue;
            };
            rows.push((headword.to_string(), html.to_string()));
        }
        let mut dictionary = Self::from_records(rows)?;
        dictionary.root = Some(dir.to_path_buf());
        Ok(dictionary)
    }

    /// Builds the headword index from `(headword, record)` pairs. Repeated
    /// headwords keep their records in input order.
    pub fn from_records<I, K, V>(records: I) -> Result<Self, SourceError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (headword, record) in records {
            let key = normalize_key(headword.as_ref());
            if key.is_empty() {
                continue;
            }
            grouped.entry(key).or_default().push(record.into());
        }
        let mut builder = MapBuilder::memory();
        let mut groups = Vec::with_capacity(grouped.len());
        for (idx, (key, records)) in grouped.into_iter().enumerate() {
            builder.insert(key.as_bytes(), idx as u64)?;
            groups.push(records);
        }
        let index = Map::new(builder.into_inner()?)?;
        Ok(Self {
            root: None,
            index,
            groups,
        })
    }

    pub fn headword_count(&self) -> usize {
        self.groups.len()
    }
}

impl EntryLookup for StaticDictionary {
    fn lookup_entries(&self, word: &str) -> Vec<String> {
        self.index
            .get(normalize_key(word).as_bytes())
            .and_then(|idx| self.groups.get(idx as usize))
            .cloned()
            .unwrap_or_default()
    }

    fn lookup_resource(&self, path: &str) -> Option<Vec<u8>> {
        let root = self.root.as_ref()?;
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)))
        {
            debug!(path, "rejecting resource path outside the dictionary");
            return None;
        }
        fs::read(root.join(relative)).ok()
    }

    fn suggest(&self, prefix: &str, limit: usize) -> Vec<String> {
        let prefix = normalize_key(prefix);
        if prefix.is_empty() {
            return Vec::new();
        }
        let automaton = Str::new(&prefix).starts_with();
        let mut stream = self.index.search(automaton).into_stream();
        let mut results = Vec::new();
        while let Some((key, _)) = stream.next() {
            if let Ok(word) = String::from_utf8(key.to_vec()) {
                results.push(word);
            }
            if results.len() >= limit {
                break;
            }
        }
        results
    }
}

fn normalize_key(word: &str) -> String {
    word.trim().to_lowercase()
}

/// Sticky per-dictionary error messages, shown as a banner until cleared.
#[derive(Debug, Default)]
pub struct ErrorBoard {
    inner: RwLock<HashMap<String, String>>,
}

impl ErrorBoard {
    pub fn set(&self, source_id: &str, message: impl Into<String>) {
        self.inner
            .write()
            .insert(source_id.to_string(), message.into());
    }

    pub fn clear(&self, source_id: &str) {
        self.inner.write().remove(source_id);
    }

    pub fn get(&self, source_id: &str) -> Option<String> {
        self.inner.read().get(source_id).cloned()
    }
}

/// Installed dictionaries in display order.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: Vec<DictionarySource>,
    errors: ErrorBoard,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every directory in `dirs`, in order.
    pub fn from_dirs<P: AsRef<Path>>(dirs: &[P]) -> Result<Self, SourceError> {
        let mut registry = Self::new();
        for dir in dirs {
            registry.install(DictionarySource::load_dir(dir)?);
        }
        Ok(registry)
    }

    /// Adds `source`, replacing an installed dictionary with the same id.
    pub fn install(&mut self, source: DictionarySource) {
        match self.sources.iter_mut().find(|s| s.id == source.id) {
            Some(slot) => *slot = source,
            None => self.sources.push(source),
        }
    }

    pub fn get(&self, id: &str) -> Option<&DictionarySource> {
        self.sources.iter().find(|s| s.id == id)
    }

    pub fn first(&self) -> Option<&DictionarySource> {
        self.sources.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DictionarySource> {
        self.sources.iter()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn errors(&self) -> &ErrorBoard {
        &self.errors
    }
}
