use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, QueryParser};
use tantivy::schema::{Field, NumericOptions, STORED, STRING, Schema, TEXT, Value};
use tantivy::{
    DocAddress, Index, IndexReader, IndexWriter, Order, ReloadPolicy, Score, TantivyDocument,
};
use tokio::sync::{Mutex, RwLock};

use crate::error::{BridgeError, Result};
use crate::namaste::{self, Category, CategoryLoad, NamasteRecord};
use crate::storage::{StoragePaths, file_present_nonempty, write_atomic};

/// Number of hits returned by a free-text lookup.
pub const FIND_LIMIT: usize = 5;

const CURRENT_POINTER: &str = "CURRENT";
const SUCCESS_MARKER: &str = "_SUCCESS";
const GENERATION_PREFIX: &str = "gen-";

/// A search hit projected to the fields the matcher and catalog need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamasteHit {
    #[serde(rename = "type")]
    pub category: Category,
    #[serde(rename = "id")]
    pub code: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "desc")]
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub category: Category,
    pub rows_read: u64,
    pub skipped_empty_term: u64,
    pub indexed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub generation: String,
    pub categories: Vec<CategoryReport>,
}

impl RebuildReport {
    pub fn total_indexed(&self) -> u64 {
        self.categories.iter().map(|c| c.indexed).sum()
    }
}

pub struct NamasteEngine {
    generation: String,
    reader: IndexReader,
    fields: NamasteFields,
    query_parser: QueryParser,
}

#[derive(Debug, Clone)]
struct NamasteFields {
    category: Field,
    id: Field,
    code: Field,
    term: Field,
    diacritical: Field,
    native: Field,
    short_desc: Field,
    long_desc: Field,
    ordinal: Field,
}

impl NamasteEngine {
    pub fn open(generation_dir: &Path) -> Result<Self> {
        let unavailable = |reason: String| BridgeError::IndexUnavailable {
            path: generation_dir.to_path_buf(),
            reason,
        };

        if !file_present_nonempty(&generation_dir.join(SUCCESS_MARKER)) {
            return Err(unavailable("generation is incomplete".to_string()));
        }
        let dir = MmapDirectory::open(generation_dir).map_err(|e| unavailable(e.to_string()))?;
        let index = Index::open(dir).map_err(|e| unavailable(e.to_string()))?;
        let schema = index.schema();
        let fields = namaste_fields(&schema)?;

        // Generations are immutable once committed.
        let reader: IndexReader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let mut query_parser = QueryParser::for_index(
            &index,
            vec![
                fields.term,
                fields.diacritical,
                fields.native,
                fields.code,
                fields.short_desc,
                fields.long_desc,
            ],
        );
        query_parser.set_field_boost(fields.term, 2.0);
        query_parser.set_field_boost(fields.diacritical, 2.0);

        let generation = generation_dir
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            generation,
            reader,
            fields,
            query_parser,
        })
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    /// Relevance-ranked free-text match over terms and descriptions.
    pub fn search(&self, q: &str, limit: usize) -> Result<Vec<NamasteHit>> {
        let q = q.trim();
        if q.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let (query, errors) = self.query_parser.parse_query_lenient(q);
        if !errors.is_empty() {
            tracing::debug!("lenient parse of {:?} dropped {} clause(s)", q, errors.len());
        }

        let top_docs: Vec<(Score, DocAddress)> =
            searcher.search(&query, &TopDocs::with_limit(limit))?;
        top_docs
            .into_iter()
            .map(|(_, addr)| self.doc_to_hit(&searcher, addr))
            .collect()
    }

    /// Records in corpus order: category order, then source row order.
    pub fn list(&self, size: usize) -> Result<Vec<NamasteHit>> {
        if size == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let top_docs: Vec<(u64, DocAddress)> = searcher.search(
            &AllQuery,
            &TopDocs::with_limit(size).order_by_fast_field::<u64>("ordinal", Order::Asc),
        )?;
        top_docs
            .into_iter()
            .map(|(_, addr)| self.doc_to_hit(&searcher, addr))
            .collect()
    }

    pub fn num_docs(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    fn doc_to_hit(&self, searcher: &tantivy::Searcher, addr: DocAddress) -> Result<NamasteHit> {
        let doc: TantivyDocument = searcher.doc(addr)?;
        let text = |field: Field| {
            doc.get_first(field)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let category = text(self.fields.category)
            .parse::<Category>()
            .map_err(tantivy::TantivyError::InvalidArgument)?;

        Ok(NamasteHit {
            category,
            code: text(self.fields.code),
            display_name: text(self.fields.diacritical),
            description: text(self.fields.long_desc),
        })
    }
}

/// Process-wide handle on the current index generation under `root`.
///
/// Rebuilds write a fresh generation and repoint `CURRENT` only once the new
/// generation is committed, so readers never observe a missing index after the
/// first successful build.
pub struct NamasteIndex {
    paths: StoragePaths,
    current: RwLock<Option<Arc<NamasteEngine>>>,
    rebuild_lock: Mutex<()>,
}

impl NamasteIndex {
    pub fn new(paths: StoragePaths) -> Self {
        Self {
            paths,
            current: RwLock::new(None),
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.namaste_index_root
    }

    pub async fn rebuild(&self) -> Result<RebuildReport> {
        let _guard = self.rebuild_lock.lock().await;

        let paths = self.paths.clone();
        let (report, engine) = tokio::task::spawn_blocking(move || {
            let report = rebuild(&paths)?;
            let engine = NamasteEngine::open(&paths.namaste_index_root.join(&report.generation))?;
            Ok::<_, BridgeError>((report, engine))
        })
        .await
        .map_err(|e| BridgeError::IndexUnavailable {
            path: self.root().to_path_buf(),
            reason: format!("rebuild task aborted: {e}"),
        })??;

        tracing::info!(
            "NAMASTE index generation {} is current ({} docs)",
            report.generation,
            engine.num_docs()
        );
        *self.current.write().await = Some(Arc::new(engine));
        Ok(report)
    }

    pub async fn find(&self, query: &str) -> Result<Vec<NamasteHit>> {
        self.engine().await?.search(query, FIND_LIMIT)
    }

    pub async fn list(&self, size: usize) -> Result<Vec<NamasteHit>> {
        self.engine().await?.list(size)
    }

    /// Returns the engine for the generation `CURRENT` names, reopening when
    /// another process has moved the pointer. Filesystem work stays off the
    /// async workers.
    async fn engine(&self) -> Result<Arc<NamasteEngine>> {
        let generation = current_generation(self.root()).await?;

        if let Some(engine) = self.current.read().await.as_ref() {
            if engine.generation() == generation {
                return Ok(Arc::clone(engine));
            }
        }

        let mut slot = self.current.write().await;
        if let Some(engine) = slot.as_ref() {
            if engine.generation() == generation {
                return Ok(Arc::clone(engine));
            }
        }
        let generation_dir = self.root().join(&generation);
        let engine = tokio::task::spawn_blocking(move || NamasteEngine::open(&generation_dir))
            .await
            .map_err(|e| BridgeError::IndexUnavailable {
                path: self.root().to_path_buf(),
                reason: format!("open task aborted: {e}"),
            })??;
        let engine = Arc::new(engine);
        tracing::info!("Opened NAMASTE index generation {}", generation);
        *slot = Some(Arc::clone(&engine));
        Ok(engine)
    }
}

async fn current_generation(root: &Path) -> Result<String> {
    let pointer = root.join(CURRENT_POINTER);
    let contents = tokio::fs::read_to_string(&pointer).await;
    parse_pointer(root, &pointer, contents)
}

fn read_current(root: &Path) -> Result<String> {
    let pointer = root.join(CURRENT_POINTER);
    let contents = std::fs::read_to_string(&pointer);
    parse_pointer(root, &pointer, contents)
}

fn parse_pointer(
    root: &Path,
    pointer: &Path,
    contents: std::io::Result<String>,
) -> Result<String> {
    let unavailable = |reason: String| BridgeError::IndexUnavailable {
        path: root.to_path_buf(),
        reason,
    };
    let contents = contents.map_err(|e| {
        unavailable(if e.kind() == std::io::ErrorKind::NotFound {
            "no index generation has been built".to_string()
        } else {
            format!("read {}: {e}", pointer.display())
        })
    })?;
    let generation = contents.trim();
    if generation.is_empty() {
        return Err(unavailable(format!("{} is empty", pointer.display())));
    }
    Ok(generation.to_string())
}

/// Builds a new generation from the category CSVs and makes it current.
///
/// All categories are loaded before anything touches disk; a malformed source
/// aborts the rebuild and leaves the previous generation in place.
pub fn rebuild(paths: &StoragePaths) -> Result<RebuildReport> {
    let root = &paths.namaste_index_root;
    std::fs::create_dir_all(root).map_err(|e| BridgeError::io(root, e))?;

    let mut loaded: Vec<(Category, Vec<NamasteRecord>, CategoryLoad)> = Vec::new();
    for category in Category::ALL {
        let csv_path = paths.category_csv(category);
        let (records, load) = namaste::load_category(category, &csv_path)?;
        if load.skipped_empty_term > 0 {
            tracing::info!(
                "Skipped {} {} rows with empty term",
                load.skipped_empty_term,
                category
            );
        }
        loaded.push((category, records, load));
    }

    let generation = new_generation_name(root);
    let generation_dir = root.join(&generation);
    let categories = match write_generation(&generation_dir, &loaded) {
        Ok(c) => c,
        Err(e) => {
            let _ = std::fs::remove_dir_all(&generation_dir);
            return Err(e);
        }
    };

    write_atomic(&root.join(CURRENT_POINTER), &format!("{generation}\n"))
        .map_err(|e| BridgeError::io(root.join(CURRENT_POINTER), e))?;
    remove_stale_generations(root, &generation);

    Ok(RebuildReport {
        generation,
        categories,
    })
}

fn write_generation(
    generation_dir: &Path,
    loaded: &[(Category, Vec<NamasteRecord>, CategoryLoad)],
) -> Result<Vec<CategoryReport>> {
    std::fs::create_dir_all(generation_dir).map_err(|e| BridgeError::io(generation_dir, e))?;

    let index = Index::create_in_dir(generation_dir, namaste_schema())?;
    let mut writer: IndexWriter = index.writer_with_num_threads(1, 50_000_000)?;
    let fields = namaste_fields(&index.schema())?;

    let mut reports = Vec::with_capacity(loaded.len());
    let mut ordinal: u64 = 0;
    for (category, records, load) in loaded {
        for record in records {
            let mut doc = tantivy::doc!();
            doc.add_text(fields.category, category.as_str());
            doc.add_text(fields.id, &record.id);
            doc.add_text(fields.code, &record.code);
            doc.add_text(fields.term, &record.term);
            doc.add_text(fields.diacritical, &record.diacritical);
            doc.add_text(fields.native, &record.native);
            doc.add_text(fields.short_desc, &record.short_desc);
            doc.add_text(fields.long_desc, &record.long_desc);
            doc.add_u64(fields.ordinal, ordinal);
            writer.add_document(doc)?;
            ordinal += 1;
        }

        tracing::info!("Indexed {} {} records", records.len(), category);
        reports.push(CategoryReport {
            category: *category,
            rows_read: load.rows_read,
            skipped_empty_term: load.skipped_empty_term,
            indexed: records.len() as u64,
        });
    }

    tracing::info!("Committing NAMASTE index ({} docs)...", ordinal);
    writer.commit()?;
    writer.wait_merging_threads()?;

    let marker = generation_dir.join(SUCCESS_MARKER);
    std::fs::write(&marker, "ok\n").map_err(|e| BridgeError::io(marker, e))?;
    Ok(reports)
}

fn new_generation_name(root: &Path) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut name = format!("{GENERATION_PREFIX}{millis}");
    let mut n = 1;
    while root.join(&name).exists() {
        name = format!("{GENERATION_PREFIX}{millis}-{n}");
        n += 1;
    }
    name
}

/// Orders generation names by creation time, then collision suffix.
fn generation_key(name: &str) -> Option<(u128, u32)> {
    let rest = name.strip_prefix(GENERATION_PREFIX)?;
    let (millis, n) = match rest.split_once('-') {
        Some((millis, n)) => (millis, n.parse().ok()?),
        None => (rest, 0),
    };
    Some((millis.parse().ok()?, n))
}

/// Removes completed generations older than `keep`.
///
/// Newer or unfinished generations may belong to a rebuild running in another
/// process and are left alone, as is whatever `CURRENT` names.
fn remove_stale_generations(root: &Path, keep: &str) {
    let Some(keep_key) = generation_key(keep) else {
        return;
    };
    let current = read_current(root).ok();

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("list {}: {}", root.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if current.as_deref() == Some(name) {
            continue;
        }
        match generation_key(name) {
            Some(key) if key < keep_key => {}
            _ => continue,
        }
        let path: PathBuf = entry.path();
        if !file_present_nonempty(&path.join(SUCCESS_MARKER)) {
            tracing::debug!("leaving unfinished generation {}", path.display());
            continue;
        }
        if let Err(e) = std::fs::remove_dir_all(&path) {
            tracing::warn!("remove stale generation {}: {}", path.display(), e);
        }
    }
}

fn namaste_schema() -> Schema {
    let mut b = Schema::builder();
    b.add_text_field("category", STRING | STORED);
    b.add_text_field("id", STRING | STORED);
    b.add_text_field("code", STRING | STORED);
    b.add_text_field("term", TEXT | STORED);
    b.add_text_field("diacritical", TEXT | STORED);
    b.add_text_field("native", TEXT);
    b.add_text_field("short_desc", TEXT);
    b.add_text_field("long_desc", TEXT | STORED);

    let u64o = NumericOptions::default().set_fast().set_stored();
    b.add_u64_field("ordinal", u64o);

    b.build()
}

fn namaste_fields(schema: &Schema) -> Result<NamasteFields> {
    Ok(NamasteFields {
        category: schema.get_field("category")?,
        id: schema.get_field("id")?,
        code: schema.get_field("code")?,
        term: schema.get_field("term")?,
        diacritical: schema.get_field("diacritical")?,
        native: schema.get_field("native")?,
        short_desc: schema.get_field("short_desc")?,
        long_desc: schema.get_field("long_desc")?,
        ordinal: schema.get_field("ordinal")?,
    })
}
