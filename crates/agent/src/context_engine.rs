use ignore::WalkBuilder;
use legion_core::config::ContextConfig;
use legion_core::types::{ChunkKind, ContextChunk, EnrichedContext, TaskContext};
use legion_core::{Error, Paths, Result};
use legion_storage::hash_cache::content_hash;
use legion_storage::{ChunkRecord, Embedder, FileHashCache, HashingEmbedder, SqliteVectorStore, VectorStore};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

static RUST_ITEM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(pub(\([^)]*\))?\s+)?(async\s+)?(unsafe\s+)?(fn|impl|struct|enum|trait|mod)\b")
        .expect("rust item regex is valid")
});

/// Language tag for a file, by extension.
pub fn language_for_path(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "cpp" | "cc" | "hpp" => "cpp",
        "c" | "h" => "c",
        "cs" => "csharp",
        "php" => "php",
        "rb" => "ruby",
        "go" => "go",
        "rs" => "rust",
        "swift" => "swift",
        "kt" => "kotlin",
        "scala" => "scala",
        "clj" => "clojure",
        "hs" => "haskell",
        "ml" => "ocaml",
        "fs" => "fsharp",
        "elm" => "elm",
        "dart" => "dart",
        "lua" => "lua",
        "r" => "r",
        "sh" | "bash" => "bash",
        "ps1" => "powershell",
        "sql" => "sql",
        "html" => "html",
        "css" => "css",
        "scss" => "scss",
        "xml" => "xml",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" => "markdown",
        _ => "unknown",
    }
}

fn starts_with_any(line: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| line.starts_with(p))
}

/// Whether a trimmed line opens a function, class or similar top-level item.
fn is_block_start(line: &str, language: &str) -> bool {
    match language {
        "python" => starts_with_any(line, &["def ", "class ", "async def "]),
        "javascript" | "typescript" => {
            starts_with_any(line, &["class ", "export class ", "export default class "])
                || (starts_with_any(
                    line,
                    &["function ", "async function ", "export function ", "export async function ", "const ", "let ", "var "],
                ) && (line.contains("=>") || line.contains('(')))
        }
        "java" | "csharp" => {
            starts_with_any(line, &["public ", "private ", "protected "])
                && (line.contains('(') || line.contains(" class "))
        }
        "cpp" | "c" => {
            starts_with_any(line, &["void ", "int ", "bool ", "class ", "struct "])
                && (line.contains('(') || line.contains('{'))
        }
        "rust" => RUST_ITEM.is_match(line),
        "go" => starts_with_any(line, &["func ", "type "]),
        "ruby" => starts_with_any(line, &["def ", "class ", "module "]),
        _ => false,
    }
}

fn classify_block(line: &str) -> ChunkKind {
    let padded = format!(" {}", line);
    if [" def ", " function ", " func ", " fn "].iter().any(|k| padded.contains(k)) {
        ChunkKind::Function
    } else if [" class ", " struct ", " impl ", " trait ", " interface ", " enum ", " module "]
        .iter()
        .any(|k| padded.contains(k))
    {
        ChunkKind::Class
    } else {
        ChunkKind::Block
    }
}

/// Split a file at function/class starts, and at blank lines once a block exceeds ten lines.
pub fn split_into_chunks(content: &str, file_path: &str) -> Vec<ContextChunk> {
    let language = language_for_path(file_path);
    let lines: Vec<&str> = content.lines().collect();

    let mut spans: Vec<(Vec<&str>, usize, usize, ChunkKind)> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start = 1;
    let mut kind = ChunkKind::Block;

    for (i, raw) in lines.iter().copied().enumerate() {
        let lineno = i + 1;
        let trimmed = raw.trim();
        if is_block_start(trimmed, language) {
            if !current.is_empty() {
                spans.push((std::mem::take(&mut current), start, lineno - 1, kind));
            }
            current.push(raw);
            start = lineno;
            kind = classify_block(trimmed);
        } else if trimmed.is_empty() && current.len() > 10 {
            spans.push((std::mem::take(&mut current), start, lineno - 1, kind));
            start = lineno + 1;
        } else {
            current.push(raw);
        }
    }
    if !current.is_empty() {
        spans.push((current, start, lines.len(), kind));
    }

    spans
        .into_iter()
        .filter(|(body, ..)| body.iter().any(|l| !l.trim().is_empty()))
        .enumerate()
        .map(|(idx, (body, start_line, end_line, kind))| ContextChunk {
            content: body.join("\n"),
            file_path: file_path.to_string(),
            chunk_index: idx,
            start_line,
            end_line,
            kind,
            language: language.to_string(),
            relevance: 0.0,
        })
        .collect()
}

fn char_prefix(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    /// False when no vector index could be opened; nothing was indexed.
    pub available: bool,
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_failed: usize,
    pub files_removed: usize,
    pub chunks_written: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileContext {
    pub file_path: String,
    pub content: String,
    pub line_count: usize,
    pub language: String,
    pub chunks: Vec<ContextChunk>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectStats {
    pub total_chunks: usize,
    pub indexed_files: usize,
    pub supported_extensions: Vec<String>,
    pub cache_location: String,
}

/// Project indexer and retriever.
pub struct ContextEngine {
    paths: Paths,
    config: ContextConfig,
    store: Option<Arc<dyn VectorStore>>,
    embedder: Arc<dyn Embedder>,
    hashes: FileHashCache,
}

impl ContextEngine {
    /// Open the on-disk index. A failure is logged and leaves the engine in degraded mode.
    pub fn open(paths: &Paths, config: &ContextConfig) -> Self {
        let store: Option<Arc<dyn VectorStore>> = match SqliteVectorStore::open(&paths.vector_index_file()) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                warn!(error = %e, "Vector index unavailable, context retrieval degraded");
                None
            }
        };
        let embedder = Arc::new(HashingEmbedder::new(config.embedding_dims));
        Self::with_store(paths, config, store, embedder)
    }

    pub fn with_store(
        paths: &Paths,
        config: &ContextConfig,
        store: Option<Arc<dyn VectorStore>>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            paths: paths.clone(),
            config: config.clone(),
            store,
            embedder,
            hashes: FileHashCache::load(&paths.file_hashes_file()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_indexed(&self) -> bool {
        self.store
            .as_ref()
            .and_then(|s| s.count().ok())
            .map_or(false, |n| n > 0)
    }

    fn rel_path(&self, path: &Path) -> String {
        self.paths.relative(path).to_string_lossy().replace('\\', "/")
    }

    fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| {
                let e = e.to_lowercase();
                self.config.extensions.iter().any(|x| *x == e)
            })
            .unwrap_or(false)
    }

    /// Index every supported file under the project root. Unchanged files are skipped
    /// unless `force` is set. Per-file failures are counted, never fatal.
    pub fn index_project(&self, force: bool) -> IndexReport {
        let started = Instant::now();
        let mut report = IndexReport::default();
        let Some(store) = self.store.as_ref() else {
            warn!("Vector index unavailable, skipping project indexing");
            return report;
        };
        report.available = true;

        let excluded: HashSet<String> = self.config.exclude_dirs.iter().cloned().collect();
        let mut builder = WalkBuilder::new(&self.paths.project_root);
        builder.filter_entry(move |entry| {
            let is_dir = entry.file_type().map_or(false, |t| t.is_dir());
            !(is_dir && excluded.contains(entry.file_name().to_string_lossy().as_ref()))
        });

        let mut seen = HashSet::new();
        for result in builder.build() {
            let entry = match result {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Failed to walk project entry");
                    report.files_failed += 1;
                    continue;
                }
            };
            if !entry.file_type().map_or(false, |t| t.is_file()) || !self.is_supported(entry.path()) {
                continue;
            }

            report.files_scanned += 1;
            let rel = self.rel_path(entry.path());
            seen.insert(rel.clone());
            match self.index_file(store.as_ref(), entry.path(), &rel, force) {
                Ok(Some(n)) => {
                    report.files_indexed += 1;
                    report.chunks_written += n;
                }
                Ok(None) => report.files_unchanged += 1,
                Err(e) => {
                    warn!(file = %rel, error = %e, "Failed to index file");
                    report.files_failed += 1;
                }
            }
        }

        for stale in self.hashes.files() {
            if seen.contains(&stale) {
                continue;
            }
            match store.remove_file(&stale) {
                Ok(_) => {
                    self.hashes.remove(&stale);
                    report.files_removed += 1;
                }
                Err(e) => warn!(file = %stale, error = %e, "Failed to drop chunks of deleted file"),
            }
        }

        if let Err(e) = self.hashes.save() {
            warn!(error = %e, "Failed to persist file hash cache");
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            scanned = report.files_scanned,
            indexed = report.files_indexed,
            unchanged = report.files_unchanged,
            failed = report.files_failed,
            chunks = report.chunks_written,
            "Project indexed"
        );
        report
    }

    /// Returns the number of chunks written, or `None` when the file is unchanged.
    fn index_file(&self, store: &dyn VectorStore, path: &Path, rel: &str, force: bool) -> Result<Option<usize>> {
        let bytes = std::fs::read(path)?;
        let hash = content_hash(&bytes);
        if !force && self.hashes.is_unchanged(rel, &hash) {
            return Ok(None);
        }

        let content = String::from_utf8_lossy(&bytes);
        let records: Vec<ChunkRecord> = split_into_chunks(&content, rel)
            .into_iter()
            .map(|chunk| {
                let embedding = self.embedder.embed(&chunk.content);
                ChunkRecord { chunk, embedding }
            })
            .collect();

        let written = store.replace_file(rel, &records)?;
        // only after the chunks are safely stored
        self.hashes.record(rel, &hash);
        debug!(file = %rel, chunks = written, "Indexed file");
        Ok(Some(written))
    }

    /// Retrieve the chunks most relevant to `task`. Never fails: without a usable index the
    /// result carries a truncated copy of the current code and `fallback_mode = true`.
    pub fn relevant_context(&self, task: &str, ctx: &TaskContext, top_k: Option<usize>) -> EnrichedContext {
        let top_k = top_k.unwrap_or(self.config.top_k);
        let code = ctx.current_code.as_deref().unwrap_or("");
        let mut enriched = EnrichedContext::from_task(ctx);
        enriched.search_query = format!("{} {}", task, char_prefix(code, self.config.query_code_prefix))
            .trim()
            .to_string();

        let Some(store) = self.store.as_ref() else {
            return self.basic_context(enriched);
        };

        let query = self.embedder.embed(&enriched.search_query);
        let scored = match store.query(&query, top_k * 2) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Vector search failed, falling back to basic context");
                return self.basic_context(enriched);
            }
        };

        let current = ctx
            .current_file
            .as_deref()
            .map(|f| self.rel_path(Path::new(f)));

        let mut chunks: Vec<ContextChunk> = scored
            .into_iter()
            .filter(|s| {
                current.as_deref() != Some(s.chunk.file_path.as_str())
                    || s.distance <= self.config.current_file_max_distance
            })
            .map(|s| {
                let mut chunk = s.chunk;
                chunk.relevance = 1.0 - s.distance;
                chunk
            })
            .collect();
        chunks.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        chunks.truncate(top_k);

        enriched.related_code = chunks.iter().map(|c| c.content.clone()).collect();
        let mut files_seen = HashSet::new();
        enriched.related_files = chunks
            .iter()
            .filter(|c| files_seen.insert(c.file_path.clone()))
            .map(|c| c.file_path.clone())
            .collect();
        enriched.chunks = chunks;
        enriched
    }

    fn basic_context(&self, mut enriched: EnrichedContext) -> EnrichedContext {
        if let Some(code) = enriched.current_code.as_deref().filter(|c| !c.is_empty()) {
            enriched.related_code = vec![char_prefix(code, self.config.fallback_code_chars).to_string()];
        }
        if let Some(file) = enriched.current_file.clone().filter(|f| !f.is_empty()) {
            enriched.related_files = vec![file];
        }
        enriched.fallback_mode = true;
        enriched
    }

    pub fn file_context(&self, file_path: &str) -> Result<FileContext> {
        let full = self.paths.project_root.join(file_path);
        if !full.is_file() {
            return Err(Error::NotFound(format!("File not found: {}", file_path)));
        }
        let bytes = std::fs::read(&full)?;
        let content = String::from_utf8_lossy(&bytes).into_owned();
        let rel = self.rel_path(&full);
        let chunks = match self.store.as_ref() {
            Some(store) => store.file_chunks(&rel).unwrap_or_else(|e| {
                warn!(file = %rel, error = %e, "Failed to load file chunks");
                Vec::new()
            }),
            None => Vec::new(),
        };
        Ok(FileContext {
            line_count: content.lines().count(),
            language: language_for_path(&rel).to_string(),
            file_path: rel,
            content,
            chunks,
        })
    }

    pub fn project_stats(&self) -> Result<ProjectStats> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::Storage("Vector index not available".to_string()))?;
        Ok(ProjectStats {
            total_chunks: store.count()?,
            indexed_files: self.hashes.len(),
            supported_extensions: self.config.extensions.clone(),
            cache_location: self.paths.cache_dir().display().to_string(),
        })
    }
}
