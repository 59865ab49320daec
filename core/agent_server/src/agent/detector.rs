//! Library detection for guide selection: explicit mention patterns first,
//! then bilingual keyword scoring, then libraries already imported in the
//! notebook. Only libraries with an on-disk guide are ever reported.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

const KEYWORD_SELECT_THRESHOLD: f64 = 0.7;

/// Explicit mentions select directly. The boundary class is ASCII so that a
/// library name glued to Korean particles ("dask로") still matches.
static EXPLICIT_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    let bounded = |name: &str| {
        Regex::new(&format!(r"(?i)(^|[^A-Za-z0-9_]){name}($|[^A-Za-z0-9_])"))
            .expect("library pattern")
    };
    vec![
        (bounded("dask"), "dask"),
        (Regex::new(r"(?i)\bdd\.read").expect("dd.read"), "dask"),
        (bounded("polars"), "polars"),
        (Regex::new(r"(?i)\bpl\.read").expect("pl.read"), "polars"),
        (bounded("pyspark"), "pyspark"),
        (bounded("spark"), "pyspark"),
        (bounded("vaex"), "vaex"),
        (bounded("modin"), "modin"),
        (bounded("ray"), "ray"),
        (bounded("seaborn"), "matplotlib"),
        (bounded("matplotlib"), "matplotlib"),
        (Regex::new(r"(?i)\bplt\.").expect("plt."), "matplotlib"),
    ]
});

/// keyword → (library, score). Korean and English terms score the same
/// library; the max matched score must clear the threshold to select.
static KEYWORD_SCORES: Lazy<Vec<(&'static str, &'static str, f64)>> = Lazy::new(|| {
    vec![
        ("대용량", "dask", 0.8),
        ("병렬 처리", "dask", 0.7),
        ("분산 처리", "dask", 0.75),
        ("out-of-core", "dask", 0.8),
        ("larger than memory", "dask", 0.8),
        ("parallel dataframe", "dask", 0.7),
        ("빠른 데이터프레임", "polars", 0.8),
        ("lazy evaluation", "polars", 0.7),
        ("레이지 평가", "polars", 0.7),
        ("고성능 집계", "polars", 0.7),
        ("시각화", "matplotlib", 0.8),
        ("그래프 그려", "matplotlib", 0.75),
        ("차트", "matplotlib", 0.7),
        ("plot", "matplotlib", 0.7),
        ("chart", "matplotlib", 0.7),
        ("visualize", "matplotlib", 0.75),
        ("분산 클러스터", "pyspark", 0.75),
        ("스파크", "pyspark", 0.8),
    ]
});

/// Imported library → guide name.
static IMPORT_ALIASES: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| HashMap::from([("seaborn", "matplotlib")]));

/// Markdown API guides on disk, cached after first load.
pub struct KnowledgeBase {
    dir: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl KnowledgeBase {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_guide(&self, library: &str) -> bool {
        if self
            .cache
            .lock()
            .expect("knowledge cache lock poisoned")
            .contains_key(library)
        {
            return true;
        }
        self.dir.join(format!("{library}.md")).is_file()
    }

    pub fn load_guide(&self, library: &str) -> Option<String> {
        {
            let cache = self.cache.lock().expect("knowledge cache lock poisoned");
            if let Some(content) = cache.get(library) {
                return Some(content.clone());
            }
        }

        let content = fs::read_to_string(self.dir.join(format!("{library}.md"))).ok()?;
        self.cache
            .lock()
            .expect("knowledge cache lock poisoned")
            .insert(library.to_string(), content.clone());
        Some(content)
    }

    pub fn available(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if path.extension().and_then(|x| x.to_str()) == Some("md") {
                    path.file_stem()
                        .and_then(|s| s.to_str())
                        .map(str::to_string)
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names
    }
}

pub struct LibraryDetector {
    knowledge: KnowledgeBase,
}

impl LibraryDetector {
    pub fn new(knowledge_dir: impl Into<PathBuf>) -> Self {
        Self {
            knowledge: KnowledgeBase::new(knowledge_dir),
        }
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    /// Detect the set of guide libraries relevant to a request. The result
    /// is sorted, deduplicated, and limited to libraries with a guide.
    pub fn detect(&self, request: &str, imported_libraries: &[String]) -> Vec<String> {
        let mut selected: BTreeSet<&str> = BTreeSet::new();

        for (pattern, library) in EXPLICIT_PATTERNS.iter() {
            if pattern.is_match(request) {
                selected.insert(library);
            }
        }

        let request_lower = request.to_lowercase();
        let mut best_scores: HashMap<&str, f64> = HashMap::new();
        for (keyword, library, score) in KEYWORD_SCORES.iter() {
            if request_lower.contains(keyword) {
                let entry = best_scores.entry(library).or_insert(0.0);
                if *score > *entry {
                    *entry = *score;
                }
            }
        }
        for (library, score) in best_scores {
            if score >= KEYWORD_SELECT_THRESHOLD {
                selected.insert(library);
            }
        }

        let mut result: BTreeSet<String> = selected.into_iter().map(str::to_string).collect();

        for imported in imported_libraries {
            let name = imported.as_str();
            let guide = IMPORT_ALIASES.get(name).copied().unwrap_or(name);
            result.insert(guide.to_string());
        }

        result
            .into_iter()
            .filter(|lib| self.knowledge.has_guide(lib))
            .collect()
    }

    /// Render the prompt section inlining every detected guide, or an empty
    /// string when nothing applies.
    pub fn format_knowledge_section(&self, request: &str, imported_libraries: &[String]) -> String {
        let libraries = self.detect(request, imported_libraries);
        if libraries.is_empty() {
            return String::new();
        }

        let mut guides = Vec::new();
        for library in &libraries {
            if let Some(content) = self.knowledge.load_guide(library) {
                guides.push(format!(
                    "## {} API guide (read-only reference)\n\n{}",
                    library.to_uppercase(),
                    content
                ));
            }
        }

        if guides.is_empty() {
            return String::new();
        }

        format!(
            "\n## Library API reference (auto-loaded)\n\n{}\n\n---\n",
            guides.join("\n\n---\n\n")
        )
    }
}
