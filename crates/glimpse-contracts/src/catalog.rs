use indexmap::IndexMap;

/// Display-label suffix for vision-capable entries.
pub const VISION_SUFFIX: &str = " (V)";

/// Substrings that mark a model identifier as vision-capable. One shared
/// list for every caller; the original tooling kept two hand-maintained
/// copies that had drifted apart by one entry (`magistral`), and this is
/// their superset.
pub const VISION_KEYWORDS: &[&str] = &[
    "vision",
    "llava",
    "pixtral",
    "minicpm-v",
    "cogvlm",
    "internvl",
    "molmo",
    "aria",
    "phi-3-vision",
    "phi-3.5-vision",
    // Qwen: only the VL variants are vision
    "qwen-vl",
    "qwen2-vl",
    "qwen2.5-vl",
    "qwen3-vl",
    "qwq-vl",
    // Llama: only 3.1 and 3.2 have vision
    "llama-3.1",
    "llama-3.2",
    "llama3.1",
    "llama3.2",
    // Gemma: only Gemma 3 has vision
    "gemma-3",
    "paligemma",
    "fuyu",
    "kosmos",
    "idefics",
    "otter",
    "flamingo",
    "blip",
    "deepseek-vl",
    "yi-vl",
    "mplug",
    "sphinx",
    "video-llama",
    // OCR models
    "ocr",
    "gliese",
    "magistral",
];

/// Listing entries that are not models: category headings and embedding
/// families. Matched case-insensitively, by equality or prefix.
const BLOCKED_ENTRIES: &[&str] = &[
    "embedding",
    "llm",
    "you",
    "default",
    "none",
    "text-embedding",
    "all-minilm",
    "bge-",
    "e5-",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Human-facing label, ` (V)`-suffixed when vision-capable.
    pub display_label: String,
    /// Raw identifier used in API and CLI calls, leading `/` stripped.
    pub identifier: String,
    pub vision: bool,
}

impl CatalogEntry {
    pub fn from_identifier(identifier: &str) -> Option<Self> {
        let identifier = identifier.trim_start_matches('/');
        if identifier.is_empty() {
            return None;
        }
        let display = display_name_for(identifier);
        if !is_valid_model(&display) {
            return None;
        }
        let vision = is_vision_model(&display);
        let display_label = if vision {
            format!("{display}{VISION_SUFFIX}")
        } else {
            display
        };
        Some(Self {
            display_label,
            identifier: identifier.to_string(),
            vision,
        })
    }
}

/// Ordered display-label → raw-identifier mapping, rebuilt from scratch on
/// every listing. Not a cache: there is no invalidation beyond re-running
/// the listing command, and nothing outlives the call that built it.
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    entries: IndexMap<String, String>,
}

impl ModelCatalog {
    /// Orders vision entries before text entries, each group alphabetical
    /// by display label.
    pub fn from_entries(entries: Vec<CatalogEntry>) -> Self {
        let mut vision: Vec<&CatalogEntry> = entries.iter().filter(|entry| entry.vision).collect();
        let mut text: Vec<&CatalogEntry> = entries.iter().filter(|entry| !entry.vision).collect();
        vision.sort_by(|a, b| a.display_label.cmp(&b.display_label));
        text.sort_by(|a, b| a.display_label.cmp(&b.display_label));

        let mut map = IndexMap::new();
        for entry in vision.into_iter().chain(text) {
            map.insert(entry.display_label.clone(), entry.identifier.clone());
        }
        Self { entries: map }
    }

    /// Hard-coded fallback used whenever the listing command fails or
    /// parses to nothing. Labels are literal, not re-classified.
    pub fn default_models() -> Self {
        let defaults = [
            "qwen2-vl-7b-instruct (V)",
            "llava-v1.5-7b (V)",
            "pixtral-12b (V)",
            "mistral-7b-instruct",
            "llama-3.1-8b-instruct",
        ];
        let mut map = IndexMap::new();
        for label in defaults {
            map.insert(label.to_string(), strip_vision_suffix(label).to_string());
        }
        Self { entries: map }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(label, identifier)| (label.as_str(), identifier.as_str()))
    }

    /// Raw identifier for a display label; falls back to treating the
    /// input as an identifier already (suffix stripped) so callers can
    /// pass either form.
    pub fn identifier(&self, label: &str) -> Option<&str> {
        self.entries.get(label).map(String::as_str)
    }

    pub fn first_vision_label(&self) -> Option<&str> {
        self.labels()
            .find(|label| label.ends_with(VISION_SUFFIX))
    }
}

/// Parses the plain-text output of the external listing command. The
/// format is undocumented; the contract here is line-oriented whitespace
/// tokens: skip blank lines, the `Downloaded models` heading, and `-`
/// separator rows, then take the first token of each remaining line as a
/// model path.
pub fn parse_model_listing(stdout: &str) -> Vec<CatalogEntry> {
    let mut entries = Vec::new();
    for raw_line in stdout.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.contains("Downloaded models") || line.starts_with('-') {
            continue;
        }
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        if let Some(entry) = CatalogEntry::from_identifier(token) {
            entries.push(entry);
        }
    }
    entries
}

/// Display name: the last one or two path segments of the identifier.
pub fn display_name_for(identifier: &str) -> String {
    let segments: Vec<&str> = identifier.split('/').filter(|part| !part.is_empty()).collect();
    match segments.len() {
        0 => identifier.to_string(),
        1 => segments[0].to_string(),
        n => segments[n - 2..].join("/"),
    }
}

/// Filters out meta entries the listing mixes in with real models.
pub fn is_valid_model(name: &str) -> bool {
    if name.len() < 3 {
        return false;
    }
    let lower = name.to_lowercase();
    for blocked in BLOCKED_ENTRIES {
        if lower == *blocked || lower.starts_with(blocked) {
            return false;
        }
    }
    // Short all-uppercase tokens are category headings, not models.
    let has_alpha = name.chars().any(|c| c.is_alphabetic());
    if has_alpha
        && name.len() < 15
        && name
            .chars()
            .filter(|c| c.is_alphabetic())
            .all(|c| c.is_uppercase())
    {
        return false;
    }
    true
}

pub fn is_vision_model(name: &str) -> bool {
    let lower = name.to_lowercase();
    VISION_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

pub fn strip_vision_suffix(label: &str) -> &str {
    label.strip_suffix(VISION_SUFFIX).unwrap_or(label)
}

/// Model name to put in API request bodies: annotation stripped, last
/// path segment only.
pub fn api_model_name(label: &str) -> &str {
    let clean = strip_vision_suffix(label);
    clean.rsplit('/').next().unwrap_or(clean)
}
