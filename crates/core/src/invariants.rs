use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Categories are hard-separated so a security regression can never hide
/// inside "style". Declaration order is the processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Security,
    Functionality,
    Style,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Security, Category::Functionality, Category::Style];
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Security => write!(f, "security"),
            Category::Functionality => write!(f, "functionality"),
            Category::Style => write!(f, "style"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "critical" => Some(Severity::Critical),
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "critical"),
            Severity::High => write!(f, "high"),
            Severity::Medium => write!(f, "medium"),
            Severity::Low => write!(f, "low"),
        }
    }
}

/// One atomic, testable requirement. IDs are stable within a single
/// extraction run; re-extraction produces fresh IDs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invariant {
    pub id: u32,
    pub desc: String,
    pub severity: Severity,
}

/// The persisted shape of `criteria.json`: one list per category plus the
/// spec hash the set was extracted from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvariantSet {
    pub security: Vec<Invariant>,
    pub functionality: Vec<Invariant>,
    pub style: Vec<Invariant>,
    #[serde(default)]
    pub spec_sha256: String,
}

impl InvariantSet {
    pub fn category(&self, category: Category) -> &Vec<Invariant> {
        match category {
            Category::Security => &self.security,
            Category::Functionality => &self.functionality,
            Category::Style => &self.style,
        }
    }

    pub fn category_mut(&mut self, category: Category) -> &mut Vec<Invariant> {
        match category {
            Category::Security => &mut self.security,
            Category::Functionality => &mut self.functionality,
            Category::Style => &mut self.style,
        }
    }

    pub fn total(&self) -> usize {
        self.security.len() + self.functionality.len() + self.style.len()
    }

    /// Categories below the per-category minimum, in processing order.
    pub fn missing_categories(&self, min_per_category: usize) -> Vec<Category> {
        Category::ALL
            .iter()
            .copied()
            .filter(|c| self.category(*c).len() < min_per_category)
            .collect()
    }

    /// All invariants in ascending `(category, id)` order, which keeps
    /// reports and verdict IDs stable across runs.
    pub fn iter_ordered(&self) -> Vec<(Category, Invariant)> {
        let mut out = Vec::with_capacity(self.total());
        for category in Category::ALL {
            let mut list = self.category(category).clone();
            list.sort_by_key(|inv| inv.id);
            out.extend(list.into_iter().map(|inv| (category, inv)));
        }
        out
    }

    /// Renumber every category 1..=n in current order. Applied after any
    /// merge so duplicate model-assigned IDs cannot collide.
    pub fn renumber(&mut self) {
        for category in Category::ALL {
            for (idx, inv) in self.category_mut(category).iter_mut().enumerate() {
                inv.id = (idx + 1) as u32;
            }
        }
    }

    /// Append freshly extracted invariants for one category, then renumber.
    pub fn merge_category(&mut self, category: Category, extra: Vec<Invariant>) {
        self.category_mut(category).extend(extra);
        self.renumber();
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        crate::report::write_atomic(path, json.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let set: InvariantSet = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(set)
    }
}

pub fn spec_hash(spec_text: &str) -> String {
    let digest = Sha256::digest(spec_text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

const MAX_DESC_CHARS: usize = 500;

/// Pull one category's invariants out of a raw model payload. Items missing
/// a usable description or severity are dropped; IDs are renumbered when
/// the model repeats them.
pub fn parse_category_items(value: &serde_json::Value) -> Vec<Invariant> {
    let Some(list) = value.as_array() else {
        return Vec::new();
    };

    let mut out: Vec<Invariant> = Vec::new();
    let mut seen_ids = std::collections::HashSet::new();
    let mut duplicated = false;

    for item in list {
        let Some(desc) = item["desc"].as_str().filter(|d| !d.trim().is_empty()) else {
            continue;
        };
        let Some(severity) = item["severity"].as_str().and_then(Severity::parse) else {
            continue;
        };
        let id = item["id"].as_u64().unwrap_or(0) as u32;
        if !seen_ids.insert(id) {
            duplicated = true;
        }
        let mut desc = desc.trim().to_string();
        if desc.chars().count() > MAX_DESC_CHARS {
            desc = desc.chars().take(MAX_DESC_CHARS).collect();
        }
        out.push(Invariant { id, desc, severity });
    }

    if duplicated || out.iter().any(|i| i.id == 0) {
        for (idx, inv) in out.iter_mut().enumerate() {
            inv.id = (idx + 1) as u32;
        }
    }

    out
}
