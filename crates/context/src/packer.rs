use std::collections::BTreeMap;

use serde::Serialize;

use crate::imports::header_outline;
use crate::resolver::SkippedImport;

const CHARS_PER_TOKEN: usize = 4;
const SHRINK_STEP: usize = 200;
const TRUNCATION_MARKER: &str = "…<truncated>";

/// Deterministic heuristic used everywhere a budget is enforced.
pub fn estimate_tokens(text: &str) -> usize {
    ((text.len() + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN).max(1)
}

/// How a file ended up represented in the packed context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageKind {
    Full,
    Slice,
    Header,
    Excluded,
}

/// One candidate section. `windowed` marks content already reduced to hunks
/// by the windowing stage, which caps its coverage kind at `slice`.
#[derive(Debug, Clone)]
pub struct PackSection {
    pub rel_path: String,
    pub content: String,
    pub windowed: bool,
}

#[derive(Debug, Clone)]
pub struct PackRequest {
    pub changed: Vec<PackSection>,
    pub imports: Vec<PackSection>,
    pub constitution: String,
    pub token_budget: usize,
}

/// The single blob each judge sees, plus the audit trail of what was kept,
/// reduced or dropped.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedContext {
    pub text: String,
    pub token_count: usize,
    pub partial: bool,
    pub included_changed: Vec<String>,
    pub included_imports: Vec<String>,
    pub truncated_files: Vec<String>,
    pub constitution_included: bool,
    pub coverage_kinds: BTreeMap<String, CoverageKind>,
    pub skip_reasons: BTreeMap<String, String>,
    pub skipped_imports: Vec<SkippedImport>,
}

/// Pack priority bands in order (changed files, imports, constitution) until
/// the budget is exhausted. Output is a pure function of the input orders
/// and the budget: no reordering, no summarization.
pub fn pack(request: PackRequest) -> ResolvedContext {
    let budget = request.token_budget;
    let mut parts: Vec<String> = Vec::new();
    let mut running = 0usize;

    let mut included_changed = Vec::new();
    let mut included_imports = Vec::new();
    let mut truncated_files = Vec::new();
    let mut coverage_kinds = BTreeMap::new();
    let mut skip_reasons = BTreeMap::new();

    for section in &request.changed {
        let title = format!("Changed: {}", section.rel_path);
        let rendered = render(&title, &section.content, false);
        let tokens = estimate_tokens(&rendered);

        if running + tokens <= budget {
            parts.push(rendered);
            running += tokens;
            included_changed.push(section.rel_path.clone());
            coverage_kinds.insert(
                section.rel_path.clone(),
                if section.windowed { CoverageKind::Slice } else { CoverageKind::Full },
            );
            continue;
        }

        match fit_section(&title, &section.content, budget - running) {
            Some((rendered, used)) => {
                parts.push(rendered);
                running += used;
                included_changed.push(section.rel_path.clone());
                truncated_files.push(section.rel_path.clone());
                coverage_kinds.insert(section.rel_path.clone(), CoverageKind::Slice);
            }
            None => {
                truncated_files.push(section.rel_path.clone());
                coverage_kinds.insert(section.rel_path.clone(), CoverageKind::Excluded);
                skip_reasons.insert(section.rel_path.clone(), "budget_exhausted".to_string());
            }
        }
    }

    for section in &request.imports {
        let title = format!("Import: {}", section.rel_path);
        let rendered = render(&title, &section.content, false);
        let tokens = estimate_tokens(&rendered);

        if running + tokens <= budget {
            parts.push(rendered);
            running += tokens;
            included_imports.push(section.rel_path.clone());
            coverage_kinds.insert(section.rel_path.clone(), CoverageKind::Full);
            continue;
        }

        // A large import the judge only needs the shape of: try the compact
        // outline before slicing raw text.
        let header = header_outline(&section.rel_path, &section.content);
        let header_rendered = render(&format!("Import (header): {}", section.rel_path), &header, false);
        let header_tokens = estimate_tokens(&header_rendered);
        if !header.trim().is_empty() && running + header_tokens <= budget {
            parts.push(header_rendered);
            running += header_tokens;
            included_imports.push(section.rel_path.clone());
            truncated_files.push(section.rel_path.clone());
            coverage_kinds.insert(section.rel_path.clone(), CoverageKind::Header);
            continue;
        }

        match fit_section(&title, &section.content, budget - running) {
            Some((rendered, used)) => {
                parts.push(rendered);
                running += used;
                included_imports.push(section.rel_path.clone());
                truncated_files.push(section.rel_path.clone());
                coverage_kinds.insert(section.rel_path.clone(), CoverageKind::Slice);
            }
            None => {
                truncated_files.push(section.rel_path.clone());
                coverage_kinds.insert(section.rel_path.clone(), CoverageKind::Excluded);
                skip_reasons.insert(section.rel_path.clone(), "budget_exhausted".to_string());
            }
        }
    }

    let mut constitution_included = false;
    if !request.constitution.is_empty() {
        let rendered = render("Constitution", &request.constitution, false);
        let tokens = estimate_tokens(&rendered);
        if running + tokens <= budget {
            parts.push(rendered);
            running += tokens;
            constitution_included = true;
        } else if let Some((rendered, used)) =
            fit_section("Constitution", &request.constitution, budget - running)
        {
            parts.push(rendered);
            running += used;
            constitution_included = true;
            truncated_files.push("__constitution__".to_string());
        }
    }

    let partial = !truncated_files.is_empty()
        || (!request.constitution.is_empty() && !constitution_included);

    ResolvedContext {
        text: parts.concat().trim().to_string(),
        token_count: running,
        partial,
        included_changed,
        included_imports,
        truncated_files,
        constitution_included,
        coverage_kinds,
        skip_reasons,
        skipped_imports: Vec::new(),
    }
}

fn render(title: &str, body: &str, truncated: bool) -> String {
    if truncated {
        format!("\n\n## {title}\n{body}\n{TRUNCATION_MARKER}")
    } else {
        format!("\n\n## {title}\n{body}")
    }
}

/// Shrink `content` by fixed steps until the rendered section fits in
/// `remaining` tokens. None when even the smallest renderable form misses.
fn fit_section(title: &str, content: &str, remaining: usize) -> Option<(String, usize)> {
    if remaining == 0 {
        return None;
    }

    let remaining_chars = remaining.saturating_mul(CHARS_PER_TOKEN);
    let mut end = content
        .len()
        .min(remaining_chars.saturating_sub(TRUNCATION_MARKER.len() + 1));
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    if end == 0 {
        return None;
    }

    loop {
        let snippet = &content[..end];
        let rendered = render(title, snippet, true);
        let used = estimate_tokens(&rendered);
        if used <= remaining {
            return Some((rendered, used));
        }
        if end <= SHRINK_STEP {
            return None;
        }
        end -= SHRINK_STEP;
        while end > 0 && !content.is_char_boundary(end) {
            end -= 1;
        }
    }
}
