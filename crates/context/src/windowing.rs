use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::files::Language;
use crate::packer::estimate_tokens;

const DEFAULT_GUTTER: usize = 5;

/// Security-sensitive tokens; a window containing one is never pruned when
/// its density clears the retention threshold.
const SECURITY_PATTERNS: &[&str] = &[
    "eval(",
    "exec(",
    "subprocess",
    "shell=true",
    "pickle.loads",
    "innerhtml",
    "password",
    "secret",
    "api_key",
    "token",
    "md5",
    "sha1",
    "os.system",
    "dangerouslysetinnerhtml",
];

/// One changed line range reported by git, 1-based inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub rel_path: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// A candidate excerpt after syntactic expansion and scoring.
#[derive(Debug, Clone)]
pub struct Window {
    pub rel_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub relevance: f64,
    pub security_score: f64,
}

/// Changed line ranges from `git diff -U0` (working tree vs HEAD). Zero
/// context lines make each `@@ -a,b +c,d @@` header the exact changed range.
pub async fn git_hunks(root: &Path) -> Result<Vec<Hunk>> {
    let output = tokio::process::Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["diff", "-U0", "--no-color", "HEAD"])
        .output()
        .await?;

    if !output.status.success() {
        anyhow::bail!(
            "git diff exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(parse_hunks(&String::from_utf8_lossy(&output.stdout)))
}

pub fn parse_hunks(diff: &str) -> Vec<Hunk> {
    let mut hunks = Vec::new();
    let mut current_file: Option<String> = None;

    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("+++ b/") {
            current_file = Some(rest.trim().replace('\\', "/"));
        } else if line.starts_with("+++ /dev/null") {
            current_file = None;
        } else if let Some(header) = line.strip_prefix("@@ ") {
            let Some(file) = &current_file else { continue };
            // header looks like "-a,b +c,d @@"
            let Some(plus) = header.split_whitespace().find(|t| t.starts_with('+')) else {
                continue;
            };
            let spec = &plus[1..];
            let (start, count) = match spec.split_once(',') {
                Some((s, c)) => (
                    s.parse::<usize>().unwrap_or(1),
                    c.parse::<usize>().unwrap_or(1),
                ),
                None => (spec.parse::<usize>().unwrap_or(1), 1),
            };
            if count == 0 {
                // pure deletion: anchor on the line before the removal
                hunks.push(Hunk {
                    rel_path: file.clone(),
                    start_line: start.max(1),
                    end_line: start.max(1),
                });
            } else {
                hunks.push(Hunk {
                    rel_path: file.clone(),
                    start_line: start,
                    end_line: start + count - 1,
                });
            }
        }
    }

    hunks
}

/// Expand a changed range to the enclosing function/class plus a context
/// gutter. Python uses indentation, JS/TS brace balance; both are
/// line-oriented scans, not parsers, and fall back to the gutter alone.
pub fn expand_to_boundaries(
    content: &str,
    language: Language,
    start_line: usize,
    end_line: usize,
    gutter: usize,
) -> (usize, usize) {
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return (1, 1);
    }
    let last = lines.len();
    let start = start_line.clamp(1, last);
    let end = end_line.clamp(start, last);

    let (mut lo, mut hi) = match language {
        Language::Python => expand_python(&lines, start, end),
        Language::Javascript => expand_braces(&lines, start, end),
        Language::Unknown => (start, end),
    };

    lo = lo.saturating_sub(gutter).max(1);
    hi = (hi + gutter).min(last);
    (lo, hi)
}

fn is_python_def(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("def ")
        || trimmed.starts_with("async def ")
        || trimmed.starts_with("class ")
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn expand_python(lines: &[&str], start: usize, end: usize) -> (usize, usize) {
    let anchor_indent = indent_of(lines[start - 1]);

    // Nearest enclosing def/class above the range with a shallower indent.
    let mut lo = start;
    let mut def_indent = None;
    for idx in (1..=start).rev() {
        let line = lines[idx - 1];
        if line.trim().is_empty() {
            continue;
        }
        if is_python_def(line) && indent_of(line) <= anchor_indent {
            lo = idx;
            def_indent = Some(indent_of(line));
            break;
        }
    }

    // Body extends while lines are blank or deeper than the def.
    let mut hi = end;
    if let Some(def_indent) = def_indent {
        let mut idx = lo + 1;
        while idx <= lines.len() {
            let line = lines[idx - 1];
            if !line.trim().is_empty() && indent_of(line) <= def_indent {
                break;
            }
            hi = idx;
            idx += 1;
        }
        hi = hi.max(end);
    }

    (lo, hi)
}

fn is_js_decl(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("function ")
        || trimmed.starts_with("async function ")
        || trimmed.starts_with("class ")
        || trimmed.starts_with("export function ")
        || trimmed.starts_with("export async function ")
        || trimmed.starts_with("export class ")
        || trimmed.starts_with("export default function")
        || trimmed.starts_with("export default class")
        || trimmed.contains("=> {")
}

fn expand_braces(lines: &[&str], start: usize, end: usize) -> (usize, usize) {
    let mut lo = start;
    for idx in (1..=start).rev() {
        if is_js_decl(lines[idx - 1]) {
            lo = idx;
            break;
        }
    }

    // Walk forward from the declaration until the opening brace closes.
    let mut depth = 0i64;
    let mut opened = false;
    let mut hi = end;
    for (offset, line) in lines[lo - 1..].iter().enumerate() {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        let idx = lo + offset;
        if opened && depth <= 0 {
            hi = idx;
            break;
        }
        hi = idx;
    }

    (lo, hi.max(end))
}

pub fn security_score(text: &str) -> f64 {
    let lower = text.to_lowercase();
    SECURITY_PATTERNS
        .iter()
        .map(|p| lower.matches(p).count() as f64)
        .sum()
}

fn keyword_overlap(text: &str, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let hits = keywords
        .iter()
        .filter(|k| k.len() >= 3 && lower.contains(k.to_lowercase().as_str()))
        .count();
    hits as f64 / keywords.len() as f64
}

/// Combined relevance: security hits dominate, then invariant keyword
/// overlap, change density and reachability, plus any external risk boost.
pub fn relevance(
    text: &str,
    keywords: &[String],
    changed_lines: usize,
    total_lines: usize,
    import_reachable: bool,
    risk_boost: f64,
) -> f64 {
    let density = if total_lines == 0 {
        0.0
    } else {
        changed_lines as f64 / total_lines as f64
    };
    security_score(text) * 3.0
        + keyword_overlap(text, keywords) * 2.0
        + density
        + if import_reachable { 0.5 } else { 0.0 }
        + risk_boost
}

/// Build windows for the changed files that have hunks. Files without hunks
/// are left alone (the packer will take them whole or truncate).
pub fn window_changed_files(
    root: &Path,
    hunks: &[Hunk],
    language: Language,
    keywords: &[String],
    risk_scores: &BTreeMap<String, f64>,
    max_file_bytes: u64,
) -> Vec<Window> {
    let mut windows = Vec::new();

    for hunk in hunks {
        let Some(content) = crate::files::read_capped(root, &hunk.rel_path, max_file_bytes) else {
            continue;
        };
        let (lo, hi) = expand_to_boundaries(
            &content,
            language,
            hunk.start_line,
            hunk.end_line,
            DEFAULT_GUTTER,
        );
        let lines: Vec<&str> = content.lines().collect();
        let text = lines[lo - 1..hi.min(lines.len())].join("\n");
        let total = lines.len();
        let changed = hunk.end_line - hunk.start_line + 1;
        let boost = risk_scores.get(&hunk.rel_path).copied().unwrap_or(0.0);

        let security = security_score(&text);
        windows.push(Window {
            rel_path: hunk.rel_path.clone(),
            start_line: lo,
            end_line: hi,
            relevance: relevance(&text, keywords, changed, total, true, boost),
            security_score: security,
            text,
        });
    }

    windows
}

/// Keep the highest-relevance windows under the budget. Windows whose
/// security score clears `security_floor` are always retained, even when
/// the budget is already spent.
pub fn prune_windows(mut windows: Vec<Window>, budget_tokens: usize, security_floor: f64) -> Vec<Window> {
    let mut order: Vec<usize> = (0..windows.len()).collect();
    order.sort_by(|&a, &b| {
        windows[b]
            .relevance
            .partial_cmp(&windows[a].relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(windows[a].rel_path.cmp(&windows[b].rel_path))
            .then(windows[a].start_line.cmp(&windows[b].start_line))
    });

    let mut keep = vec![false; windows.len()];
    let mut running = 0usize;
    for &idx in &order {
        let cost = estimate_tokens(&windows[idx].text);
        if running + cost <= budget_tokens || windows[idx].security_score >= security_floor {
            keep[idx] = true;
            running += cost;
        }
    }

    let mut out = Vec::new();
    for (idx, window) in windows.drain(..).enumerate() {
        if keep[idx] {
            out.push(window);
        }
    }
    out
}

/// Merge a file's retained windows into one excerpt with line anchors, so a
/// judge can cite real locations.
pub fn merge_file_windows(rel_path: &str, windows: &[Window]) -> Option<String> {
    let mut mine: Vec<&Window> = windows.iter().filter(|w| w.rel_path == rel_path).collect();
    if mine.is_empty() {
        return None;
    }
    mine.sort_by_key(|w| w.start_line);

    let mut out = String::new();
    for w in mine {
        out.push_str(&format!("# lines {}-{}\n{}\n", w.start_line, w.end_line, w.text));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_unified_zero_context_hunks() {
        let diff = "\
diff --git a/src/app.py b/src/app.py
--- a/src/app.py
+++ b/src/app.py
@@ -10,0 +11,3 @@ def handler():
+    a = 1
+    b = 2
+    c = 3
@@ -20 +24 @@ def other():
-    old
+    new
";
        let hunks = parse_hunks(diff);
        assert_eq!(hunks.len(), 2);
        assert_eq!(hunks[0], Hunk { rel_path: "src/app.py".into(), start_line: 11, end_line: 13 });
        assert_eq!(hunks[1], Hunk { rel_path: "src/app.py".into(), start_line: 24, end_line: 24 });
    }

    #[test]
    fn python_expansion_reaches_enclosing_def() {
        let src = "\
import os

def outer():
    x = 1
    y = 2
    return x + y

def next_fn():
    pass
";
        // change on line 5 ("y = 2") expands to the whole of outer()
        let (lo, hi) = expand_to_boundaries(src, Language::Python, 5, 5, 0);
        assert_eq!(lo, 3);
        assert!(hi >= 6);
        assert!(hi < 8);
    }

    #[test]
    fn js_expansion_balances_braces() {
        let src = "\
const a = 1;
function handler(req) {
  if (req) {
    respond(req);
  }
  return null;
}
const b = 2;
";
        let (lo, hi) = expand_to_boundaries(src, Language::Javascript, 4, 4, 0);
        assert_eq!(lo, 2);
        assert_eq!(hi, 7);
    }

    #[test]
    fn pruning_retains_security_windows_past_budget() {
        let benign = Window {
            rel_path: "a.py".into(),
            start_line: 1,
            end_line: 50,
            text: "x = 1\n".repeat(400),
            relevance: 5.0,
            security_score: 0.0,
        };
        let hot = Window {
            rel_path: "b.py".into(),
            start_line: 1,
            end_line: 2,
            text: "eval(user_input)".into(),
            relevance: 1.0,
            security_score: 1.0,
        };
        let kept = prune_windows(vec![benign, hot], 100, 1.0);
        let names: Vec<&str> = kept.iter().map(|w| w.rel_path.as_str()).collect();
        // benign exceeds what remains; the security window survives anyway
        assert!(names.contains(&"b.py"));
    }

    #[test]
    fn relevance_weights_security_highest() {
        let hot = relevance("eval(data)", &[], 1, 100, false, 0.0);
        let cold = relevance("x = 1", &["eval".to_string()], 1, 100, false, 0.0);
        assert!(hot > cold);
    }
}
