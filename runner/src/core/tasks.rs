//! Checkbox task-document model: parse, count, validate, rewrite.
//!
//! The task document is the ground truth every other component reads. It is
//! co-owned on disk with the session subprocess, so rewrites here only ever
//! splice the checkbox mark of a matched line and leave every other byte of
//! the document untouched.
//!
//! Grammar (one task per top-level line, indented continuations):
//!
//! ```text
//! - [ ] 1. Task title
//!   - **Files**:
//!     - src/foo.rs
//!   - **Acceptance**:
//!     - [ ] criterion text
//! ```
//!
//! Marks: `[ ]` pending, `[-]` in progress, `[x]` completed (case-insensitive,
//! inner whitespace tolerated). Ids are dotted numerics (`4.2.1`), unique per
//! document.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::types::{TaskStats, TaskStatus};

static TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[(?P<mark>[^\]]*)\]\s+(?P<id>\d+(?:\.\d+)*)\.?\s+(?P<title>\S.*)$")
        .expect("task line regex")
});

static NUMBERED_NO_BOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:- )?\d+(?:\.\d+)*[.)]\s+\S.*$").expect("numbered line regex")
});

static ACCEPTANCE_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^- \[(?P<mark>[ xX-])\]\s+(?P<text>\S.*)$").expect("acceptance item regex")
});

/// One parsed checkbox task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Dotted numeric id, e.g. `"4.2.1"`.
    pub id: String,
    pub status: TaskStatus,
    pub title: String,
    /// Zero-based line index of the checkbox line in the document.
    pub line: usize,
    /// Workspace-relative paths declared under the task's `Files:` heading.
    pub files: Vec<String>,
    /// Sub-checkboxes under the task's `Acceptance:` heading.
    pub acceptance: Vec<AcceptanceItem>,
}

impl Task {
    /// True when every acceptance sub-checkbox is checked (vacuously true).
    pub fn acceptance_met(&self) -> bool {
        self.acceptance.iter().all(|item| item.checked)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptanceItem {
    pub text: String,
    pub checked: bool,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingCheckbox,
    InvalidMark,
    DuplicateId,
    NonMonotonicId,
    MissingFiles,
    MockOnlyFiles,
}

/// One validation finding, anchored to a 1-based document line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub line: usize,
    pub severity: Severity,
    pub kind: IssueKind,
    pub message: String,
}

/// Compiled `mock_only_path_patterns` from the configuration.
#[derive(Debug, Clone)]
pub struct MockPatterns {
    regexes: Vec<Regex>,
}

impl MockPatterns {
    pub fn compile(patterns: &[String]) -> Result<Self, regex::Error> {
        let regexes = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { regexes })
    }

    /// Default set matching common test/mock path conventions.
    pub fn default_patterns() -> Vec<String> {
        vec![
            r"(^|/)tests?/".to_string(),
            r"_test\.".to_string(),
            r"(^|/)test_".to_string(),
            r"(^|/)mocks?(/|$)".to_string(),
            r"(?i)mock".to_string(),
        ]
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regexes.iter().any(|re| re.is_match(path))
    }
}

impl Default for MockPatterns {
    fn default() -> Self {
        Self::compile(&Self::default_patterns()).expect("default mock patterns compile")
    }
}

/// Existence probe injected into rewrite operations.
///
/// Rewrites never read file contents; they only ask whether a declared path
/// exists, so the whole operation stays deterministic for a given snapshot.
pub trait FileProbe {
    fn exists(&self, workspace_relative: &str) -> bool;
}

/// A parsed task document that can be rewritten without disturbing bytes
/// outside the checkbox marks it touches.
#[derive(Debug, Clone)]
pub struct TaskDocument {
    lines: Vec<String>,
    trailing_newline: bool,
    tasks: Vec<Task>,
    issues: Vec<Issue>,
}

enum Section {
    None,
    Files,
    Acceptance,
    Other,
}

/// Parse a task document. One pass, no backtracking.
///
/// Unparseable lines yield issues, never failures; unknown indented content
/// is preserved verbatim for round-trip rewrites and ignored semantically.
pub fn parse(text: &str) -> TaskDocument {
    let trailing_newline = text.ends_with('\n') || text.is_empty();
    let lines: Vec<String> = text.lines().map(str::to_string).collect();

    let mut tasks: Vec<Task> = Vec::new();
    let mut issues: Vec<Issue> = Vec::new();
    let mut section = Section::None;

    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = TASK_RE.captures(line) {
            let id = caps["id"].to_string();
            let title = caps["title"].trim().to_string();
            match parse_mark(caps["mark"].trim()) {
                Some(status) => {
                    if tasks.iter().any(|t| t.id == id) {
                        issues.push(Issue {
                            line: idx + 1,
                            severity: Severity::Error,
                            kind: IssueKind::DuplicateId,
                            message: format!("duplicate task id '{id}'"),
                        });
                    }
                    tasks.push(Task {
                        id,
                        status,
                        title,
                        line: idx,
                        files: Vec::new(),
                        acceptance: Vec::new(),
                    });
                    section = Section::None;
                }
                None => {
                    issues.push(Issue {
                        line: idx + 1,
                        severity: Severity::Error,
                        kind: IssueKind::InvalidMark,
                        message: format!(
                            "invalid checkbox mark '[{}]' (expected ' ', '-', or 'x')",
                            caps["mark"].to_string()
                        ),
                    });
                    section = Section::None;
                }
            }
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        if !indented && NUMBERED_NO_BOX_RE.is_match(line) {
            issues.push(Issue {
                line: idx + 1,
                severity: Severity::Error,
                kind: IssueKind::MissingCheckbox,
                message: format!("numbered task line without checkbox: '{}'", line.trim()),
            });
            section = Section::None;
            continue;
        }

        let Some(task) = tasks.last_mut() else {
            continue;
        };
        if !indented {
            // Non-task top-level content ends the continuation block.
            section = Section::None;
            continue;
        }

        let trimmed = line.trim_start();
        if let Some(rest) = strip_files_header(trimmed) {
            section = Section::Files;
            for inline in split_inline_paths(rest) {
                task.files.push(inline);
            }
        } else if is_acceptance_header(trimmed) {
            section = Section::Acceptance;
        } else if trimmed.starts_with("- **") {
            section = Section::Other;
        } else if let Section::Acceptance = section {
            if let Some(caps) = ACCEPTANCE_ITEM_RE.captures(trimmed) {
                task.acceptance.push(AcceptanceItem {
                    text: caps["text"].trim().to_string(),
                    checked: caps["mark"].eq_ignore_ascii_case("x"),
                    line: idx,
                });
            }
        } else if let Section::Files = section {
            if let Some(entry) = trimmed.strip_prefix("- ") {
                let path = clean_path(entry);
                if !path.is_empty() {
                    task.files.push(path);
                }
            }
        }
    }

    check_id_monotonicity(&tasks, &mut issues);

    TaskDocument {
        lines,
        trailing_newline,
        tasks,
        issues,
    }
}

/// Trivial projection of parsed tasks onto counters.
pub fn count(tasks: &[Task]) -> TaskStats {
    let mut stats = TaskStats::default();
    for task in tasks {
        match task.status {
            TaskStatus::Pending => stats.pending += 1,
            TaskStatus::InProgress => stats.in_progress += 1,
            TaskStatus::Completed => stats.completed += 1,
        }
    }
    stats
}

/// Validate a document: structural parse issues plus semantic checks on
/// completed tasks (missing `Files:` declarations, mock-only file sets).
pub fn validate(text: &str, mock: &MockPatterns) -> Vec<Issue> {
    let doc = parse(text);
    let mut issues = doc.issues.clone();

    for task in &doc.tasks {
        if task.status != TaskStatus::Completed {
            continue;
        }
        if task.files.is_empty() {
            issues.push(Issue {
                line: task.line + 1,
                severity: Severity::Error,
                kind: IssueKind::MissingFiles,
                message: format!("task {} is completed but declares no files", task.id),
            });
        } else if task.files.iter().all(|f| mock.matches(f)) {
            issues.push(Issue {
                line: task.line + 1,
                severity: Severity::Error,
                kind: IssueKind::MockOnlyFiles,
                message: format!(
                    "task {} is completed but only declares mock/test files",
                    task.id
                ),
            });
        }
    }

    issues.sort_by_key(|issue| issue.line);
    issues
}

/// Outcome of a mark-splicing rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutcome {
    pub text: String,
    /// Ids of tasks whose status was rewritten, in document order.
    pub changed_ids: Vec<String>,
}

impl RewriteOutcome {
    pub fn changed(&self) -> bool {
        !self.changed_ids.is_empty()
    }
}

/// Rewrite every completed task whose declared implementation is absent
/// (no files, files missing on disk, or files matching only mock/test
/// patterns) back to in-progress. Idempotent; preserves all other bytes.
pub fn reset_unimplemented(
    text: &str,
    probe: &dyn FileProbe,
    mock: &MockPatterns,
) -> RewriteOutcome {
    let mut doc = parse(text);
    let mut changed_ids = Vec::new();

    for idx in 0..doc.tasks.len() {
        let task = &doc.tasks[idx];
        if task.status != TaskStatus::Completed {
            continue;
        }
        let has_implementation = task
            .files
            .iter()
            .any(|f| !mock.matches(f) && probe.exists(f));
        if !has_implementation {
            changed_ids.push(task.id.clone());
            doc.set_status(idx, TaskStatus::InProgress);
        }
    }

    RewriteOutcome {
        text: doc.render(),
        changed_ids,
    }
}

/// Promote in-progress tasks whose implementation is verifiably present:
/// every declared non-mock file exists, at least one non-mock file is
/// declared, and all acceptance sub-checkboxes are checked.
pub fn promote_verified(
    text: &str,
    probe: &dyn FileProbe,
    mock: &MockPatterns,
) -> RewriteOutcome {
    let mut doc = parse(text);
    let mut changed_ids = Vec::new();

    for idx in 0..doc.tasks.len() {
        let task = &doc.tasks[idx];
        if task.status != TaskStatus::InProgress {
            continue;
        }
        let real_files: Vec<&String> =
            task.files.iter().filter(|f| !mock.matches(f)).collect();
        let verified = !real_files.is_empty()
            && real_files.iter().all(|f| probe.exists(f))
            && task.acceptance_met();
        if verified {
            changed_ids.push(task.id.clone());
            doc.set_status(idx, TaskStatus::Completed);
        }
    }

    RewriteOutcome {
        text: doc.render(),
        changed_ids,
    }
}

impl TaskDocument {
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub fn stats(&self) -> TaskStats {
        count(&self.tasks)
    }

    /// True when parsing produced any error-severity issue.
    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|issue| issue.severity == Severity::Error)
    }

    /// Render the document back to text. Round-trips byte-for-byte with the
    /// input when no rewrites were applied.
    pub fn render(&self) -> String {
        let mut out = self.lines.join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Splice a new status mark into the task's checkbox line.
    pub fn set_status(&mut self, task_index: usize, status: TaskStatus) {
        let task = &mut self.tasks[task_index];
        let line = &self.lines[task.line];
        if let Some(updated) = splice_mark(line, status.mark()) {
            self.lines[task.line] = updated;
            task.status = status;
        }
    }
}

/// Replace the content between the checkbox brackets of a task line.
fn splice_mark(line: &str, mark: char) -> Option<String> {
    let caps = TASK_RE.captures(line)?;
    let range = caps.name("mark")?.range();
    let mut updated = line.to_string();
    updated.replace_range(range, &mark.to_string());
    Some(updated)
}

fn parse_mark(mark: &str) -> Option<TaskStatus> {
    match mark {
        "" => Some(TaskStatus::Pending),
        "-" => Some(TaskStatus::InProgress),
        m if m.eq_ignore_ascii_case("x") => Some(TaskStatus::Completed),
        _ => None,
    }
}

fn strip_files_header(trimmed: &str) -> Option<&str> {
    trimmed
        .strip_prefix("- **Files**:")
        .or_else(|| trimmed.strip_prefix("- **File**:"))
}

fn is_acceptance_header(trimmed: &str) -> bool {
    trimmed.starts_with("- **Acceptance**:") || trimmed.starts_with("- **Acceptance Criteria**:")
}

fn split_inline_paths(rest: &str) -> Vec<String> {
    rest.split(',')
        .map(clean_path)
        .filter(|p| !p.is_empty())
        .collect()
}

fn clean_path(raw: &str) -> String {
    raw.trim().trim_matches('`').trim().to_string()
}

fn check_id_monotonicity(tasks: &[Task], issues: &mut Vec<Issue>) {
    let mut prev: Option<(Vec<u32>, usize)> = None;
    for task in tasks {
        let Some(id) = numeric_id(&task.id) else {
            continue;
        };
        if let Some((prev_id, _)) = &prev {
            if id <= *prev_id {
                issues.push(Issue {
                    line: task.line + 1,
                    severity: Severity::Warning,
                    kind: IssueKind::NonMonotonicId,
                    message: format!("task id '{}' does not follow the previous id", task.id),
                });
            }
        }
        prev = Some((id, task.line));
    }
}

fn numeric_id(id: &str) -> Option<Vec<u32>> {
    id.split('.').map(|part| part.parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeProbe {
        existing: HashSet<String>,
    }

    impl FakeProbe {
        fn with(paths: &[&str]) -> Self {
            Self {
                existing: paths.iter().map(|p| p.to_string()).collect(),
            }
        }
    }

    impl FileProbe for FakeProbe {
        fn exists(&self, path: &str) -> bool {
            self.existing.contains(path)
        }
    }

    const DOC: &str = "\
# Tasks

- [ ] 1. Add foo
  - **Files**:
    - src/foo.rs
  - **Acceptance**:
    - [ ] foo compiles
    - [x] foo documented
- [-] 2. Add bar
  - **Files**: src/bar.rs, `src/bar_helpers.rs`
- [x] 3. Wire everything
  - **Files**:
    - src/wiring.rs
";

    #[test]
    fn parses_statuses_ids_and_titles() {
        let doc = parse(DOC);
        let tasks = doc.tasks();
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].id, "1");
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].title, "Add foo");
        assert_eq!(tasks[1].status, TaskStatus::InProgress);
        assert_eq!(tasks[2].status, TaskStatus::Completed);
    }

    #[test]
    fn parses_files_block_and_inline() {
        let doc = parse(DOC);
        assert_eq!(doc.tasks()[0].files, vec!["src/foo.rs"]);
        assert_eq!(
            doc.tasks()[1].files,
            vec!["src/bar.rs", "src/bar_helpers.rs"]
        );
    }

    #[test]
    fn parses_acceptance_items() {
        let doc = parse(DOC);
        let acceptance = &doc.tasks()[0].acceptance;
        assert_eq!(acceptance.len(), 2);
        assert!(!acceptance[0].checked);
        assert!(acceptance[1].checked);
        assert!(!doc.tasks()[0].acceptance_met());
    }

    #[test]
    fn stats_total_matches_sum() {
        let doc = parse(DOC);
        let stats = doc.stats();
        assert_eq!(
            stats.total(),
            stats.pending + stats.in_progress + stats.completed
        );
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn empty_document_has_no_tasks_and_no_issues() {
        let doc = parse("");
        assert!(doc.tasks().is_empty());
        assert!(doc.issues().is_empty());
        assert_eq!(doc.stats(), TaskStats::default());
        assert!(doc.stats().is_done());
    }

    #[test]
    fn render_round_trips_unchanged_document() {
        let doc = parse(DOC);
        assert_eq!(doc.render(), DOC);

        // parse . render . parse is a fixpoint
        let reparsed = parse(&doc.render());
        assert_eq!(reparsed.tasks(), doc.tasks());
    }

    #[test]
    fn dotted_ids_and_uppercase_marks() {
        let doc = parse("- [X] 4.2.1 Deep task\n");
        assert_eq!(doc.tasks()[0].id, "4.2.1");
        assert_eq!(doc.tasks()[0].status, TaskStatus::Completed);
    }

    #[test]
    fn mark_with_inner_whitespace_is_tolerated() {
        let doc = parse("- [ x ] 1. Spaced mark\n");
        assert_eq!(doc.tasks()[0].status, TaskStatus::Completed);
    }

    #[test]
    fn invalid_mark_yields_issue_not_task() {
        let doc = parse("- [z] 1. Broken\n- [ ] 2. Fine\n");
        assert_eq!(doc.tasks().len(), 1);
        assert_eq!(doc.issues().len(), 1);
        assert_eq!(doc.issues()[0].kind, IssueKind::InvalidMark);
        assert_eq!(doc.issues()[0].line, 1);
    }

    #[test]
    fn numbered_line_without_checkbox_is_flagged() {
        let doc = parse("- 1. Forgot the box\n");
        assert!(doc.tasks().is_empty());
        assert_eq!(doc.issues()[0].kind, IssueKind::MissingCheckbox);
    }

    #[test]
    fn duplicate_ids_are_errors() {
        let doc = parse("- [ ] 1. First\n- [ ] 1. Again\n");
        assert_eq!(doc.tasks().len(), 2);
        assert!(doc
            .issues()
            .iter()
            .any(|i| i.kind == IssueKind::DuplicateId));
    }

    #[test]
    fn non_monotonic_ids_are_warnings() {
        let doc = parse("- [ ] 2. Second\n- [ ] 1. First\n");
        let issue = doc
            .issues()
            .iter()
            .find(|i| i.kind == IssueKind::NonMonotonicId)
            .expect("monotonicity issue");
        assert_eq!(issue.severity, Severity::Warning);
    }

    #[test]
    fn validate_flags_completed_without_files() {
        let mock = MockPatterns::default();
        let issues = validate("- [x] 1. Done with nothing\n", &mock);
        assert!(issues.iter().any(|i| i.kind == IssueKind::MissingFiles));
    }

    #[test]
    fn validate_flags_completed_with_only_test_files() {
        let mock = MockPatterns::default();
        let text = "- [x] 1. Only tests\n  - **Files**:\n    - tests/foo_test.rs\n";
        let issues = validate(text, &mock);
        assert!(issues.iter().any(|i| i.kind == IssueKind::MockOnlyFiles));
    }

    #[test]
    fn reset_unimplemented_rewrites_missing_implementations() {
        let mock = MockPatterns::default();
        let probe = FakeProbe::with(&[]);
        let text = "- [x] 2 Implement repo\n  - **Files**:\n    - src/foo.ts\n";

        let outcome = reset_unimplemented(text, &probe, &mock);
        assert_eq!(outcome.changed_ids, vec!["2"]);
        assert!(outcome.text.contains("- [-] 2 Implement repo"));
    }

    #[test]
    fn reset_unimplemented_keeps_existing_implementations() {
        let mock = MockPatterns::default();
        let probe = FakeProbe::with(&["src/wiring.rs", "src/foo.rs"]);
        let outcome = reset_unimplemented(DOC, &probe, &mock);
        assert!(outcome.changed_ids.is_empty());
        assert_eq!(outcome.text, DOC);
    }

    #[test]
    fn reset_unimplemented_is_idempotent() {
        let mock = MockPatterns::default();
        let probe = FakeProbe::with(&[]);
        let text = "- [x] 1. Ghost work\n  - **Files**:\n    - src/ghost.rs\n";

        let first = reset_unimplemented(text, &probe, &mock);
        let second = reset_unimplemented(&first.text, &probe, &mock);
        assert!(second.changed_ids.is_empty());
        assert_eq!(second.text, first.text);
    }

    #[test]
    fn reset_preserves_unrelated_bytes() {
        let mock = MockPatterns::default();
        let probe = FakeProbe::with(&[]);
        let text = "intro prose\n\n- [x] 1. Ghost\n  - **Files**:\n    - src/ghost.rs\n  - custom note kept verbatim\n";

        let outcome = reset_unimplemented(text, &probe, &mock);
        assert!(outcome.text.starts_with("intro prose\n\n- [-] 1. Ghost\n"));
        assert!(outcome.text.contains("custom note kept verbatim"));
    }

    #[test]
    fn promote_requires_files_and_acceptance() {
        let mock = MockPatterns::default();
        let text = "\
- [-] 1. Almost done
  - **Files**:
    - src/a.rs
  - **Acceptance**:
    - [x] works
- [-] 2. Acceptance unmet
  - **Files**:
    - src/b.rs
  - **Acceptance**:
    - [ ] not yet
- [-] 3. File missing
  - **Files**:
    - src/missing.rs
";
        let probe = FakeProbe::with(&["src/a.rs", "src/b.rs"]);
        let outcome = promote_verified(text, &probe, &mock);
        assert_eq!(outcome.changed_ids, vec!["1"]);
        assert!(outcome.text.contains("- [x] 1. Almost done"));
        assert!(outcome.text.contains("- [-] 2. Acceptance unmet"));
        assert!(outcome.text.contains("- [-] 3. File missing"));
    }

    #[test]
    fn promote_ignores_mock_only_file_sets() {
        let mock = MockPatterns::default();
        let text = "- [-] 1. Tests only\n  - **Files**:\n    - tests/only_test.rs\n";
        let probe = FakeProbe::with(&["tests/only_test.rs"]);
        let outcome = promote_verified(text, &probe, &mock);
        assert!(outcome.changed_ids.is_empty());
    }
}
