//! Scoping test failures to the current branch.

use crate::core::types::TestFailure;

/// Keep failures whose test file was changed on this branch.
///
/// Failures with no file are kept: they cannot be ruled out. Paths are
/// compared after stripping a leading `./`, and a reported path may be either
/// repository-relative or an absolute path ending in the changed path.
pub fn attributable_failures(failures: &[TestFailure], changed_paths: &[String]) -> Vec<TestFailure> {
    let changed: Vec<&str> = changed_paths.iter().map(|p| normalize(p)).collect();
    failures
        .iter()
        .filter(|failure| match failure.file.as_deref() {
            None => true,
            Some(file) => {
                let file = normalize(file);
                changed
                    .iter()
                    .any(|path| file == *path || file.ends_with(&format!("/{path}")))
            }
        })
        .cloned()
        .collect()
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim();
    trimmed.strip_prefix("./").unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(name: &str, file: Option<&str>) -> TestFailure {
        TestFailure {
            name: name.to_string(),
            file: file.map(str::to_string),
            message: None,
        }
    }

    #[test]
    fn keeps_failures_in_changed_files_and_without_file() {
        let failures = vec![
            failure("touched", Some("tests/api.rs")),
            failure("preexisting", Some("tests/legacy.rs")),
            failure("unknown", None),
        ];
        let changed = vec!["src/api.rs".to_string(), "tests/api.rs".to_string()];
        let names: Vec<String> = attributable_failures(&failures, &changed)
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["touched", "unknown"]);
    }

    #[test]
    fn matches_dot_slash_and_absolute_paths() {
        let failures = vec![
            failure("dot", Some("./tests/a.rs")),
            failure("abs", Some("/work/repo/tests/b.rs")),
            failure("partial", Some("/work/repo/xtests/b.rs")),
        ];
        let changed = vec!["tests/a.rs".to_string(), "./tests/b.rs".to_string()];
        let names: Vec<String> = attributable_failures(&failures, &changed)
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["dot", "abs"]);
    }

    #[test]
    fn nothing_attributable_when_branch_touched_no_tests() {
        let failures = vec![failure("old", Some("tests/old.rs"))];
        assert!(attributable_failures(&failures, &["README.md".to_string()]).is_empty());
    }
}
