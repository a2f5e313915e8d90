//! Run lookup by id, id prefix, or name.

use std::sync::Arc;

use thiserror::Error;

use super::record::Run;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("run {0} not found")]
    NotFound(String),

    #[error("no run matches {0:?}; try `moat list` to see available runs")]
    NoMatch(String),
}

/// Whether a string is a syntactically valid full run id.
pub fn is_run_id(s: &str) -> bool {
    s.len() == 16
        && s.starts_with("run_")
        && s[4..]
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Resolve an argument to matching runs.
///
/// A full run id must match exactly. A `run_` prefix matches any run whose
/// id begins with it. Anything else matches runs by exact name. Multi-match
/// results come back newest first; disambiguation is the caller's problem.
pub fn resolve(runs: &[Arc<Run>], arg: &str) -> Result<Vec<Arc<Run>>, ResolveError> {
    if is_run_id(arg) {
        return runs
            .iter()
            .find(|r| r.id == arg)
            .cloned()
            .map(|r| vec![r])
            .ok_or_else(|| ResolveError::NotFound(arg.to_string()));
    }

    if arg.starts_with("run_") {
        let matches = collect_sorted(runs, |r| r.id.starts_with(arg));
        if !matches.is_empty() {
            return Ok(matches);
        }
    }

    let matches = collect_sorted(runs, |r| r.name == arg);
    if matches.is_empty() {
        return Err(ResolveError::NoMatch(arg.to_string()));
    }
    Ok(matches)
}

fn collect_sorted(runs: &[Arc<Run>], pred: impl Fn(&Run) -> bool) -> Vec<Arc<Run>> {
    let mut matches: Vec<Arc<Run>> = runs.iter().filter(|r| pred(r)).cloned().collect();
    matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::record::RunParams;
    use crate::run::RunState;
    use chrono::{Duration, Utc};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn run(id: &str, name: &str, age_secs: i64) -> Arc<Run> {
        Arc::new(Run::new(RunParams {
            id: id.to_string(),
            name: name.to_string(),
            created_at: Utc::now() - Duration::seconds(age_secs),
            workspace: PathBuf::from("/tmp"),
            grants: Vec::new(),
            agent: String::new(),
            image: String::new(),
            ports: HashMap::new(),
            interactive: false,
            keep_container: false,
            disable_pre_run_snapshot: false,
            firewall_enabled: false,
            proxy_host: String::new(),
            proxy_port: 0,
            proxy_auth_token: None,
        }))
    }

    #[test]
    fn test_is_run_id() {
        assert!(is_run_id("run_aabbccddeeff"));
        assert!(!is_run_id("run_aabb"));
        assert!(!is_run_id("run_AABBCCDDEEFF"));
        assert!(!is_run_id("run_aabbccddeefg"));
        assert!(!is_run_id("quiet-otter"));
    }

    #[test]
    fn test_full_id_matches_exactly() {
        let runs = vec![run("run_aabbccddeeff", "run_my_custom", 0)];

        let matched = resolve(&runs, "run_aabbccddeeff").unwrap();
        assert_eq!(matched.len(), 1);

        let err = resolve(&runs, "run_aabbccddee00").unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[test]
    fn test_prefix_matches() {
        let runs = vec![run("run_aabbccddeeff", "run_my_custom", 0)];

        let matched = resolve(&runs, "run_aabb").unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "run_aabbccddeeff");
    }

    #[test]
    fn test_name_that_looks_like_prefix_is_an_error() {
        // "run_my" begins with the id prefix but matches no id and no exact
        // name, so it resolves to nothing.
        let runs = vec![run("run_aabbccddeeff", "run_my_custom", 0)];

        let err = resolve(&runs, "run_my").unwrap_err();
        assert!(matches!(err, ResolveError::NoMatch(_)));
    }

    #[test]
    fn test_exact_name_match() {
        let runs = vec![run("run_aabbccddeeff", "quiet-otter", 0)];

        let matched = resolve(&runs, "quiet-otter").unwrap();
        assert_eq!(matched.len(), 1);

        let err = resolve(&runs, "quiet").unwrap_err();
        assert!(matches!(err, ResolveError::NoMatch(_)));
    }

    #[test]
    fn test_multi_match_sorted_newest_first() {
        let runs = vec![
            run("run_aa1111111111", "quiet-otter", 300),
            run("run_aa2222222222", "quiet-otter", 10),
            run("run_aa3333333333", "quiet-otter", 100),
        ];

        let by_name = resolve(&runs, "quiet-otter").unwrap();
        let ids: Vec<_> = by_name.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["run_aa2222222222", "run_aa3333333333", "run_aa1111111111"]
        );

        let by_prefix = resolve(&runs, "run_aa").unwrap();
        assert_eq!(by_prefix.len(), 3);
        assert_eq!(by_prefix[0].id, "run_aa2222222222");
    }

    #[test]
    fn test_resolution_ignores_state() {
        let runs = vec![run("run_aabbccddeeff", "quiet-otter", 0)];
        runs[0].set_state_at(RunState::Stopped, Utc::now());

        assert_eq!(resolve(&runs, "quiet-otter").unwrap().len(), 1);
    }
}
