use proptest::prelude::*;
use std::path::Path;

use warden::policy::{Policy, PolicyEngine};
use warden::store::sanitize_artifact_path;

// Budget checks violate iff any value strictly exceeds its limit.
proptest! {
    #[test]
    fn test_budget_violation_iff_strict_exceedance(
        max_iterations in 0usize..100,
        max_prompt_tokens in 0usize..10_000,
        max_output_tokens in 0usize..10_000,
        iterations in 0usize..200,
        prompt_tokens in 0usize..20_000,
        output_tokens in 0usize..20_000,
    ) {
        let engine = PolicyEngine::new(Policy {
            max_iterations,
            max_prompt_tokens,
            max_output_tokens,
            ..Policy::default()
        });

        let violation = engine.check_budget(iterations, prompt_tokens, output_tokens);
        let should_violate = iterations > max_iterations
            || prompt_tokens > max_prompt_tokens
            || output_tokens > max_output_tokens;

        prop_assert_eq!(violation.is_some(), should_violate);

        if let Some(v) = violation {
            prop_assert!(v.fatal);
            // The violation names the first rule exceeded, in check
            // order.
            if iterations > max_iterations {
                prop_assert_eq!(v.rule, "max_iterations");
            } else if prompt_tokens > max_prompt_tokens {
                prop_assert_eq!(v.rule, "max_prompt_tokens");
            } else {
                prop_assert_eq!(v.rule, "max_output_tokens");
            }
        }
    }
}

// Exactly at the limit is never a violation.
proptest! {
    #[test]
    fn test_budget_at_limit_passes(
        max_iterations in 0usize..100,
        max_prompt_tokens in 0usize..10_000,
        max_output_tokens in 0usize..10_000,
    ) {
        let engine = PolicyEngine::new(Policy {
            max_iterations,
            max_prompt_tokens,
            max_output_tokens,
            ..Policy::default()
        });

        prop_assert!(engine
            .check_budget(max_iterations, max_prompt_tokens, max_output_tokens)
            .is_none());
    }
}

// The wildcard entry permits any command head.
proptest! {
    #[test]
    fn test_wildcard_allows_any_command(head in "[a-zA-Z][a-zA-Z0-9_-]{0,20}") {
        let engine = PolicyEngine::new(Policy {
            allowed_commands: vec!["*".to_string()],
            ..Policy::default()
        });
        prop_assert!(engine.check_command(&head).is_none());
    }
}

// A listed entry allows itself and anything it prefixes, and nothing
// else is allowed by an unrelated list.
proptest! {
    #[test]
    fn test_prefix_matching(suffix in "[a-z0-9-]{0,10}") {
        let engine = PolicyEngine::new(Policy {
            allowed_commands: vec!["go".to_string()],
            ..Policy::default()
        });

        let go_cmd = format!("go{}", suffix);
        let rust_cmd = format!("rust{}", suffix);
        prop_assert!(engine.check_command(&go_cmd).is_none());
        prop_assert!(engine.check_command(&rust_cmd).is_some());
    }
}

// Artifact paths that are absolute or contain a parent component are
// rejected, whatever surrounds them.
proptest! {
    #[test]
    fn test_traversal_paths_rejected(
        prefix in "[a-z]{0,8}",
        suffix in "[a-z]{1,8}",
    ) {
        let root = Path::new("/srv/warden/artifacts");

        let absolute = format!("/{suffix}");
        prop_assert!(sanitize_artifact_path(root, &absolute).is_err());

        let leading = format!("../{suffix}");
        prop_assert!(sanitize_artifact_path(root, &leading).is_err());

        if !prefix.is_empty() {
            let interior = format!("{prefix}/../{suffix}");
            prop_assert!(sanitize_artifact_path(root, &interior).is_err());
        }
    }
}

// Clean relative paths resolve strictly under the root.
proptest! {
    #[test]
    fn test_clean_paths_stay_under_root(
        segments in prop::collection::vec("[a-z][a-z0-9_.-]{0,12}", 1..5),
    ) {
        // Avoid generating "." or ".." segments outright.
        prop_assume!(segments.iter().all(|s| s != "." && s != ".."));

        let root = Path::new("/srv/warden/artifacts");
        let rel = segments.join("/");

        let resolved = sanitize_artifact_path(root, &rel);
        prop_assert!(resolved.is_ok());
        let resolved = resolved.unwrap();
        prop_assert!(resolved.starts_with(root));
        prop_assert_ne!(resolved.as_path(), root);
    }
}

// File globs: a globstar pattern admits matching paths at any depth and
// nothing else.
proptest! {
    #[test]
    fn test_globstar_file_matching(
        dirs in prop::collection::vec("[a-z]{1,6}", 0..4),
        stem in "[a-z]{1,8}",
    ) {
        let engine = PolicyEngine::new(Policy {
            allowed_file_globs: vec!["**/*.rs".to_string(), "*.rs".to_string()],
            ..Policy::default()
        });

        let mut path = dirs.join("/");
        if !path.is_empty() {
            path.push('/');
        }

        let rs_file = format!("{path}{stem}.rs");
        prop_assert!(engine.check_file(&rs_file).is_none());

        let txt_file = format!("{path}{stem}.txt");
        prop_assert!(engine.check_file(&txt_file).is_some());
    }
}
