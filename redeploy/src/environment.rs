//! EnvironmentValidator: make sure the worker's configuration keys are present.

use std::path::PathBuf;

use anyhow::Result;

use crate::core::types::{FailureKind, StageResult};
use crate::io::env_file::{read_env_file, write_placeholder_env};
use crate::stage::{RunContext, Stage};

pub struct EnvironmentValidator {
    /// Absolute path of the dotenv-style configuration file.
    pub file: PathBuf,
    pub required_keys: Vec<String>,
}

impl Stage for EnvironmentValidator {
    fn name(&self) -> &'static str {
        "environment_validator"
    }

    fn required(&self) -> bool {
        false
    }

    fn failure_kind(&self) -> FailureKind {
        FailureKind::NonFatal
    }

    fn run(&self, ctx: &mut RunContext) -> Result<StageResult> {
        let file = ctx.display_path(&self.file);
        if !self.file.exists() {
            let missing = self.missing_keys(ctx);
            if missing.is_empty() {
                return Ok(StageResult::ok(format!(
                    "{} required key(s) present in the process environment; no {file}",
                    self.required_keys.len()
                )));
            }
            write_placeholder_env(&self.file, &missing)?;
            ctx.record_fix(format!("created placeholder {file}"));
            let message = format!(
                "{file} was missing; created it with empty values for {}",
                missing.join(", ")
            );
            ctx.warn(message.clone());
            return Ok(StageResult::warned(message));
        }

        // Values already in the process environment take precedence.
        for (key, value) in read_env_file(&self.file)? {
            ctx.env.entry(key).or_insert(value);
        }

        let missing = self.missing_keys(ctx);
        if missing.is_empty() {
            return Ok(StageResult::ok(format!(
                "{} required key(s) present",
                self.required_keys.len()
            )));
        }

        let message = format!("missing or empty keys in {file}: {}", missing.join(", "));
        ctx.warn(message.clone());
        Ok(StageResult::warned(message))
    }
}

impl EnvironmentValidator {
    fn missing_keys(&self, ctx: &RunContext) -> Vec<String> {
        self.required_keys
            .iter()
            .filter(|key| ctx.env.get(*key).is_none_or(|v| v.trim().is_empty()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StageStatus;
    use crate::test_support::TestTree;

    fn validator(tree: &TestTree) -> EnvironmentValidator {
        EnvironmentValidator {
            file: tree.path().join(".env"),
            required_keys: vec!["BOT_TOKEN".to_string(), "CHAT_ID".to_string()],
        }
    }

    #[test]
    fn missing_file_is_synthesized_with_placeholders() {
        let tree = TestTree::new();
        let mut ctx = tree.context();

        let result = validator(&tree).run(&mut ctx).expect("run");

        assert_eq!(result.status, StageStatus::Warned);
        let written = tree.read(".env");
        assert!(written.contains("BOT_TOKEN=\n"));
        assert!(written.contains("CHAT_ID=\n"));
        assert_eq!(ctx.applied_fixes, vec!["created placeholder .env"]);
    }

    #[test]
    fn missing_file_is_not_needed_when_process_environment_is_complete() {
        let tree = TestTree::new();
        let mut ctx = tree.context();
        ctx.env.insert("BOT_TOKEN".to_string(), "abc".to_string());
        ctx.env.insert("CHAT_ID".to_string(), "42".to_string());

        let result = validator(&tree).run(&mut ctx).expect("run");

        assert_eq!(result.status, StageStatus::Ok, "{}", result.message);
        assert!(!tree.path().join(".env").exists());
        assert!(ctx.warnings.is_empty());
        assert!(ctx.applied_fixes.is_empty());
    }

    #[test]
    fn placeholder_only_lists_keys_the_process_lacks() {
        let tree = TestTree::new();
        let mut ctx = tree.context();
        ctx.env.insert("BOT_TOKEN".to_string(), "abc".to_string());

        let result = validator(&tree).run(&mut ctx).expect("run");

        assert_eq!(result.status, StageStatus::Warned);
        assert!(result.message.ends_with("empty values for CHAT_ID"), "{}", result.message);
        let written = tree.read(".env");
        assert!(written.contains("CHAT_ID=\n"));
        assert!(!written.contains("BOT_TOKEN"));
    }

    #[test]
    fn placeholder_run_then_rerun_reports_missing_values() {
        let tree = TestTree::new();
        let stage = validator(&tree);
        stage.run(&mut tree.context()).expect("first");

        let mut ctx = tree.context();
        let result = stage.run(&mut ctx).expect("second");
        assert_eq!(result.status, StageStatus::Warned);
        assert!(result.message.contains("BOT_TOKEN, CHAT_ID"));
        assert!(ctx.applied_fixes.is_empty());
    }

    #[test]
    fn complete_file_is_ok_and_merged_into_context() {
        let tree = TestTree::new();
        tree.write(".env", "BOT_TOKEN=abc\nCHAT_ID=42\nEXTRA=1\n");
        let mut ctx = tree.context();

        let result = validator(&tree).run(&mut ctx).expect("run");

        assert_eq!(result.status, StageStatus::Ok);
        assert_eq!(ctx.env["EXTRA"], "1");
    }

    #[test]
    fn process_environment_fills_gaps_and_wins() {
        let tree = TestTree::new();
        tree.write(".env", "BOT_TOKEN=from-file\nCHAT_ID=\n");
        let mut ctx = tree.context();
        ctx.env.insert("CHAT_ID".to_string(), "7".to_string());
        ctx.env.insert("BOT_TOKEN".to_string(), "from-env".to_string());

        let result = validator(&tree).run(&mut ctx).expect("run");

        assert_eq!(result.status, StageStatus::Ok);
        assert_eq!(ctx.env["BOT_TOKEN"], "from-env");
    }
}
