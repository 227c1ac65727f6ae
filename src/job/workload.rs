use std::path::Path;

use serde_json::Value;

use crate::error::{BenchError, Result};
use crate::job::state::Mode;

/// Filename of the pre-planned step sequence inside an extracted workload
/// archive. Presence makes the job manual; absence makes it auto.
pub const INSTRUCTION_FILE: &str = "instruction.json";

/// Describes one workload submission: the remote workspace name plus an
/// optional pre-planned step sequence.
#[derive(Debug, Clone)]
pub struct Workload {
    pub name: String,
    /// Ordered step payloads for manual jobs; `None` for auto jobs.
    pub plan: Option<Vec<Value>>,
}

impl Workload {
    pub fn auto(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plan: None,
        }
    }

    pub fn manual(name: impl Into<String>, plan: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            plan: Some(plan),
        }
    }

    pub fn mode(&self) -> Mode {
        if self.plan.is_some() {
            Mode::Manual
        } else {
            Mode::Auto
        }
    }

    /// Build a workload from an extracted archive directory. The directory
    /// name becomes the workload name; an `instruction.json` holding a JSON
    /// array of step objects makes the job manual.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let name = dir
            .file_name()
            .ok_or_else(|| BenchError::Workload(format!("bad workload dir: {}", dir.display())))?
            .to_string_lossy()
            .into_owned();

        let instruction = dir.join(INSTRUCTION_FILE);
        if !instruction.exists() {
            return Ok(Self::auto(name));
        }

        let raw = std::fs::read_to_string(&instruction)?;
        let plan: Vec<Value> = serde_json::from_str(&raw)
            .map_err(|e| BenchError::Workload(format!("invalid {INSTRUCTION_FILE}: {e}")))?;
        if plan.is_empty() {
            return Err(BenchError::Workload(format!(
                "{INSTRUCTION_FILE} contains no steps"
            )));
        }
        Ok(Self::manual(name, plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mode_follows_plan_presence() {
        assert_eq!(Workload::auto("w").mode(), Mode::Auto);
        assert_eq!(Workload::manual("w", vec![json!({})]).mode(), Mode::Manual);
    }

    #[test]
    fn from_dir_without_instruction_is_auto() {
        let dir = tempfile::tempdir().unwrap();
        let w = Workload::from_dir(dir.path()).unwrap();
        assert_eq!(w.mode(), Mode::Auto);
        assert!(w.plan.is_none());
    }

    #[test]
    fn from_dir_with_instruction_is_manual() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(INSTRUCTION_FILE),
            r#"[{"op":"aspirate","vol":50},{"op":"dispense","vol":50}]"#,
        )
        .unwrap();
        let w = Workload::from_dir(dir.path()).unwrap();
        assert_eq!(w.mode(), Mode::Manual);
        assert_eq!(w.plan.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn from_dir_rejects_empty_plan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INSTRUCTION_FILE), "[]").unwrap();
        assert!(matches!(
            Workload::from_dir(dir.path()),
            Err(BenchError::Workload(_))
        ));
    }

    #[test]
    fn from_dir_rejects_malformed_plan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(INSTRUCTION_FILE), "{not json").unwrap();
        assert!(Workload::from_dir(dir.path()).is_err());
    }
}
