// Scripted Executor
// Test double that decides step outcomes by name and fakes their artifacts

use crate::models::{CommandUnit, Step, StepStatus};
use crate::runners::CommandExecutor;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    failing: HashSet<String>,
    effects: HashMap<String, Vec<PathBuf>>,
    invoked: Mutex<Vec<CommandUnit>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Units with this name exit non-zero
    pub fn fail(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    /// Running a unit with this name writes a small file at `path`, whether or
    /// not it fails
    pub fn creates(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
        self.effects.entry(name.to_string()).or_default().push(path.into());
        self
    }

    /// Names of the executed units, in order
    pub fn invoked(&self) -> Vec<String> {
        self.invoked
            .lock()
            .map(|units| units.iter().map(|u| u.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn was_invoked(&self, name: &str) -> bool {
        self.invoked().iter().any(|n| n == name)
    }

    pub fn unit(&self, name: &str) -> Option<CommandUnit> {
        self.invoked
            .lock()
            .ok()?
            .iter()
            .find(|u| u.name == name)
            .cloned()
    }
}

#[async_trait::async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn execute(&self, unit: &CommandUnit) -> Step {
        if let Ok(mut invoked) = self.invoked.lock() {
            invoked.push(unit.clone());
        }

        for path in self.effects.get(&unit.name).into_iter().flatten() {
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let _ = fs::write(path, "artifact");
        }

        if self.failing.contains(&unit.name) {
            let mut step = Step::new(unit.stage, unit.name.clone(), StepStatus::Failed);
            step.exit_code = Some(1);
            step.add_note(format!("command 1 of {} exited with code 1", unit.commands.len()));
            step
        } else {
            let mut step = Step::succeeded(unit.stage, unit.name.clone());
            step.exit_code = Some(0);
            step
        }
    }
}
