//! Append-only action journal.
//!
//! One JSON object per line. The journal is the only state that survives a
//! restart; [`GuardrailController::restore_from_journal`] replays it.
//!
//! [`GuardrailController::restore_from_journal`]: crate::guardrail::GuardrailController::restore_from_journal

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::guardrail::types::GuardrailAction;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("journal encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Durable sink for guardrail actions.
pub trait ActionJournal: Send + Sync {
    fn append(&self, action: &GuardrailAction) -> Result<(), JournalError>;

    /// Every readable entry, oldest first.
    fn load(&self) -> Result<Vec<GuardrailAction>, JournalError>;
}

/// JSON-lines file journal.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJournal {
    /// Use `path`, creating its parent directory if needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ActionJournal for FileJournal {
    fn append(&self, action: &GuardrailAction) -> Result<(), JournalError> {
        let mut line = serde_json::to_vec(action)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(&line)?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<GuardrailAction>, JournalError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut actions = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(action) => actions.push(action),
                Err(e) => tracing::warn!(
                    path = ?self.path,
                    line = index + 1,
                    error = %e,
                    "Skipping unreadable journal entry"
                ),
            }
        }
        Ok(actions)
    }
}

/// In-memory journal.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    actions: Mutex<Vec<GuardrailAction>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_actions(actions: Vec<GuardrailAction>) -> Self {
        Self {
            actions: Mutex::new(actions),
        }
    }

    pub fn entries(&self) -> Vec<GuardrailAction> {
        self.actions.lock().clone()
    }
}

impl ActionJournal for MemoryJournal {
    fn append(&self, action: &GuardrailAction) -> Result<(), JournalError> {
        self.actions.lock().push(action.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<GuardrailAction>, JournalError> {
        Ok(self.entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrail::types::ActionType;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("pulse-guard-{}-{}.jsonl", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_file_journal_appends_lines() {
        let path = temp_path("journal");
        let journal = FileJournal::open(&path).unwrap();
        assert!(journal.load().unwrap().is_empty());

        let first = GuardrailAction::new(ActionType::MuteAlerts, 10, "storm").for_chain("eth").lasting(30);
        let second = GuardrailAction::new(ActionType::RollbackTuning, 20, "regression");
        journal.append(&first).unwrap();
        journal.append(&second).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert_eq!(journal.load().unwrap(), vec![first, second]);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_skips_corrupt_lines() {
        let path = temp_path("corrupt");
        let action = GuardrailAction::new(ActionType::KillSwitch, 5, "manual");
        let mut content = serde_json::to_string(&action).unwrap();
        content.push_str("\n{not json\n\n");
        fs::write(&path, content).unwrap();

        let journal = FileJournal::open(&path).unwrap();
        assert_eq!(journal.load().unwrap(), vec![action]);

        let _ = fs::remove_file(&path);
    }
}
