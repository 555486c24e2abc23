//! Interactive shell for ForgeDB.

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::debug;

use forge_storage::Database;

use crate::commands::{Command, CommandOutcome};

/// The prompt shown when waiting for input.
const PROMPT: &str = "db > ";

/// Interactive read-eval-print loop over a database.
pub struct Repl {
    db: Database,
    editor: DefaultEditor,
    history_file: Option<std::path::PathBuf>,
}

impl Repl {
    /// Creates a REPL for an open database, loading history if present.
    pub fn new(db: Database) -> Result<Self> {
        let mut editor = DefaultEditor::new()?;

        let history_file = get_history_file();
        if let Some(ref path) = history_file {
            if path.exists() {
                let _ = editor.load_history(path);
            }
        }

        Ok(Self {
            db,
            editor,
            history_file,
        })
    }

    /// Prints the welcome banner.
    pub fn print_banner(&self) {
        println!("ForgeDB v{}", env!("CARGO_PKG_VERSION"));
        println!("Type 'help' for usage, 'exit' to quit.\n");
    }

    /// Runs the loop until `exit` or end of input, then closes the
    /// database.
    pub fn run(mut self) -> Result<()> {
        loop {
            match self.editor.readline(PROMPT) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(line);

                    match Command::parse(line).execute(&mut self.db)? {
                        CommandOutcome::Continue => {}
                        CommandOutcome::Exit => break,
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }

        self.save_history();
        self.db.close()?;
        Ok(())
    }

    fn save_history(&mut self) {
        if let Some(ref path) = self.history_file {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = self.editor.save_history(path) {
                debug!("failed to save history: {e}");
            }
        }
    }
}

/// Returns the history file path.
fn get_history_file() -> Option<std::path::PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("forgedb").join("history"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_history_file() {
        let path = get_history_file();
        assert!(path.is_some());
        assert!(path.unwrap().ends_with("history"));
    }
}
