use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crate::error::{ResearchError, Result};

/// Blocking line source used for requests and plan confirmations.
pub trait HumanInput: Send + Sync {
    /// Shows `prompt` and returns the next line without its line terminator.
    fn read_line(&self, prompt: &str) -> Result<String>;
}

/// Reads from the process stdin.
#[derive(Debug, Default)]
pub struct StdinInput;

impl HumanInput for StdinInput {
    fn read_line(&self, prompt: &str) -> Result<String> {
        let mut stdout = io::stdout();
        write!(stdout, "{prompt}").map_err(|e| ResearchError::Input(e.to_string()))?;
        stdout
            .flush()
            .map_err(|e| ResearchError::Input(format!("failed to flush stdout: {e}")))?;

        let mut line = String::new();
        let read = io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| ResearchError::Input(e.to_string()))?;
        if read == 0 {
            return Err(ResearchError::Input("end of input".to_string()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Line editor with history. Multi-line prompts print everything before the
/// last line directly and hand only the last line to the editor.
pub struct EditorInput {
    editor: Mutex<DefaultEditor>,
}

impl EditorInput {
    pub fn new() -> Result<Self> {
        let editor = DefaultEditor::new()
            .map_err(|e| ResearchError::Input(format!("failed to start line editor: {e}")))?;
        Ok(Self {
            editor: Mutex::new(editor),
        })
    }
}

/// Splits a prompt into the text printed up front and the editor prompt.
pub fn split_prompt(prompt: &str) -> (&str, &str) {
    match prompt.rfind('\n') {
        Some(at) => (&prompt[..=at], &prompt[at + 1..]),
        None => ("", prompt),
    }
}

impl HumanInput for EditorInput {
    fn read_line(&self, prompt: &str) -> Result<String> {
        let (preamble, last_line) = split_prompt(prompt);
        if !preamble.is_empty() {
            print!("{preamble}");
            io::stdout()
                .flush()
                .map_err(|e| ResearchError::Input(format!("failed to flush stdout: {e}")))?;
        }

        let mut editor = self
            .editor
            .lock()
            .map_err(|_| ResearchError::Input("line editor lock poisoned".to_string()))?;
        match editor.readline(last_line) {
            Ok(line) => {
                if !line.trim().is_empty() {
                    let _ = editor.add_history_entry(line.as_str());
                }
                Ok(line)
            }
            Err(ReadlineError::Eof) => Err(ResearchError::Input("end of input".to_string())),
            Err(ReadlineError::Interrupted) => Err(ResearchError::Input("interrupted".to_string())),
            Err(e) => Err(ResearchError::Input(e.to_string())),
        }
    }
}

/// The line editor when a terminal is available, plain stdin otherwise.
pub fn default_input() -> Arc<dyn HumanInput> {
    match EditorInput::new() {
        Ok(editor) => Arc::new(editor),
        Err(err) => {
            tracing::debug!(error = %err, "line editor unavailable; reading stdin directly");
            Arc::new(StdinInput)
        }
    }
}
