//! The interactive line loop.

use cubescript::CsState;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use crate::config::ReplConfig;

pub fn run(cs: &mut CsState, cfg: &ReplConfig, keep_history: bool) -> Result<(), String> {
    let mut rl =
        DefaultEditor::new().map_err(|e| format!("failed to start line editor: {}", e))?;
    let history = keep_history.then(|| cfg.history_path()).flatten();
    if let Some(path) = &history {
        // a missing history file is fine on first run
        let _ = rl.load_history(path);
    }

    loop {
        match rl.readline(&cfg.prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == ":quit" || line == ":q" {
                    break;
                }
                let _ = rl.add_history_entry(line);
                let out = cs.run_str(line);
                if !out.is_empty() {
                    println!("{}", out);
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(format!("readline failed: {}", e)),
        }
    }

    if let Some(path) = &history {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let _ = rl.save_history(path);
    }
    Ok(())
}
