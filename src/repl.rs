// File: src/repl.rs
//
// Interactive REPL (Read-Eval-Print Loop) for the Ruff programming language.
// Provides an interactive shell for executing Ruff code with features like:
// - Multi-line input support for functions, loops, and control structures
// - Command history with up/down arrow navigation
// - Line editing capabilities
// - Special commands (:help, :clear, :quit, :reset)
// - Persistent VM state across inputs

use crate::vm::VM;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// REPL session that maintains VM state and handles user interaction.
pub struct Repl {
    vm: VM,
    editor: DefaultEditor,
    line_no: usize,
}

impl Repl {
    /// Creates a new REPL session with a fresh VM.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let editor = DefaultEditor::new()?;
        Ok(Repl { vm: VM::new(), editor, line_no: 0 })
    }

    fn show_banner(&self) {
        println!("{}", "╔══════════════════════════════════════════════════════╗".bright_cyan());
        println!(
            "{}",
            "║            Ruff REPL - Interactive Shell             ║".bright_cyan()
        );
        println!("{}", "╚══════════════════════════════════════════════════════╝".bright_cyan());
        println!();
        println!("  {} Use {}{}{}{}",
            "Welcome!".bright_green(),
            ":".bright_blue(),
            "help".bright_yellow(),
            " for commands or ".bright_blue(),
            ":quit".bright_yellow()
        );
        println!("  {} Multi-line input: End with unclosed braces", "Tip:".bright_magenta());
        println!();
    }

    /// Starts the REPL loop.
    pub fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.show_banner();

        let mut buffer = String::new();

        loop {
            let prompt = if buffer.is_empty() {
                "ruff> ".bright_green().to_string()
            } else {
                "....> ".bright_blue().to_string()
            };

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let _ = self.editor.add_history_entry(line.as_str());

                    if buffer.is_empty() && line.trim().starts_with(':') {
                        if self.handle_command(line.trim()) {
                            continue;
                        } else {
                            break;
                        }
                    }

                    buffer.push_str(&line);
                    buffer.push('\n');

                    if is_input_complete(&buffer) {
                        self.eval_input(&buffer);
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C (Ctrl+C to interrupt, :quit to exit)".bright_yellow());
                    buffer.clear();
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "\nGoodbye!".bright_cyan());
                    break;
                }
                Err(err) => {
                    eprintln!("{} {}", "Error:".bright_red(), err);
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handles special REPL commands starting with ':'. Returns true to
    /// continue the REPL, false to quit.
    fn handle_command(&mut self, cmd: &str) -> bool {
        match cmd {
            ":help" | ":h" => {
                self.show_help();
                true
            }
            ":quit" | ":q" | ":exit" => {
                println!("{}", "Goodbye!".bright_cyan());
                false
            }
            ":clear" | ":c" => {
                print!("\x1B[2J\x1B[1;1H");
                self.show_banner();
                true
            }
            ":reset" | ":r" => {
                self.vm = VM::new();
                self.line_no = 0;
                println!("{}", "Environment reset".bright_green());
                true
            }
            _ => {
                println!(
                    "{} Unknown command: {}. Type {}{}{}",
                    "Error:".bright_red(),
                    cmd.bright_yellow(),
                    ":".bright_blue(),
                    "help".bright_yellow(),
                    " for available commands.".bright_blue()
                );
                true
            }
        }
    }

    fn show_help(&self) {
        println!();
        println!("{}", "REPL Commands:".bright_cyan().bold());
        println!();
        println!("  {}{}  Display this help message", ":help".bright_yellow(), " or :h   ".dimmed());
        println!("  {}{}  Exit the REPL", ":quit".bright_yellow(), " or :q   ".dimmed());
        println!("  {}{}  Clear the screen", ":clear".bright_yellow(), " or :c  ".dimmed());
        println!("  {}{}  Reset environment", ":reset".bright_yellow(), " or :r  ".dimmed());
        println!();
        println!("{}", "Navigation:".bright_cyan().bold());
        println!();
        println!("  {}  Navigate command history", "↑/↓ arrows".bright_blue());
        println!("  {}  Interrupt current input", "Ctrl+C    ".bright_blue());
        println!("  {}  Exit REPL", "Ctrl+D    ".bright_blue());
        println!();
        println!("{}", "Multi-line Input:".bright_cyan().bold());
        println!();
        println!("  Leave braces, brackets, or parentheses unclosed to continue");
        println!("  on the next line. Close them to execute the statement.");
        println!();
        println!("{}", "Examples:".bright_cyan().bold());
        println!();
        println!("  {}", "ruff> i64 x = 42;".dimmed());
        println!("  {}", "ruff> print x;".dimmed());
        println!("  {}", "ruff> function greet(str name) -> str {".dimmed());
        println!("  {}", "....>     return \"Hello, \" + name;".dimmed());
        println!("  {}", "....> }".dimmed());
        println!("  {}", "ruff> print greet(\"World\");".dimmed());
        println!();
    }

    /// Compiles and runs one complete chunk of input. Output reaches the
    /// terminal through the VM's own writer (stdout); this only reports
    /// errors, since the language has no implicit last-expression echo.
    fn eval_input(&mut self, input: &str) {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return;
        }

        self.line_no += 1;
        let label = format!("<repl:{}>", self.line_no);
        if let Err(errors) = self.vm.run_source(input, Some(label)) {
            for error in &errors {
                println!("{} {}", "Error:".bright_red().bold(), error.to_string().bright_red());
            }
        }
    }
}

/// Checks whether `input`'s brackets/braces/parens are balanced and it is
/// not left inside an open string or line comment.
fn is_input_complete(input: &str) -> bool {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return true;
    }

    let mut brace_count = 0i32;
    let mut bracket_count = 0i32;
    let mut paren_count = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    let mut in_comment = false;

    for ch in trimmed.chars() {
        if in_comment {
            if ch == '\n' {
                in_comment = false;
            }
            continue;
        }

        if escape_next {
            escape_next = false;
            continue;
        }

        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '#' if !in_string => in_comment = true,
            '{' if !in_string => brace_count += 1,
            '}' if !in_string => brace_count -= 1,
            '[' if !in_string => bracket_count += 1,
            ']' if !in_string => bracket_count -= 1,
            '(' if !in_string => paren_count += 1,
            ')' if !in_string => paren_count -= 1,
            _ => {}
        }
    }

    !in_string && brace_count <= 0 && bracket_count <= 0 && paren_count <= 0
}

impl Default for Repl {
    fn default() -> Self {
        Self::new().expect("failed to create REPL")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_input_is_complete() {
        assert!(is_input_complete("let x := 1"));
        assert!(is_input_complete("func f() { return 1 }"));
    }

    #[test]
    fn unclosed_brace_is_incomplete() {
        assert!(!is_input_complete("func f() {"));
        assert!(!is_input_complete("if true {\n  print(1)"));
    }

    #[test]
    fn braces_inside_strings_do_not_count() {
        assert!(is_input_complete(r#"print("{ not a brace }")"#));
    }

    #[test]
    fn unclosed_string_is_incomplete() {
        assert!(!is_input_complete("let s := \"unterminated"));
    }

    #[test]
    fn line_comment_hides_delimiters() {
        assert!(is_input_complete("let x := 1 # { [ ("));
    }
}
