use std::io::{self, Write};

use crate::MachineError;

/// Pretty-print a structured [`MachineError`], with a caret under the
/// offending instruction when the error has a position in `code`.
/// If `program` is `Some("bfm")`, messages are prefixed with "bfm: ...".
pub fn print_machine_error(program: Option<&str>, code: &str, err: &MachineError) {
    let prefix_program = |msg: &str| {
        if let Some(p) = program {
            format!("{p}: {msg}")
        } else {
            msg.to_string()
        }
    };

    match err {
        MachineError::UnmatchedBracket { ip, direction } => {
            let msg = prefix_program(&format!(
                "Parse error: unmatched bracket '{}' ({direction} scan found no partner)",
                direction.bracket()
            ));
            print_error_with_context(&msg, code, *ip);
        }
        MachineError::InputExhausted { ip } => {
            let msg = prefix_program("Runtime error: input exhausted");
            print_error_with_context(&msg, code, *ip);
        }
        other => {
            eprintln!("{}", prefix_program(&other.to_string()));
            let _ = io::stderr().flush();
        }
    }
}

/// Render output bytes as a bracketed, space-separated list, e.g. `[72 105]`.
pub fn format_bytes(bytes: &[u8]) -> String {
    let items: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
    format!("[{}]", items.join(" "))
}

/// Print a concise error with instruction index and a caret context window,
/// working with UTF-8 by slicing using char indices.
pub fn print_error_with_context(prefix: &str, code: &str, pos: usize) {
    eprintln!("{}", render_error_with_context(prefix, code, pos));
    let _ = io::stderr().flush();
}

/// The three lines printed by [`print_error_with_context`], newline-separated.
pub fn render_error_with_context(prefix: &str, code: &str, pos: usize) -> String {
    // Show a short window around the position for context
    const WINDOW_CHARS: usize = 32;

    let total_chars = code.chars().count();
    let start_char = pos.saturating_sub(WINDOW_CHARS);
    let end_char = (pos + WINDOW_CHARS + 1).min(total_chars);

    let start_byte = char_to_byte_index(code, start_char);
    let end_byte = char_to_byte_index(code, end_char);
    // Newlines inside the window would break the caret alignment.
    let slice: String = code[start_byte..end_byte]
        .chars()
        .map(|c| if c == '\n' || c == '\r' || c == '\t' { ' ' } else { c })
        .collect();

    let caret_offset_chars = pos.saturating_sub(start_char);
    let underline = format!("{}^", " ".repeat(caret_offset_chars));

    format!("{prefix} at instruction {pos}\n  {slice}\n  {underline}")
}

/// Convert a char index into a byte index in the given UTF-8 string.
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices().nth(char_idx).map_or(s.len(), |(byte_idx, _)| byte_idx)
}
