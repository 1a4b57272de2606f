//! Structural syntax check used by [`crate::NativeEngine`].
//!
//! Verifies that brackets balance and that string literals and block
//! comments terminate. It does not parse expressions.

use crate::{ScriptError, ScriptResult};

pub(crate) fn check_balanced(code: &str) -> ScriptResult<()> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut chars = code.chars().peekable();
    let mut line = 1;

    while let Some(ch) = chars.next() {
        match ch {
            '\n' => line += 1,
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let opened = line;
                let mut closed = false;
                while let Some(next) = chars.next() {
                    match next {
                        '\n' => line += 1,
                        '*' if chars.peek() == Some(&'/') => {
                            chars.next();
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(syntax(opened, "unterminated block comment"));
                }
            }
            '"' | '\'' | '`' => {
                let opened = line;
                let mut closed = false;
                while let Some(next) = chars.next() {
                    match next {
                        '\\' => {
                            if chars.next() == Some('\n') {
                                line += 1;
                            }
                        }
                        '\n' if ch != '`' => {
                            return Err(syntax(opened, "unterminated string literal"));
                        }
                        '\n' => line += 1,
                        quote if quote == ch => {
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(syntax(opened, "unterminated string literal"));
                }
            }
            '(' | '[' | '{' => stack.push((ch, line)),
            ')' | ']' | '}' => {
                let expected = match ch {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, opened)) => {
                        return Err(syntax(
                            line,
                            &format!("`{ch}` does not close `{open}` opened on line {opened}"),
                        ));
                    }
                    None => return Err(syntax(line, &format!("unexpected `{ch}`"))),
                }
            }
            _ => {}
        }
    }

    match stack.pop() {
        Some((open, opened)) => Err(syntax(opened, &format!("unclosed `{open}`"))),
        None => Ok(()),
    }
}

fn syntax(line: usize, message: &str) -> ScriptError {
    ScriptError::Syntax {
        line,
        message: message.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_balanced_code() {
        let code = "async function run(input) {\n  // ignore ) here\n  const s = \"}\";\n  return { ok: [1, 2] };\n}";
        check_balanced(code).unwrap();
    }

    #[test]
    fn reports_unclosed_brace_line() {
        let err = check_balanced("function f() {\n  return 1;\n").unwrap_err();
        assert_eq!(
            err,
            ScriptError::Syntax {
                line: 1,
                message: "unclosed `{`".into()
            }
        );
    }

    #[test]
    fn rejects_mismatched_and_unterminated() {
        assert!(check_balanced("call(a];").is_err());
        assert!(check_balanced("const s = 'oops;\n").is_err());
        assert!(check_balanced("/* never closed").is_err());
        assert!(check_balanced("}").is_err());
    }
}
