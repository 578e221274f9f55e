//! Input normalization applied before code reaches the Engine

/// Join lines ending with the interpreter's `///` continuation token.
///
/// The token comments out the rest of its line and continues the command on
/// the next line, which only works inside do-files. Fragments submitted over
/// the wire are executed line by line, so the join has to happen here.
/// CRLF is normalized as a side effect.
pub fn join_continuations(code: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut pending: Option<String> = None;

    for line in code.replace("\r\n", "\n").replace('\r', "\n").lines() {
        let (joined, continues) = match split_continuation(line) {
            Some(head) => (head, true),
            None => (line, false),
        };

        let mut current = pending.take().unwrap_or_default();
        if !current.is_empty() {
            current.push(' ');
            current.push_str(joined.trim_start());
        } else {
            current.push_str(joined);
        }

        if continues {
            pending = Some(current);
        } else {
            out.push(current);
        }
    }

    // A trailing continuation with no following line submits what it has.
    if let Some(rest) = pending {
        out.push(rest);
    }

    out.join("\n")
}

/// When `line` ends in a continuation token, return the code before it.
fn split_continuation(line: &str) -> Option<&str> {
    let trimmed = line.trim_end();
    let head = trimmed.strip_suffix("///")?;
    // `////` and longer runs are ordinary comments, not continuations.
    if head.ends_with('/') {
        return None;
    }
    Some(head.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_code_is_unchanged() {
        let code = "sysuse auto\nsummarize price";
        assert_eq!(join_continuations(code), code);
    }

    #[test]
    fn test_single_join() {
        let code = "regress price ///\n    mpg weight";
        assert_eq!(join_continuations(code), "regress price mpg weight");
    }

    #[test]
    fn test_chained_joins() {
        let code = "graph twoway ///\n  (scatter price mpg) ///\n  (lfit price mpg)";
        assert_eq!(
            join_continuations(code),
            "graph twoway (scatter price mpg) (lfit price mpg)"
        );
    }

    #[test]
    fn test_token_must_terminate_the_line() {
        // A `///` in the middle of a line is not a continuation.
        let code = "display \"a /// b\" + 1";
        assert_eq!(join_continuations(code), code);
    }

    #[test]
    fn test_four_slashes_is_a_comment_not_a_continuation() {
        let code = "display 1 ////\ndisplay 2";
        assert_eq!(join_continuations(code), code);
    }

    #[test]
    fn test_crlf_input_matches_lf_input() {
        let lf = "regress price ///\n    mpg";
        let crlf = "regress price ///\r\n    mpg";
        assert_eq!(join_continuations(crlf), join_continuations(lf));
    }

    #[test]
    fn test_trailing_continuation_is_kept() {
        assert_eq!(join_continuations("display 1 ///"), "display 1");
    }
}
