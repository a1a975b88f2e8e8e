//! Assembles book requests from positional arguments and/or stdin.

use std::io::{self, IsTerminal, Read};

use anyhow::{Context, Result};
use bookqueue_core::queue::parse_priority;

use crate::cli::Args;

/// Priority given to books listed without an explicit `:PRIORITY`.
pub(crate) const DEFAULT_PRIORITY: i64 = 0;

/// One book the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BookRequest {
    pub id: String,
    pub priority: i64,
}

/// Collects requests from positional BOOK arguments, then from piped stdin.
///
/// Stdin is only read when it is not a terminal.
pub(crate) fn collect_requests(args: &Args) -> Result<Vec<BookRequest>> {
    let mut requests = parse_requests(args.books.iter().map(String::as_str))?;

    if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        requests.extend(parse_requests(buffer.lines())?);
    }
    Ok(requests)
}

/// Parses `ID` or `ID:PRIORITY` entries. Blank lines and `#` comments are skipped.
pub(crate) fn parse_requests<'a>(
    entries: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<BookRequest>> {
    let mut requests = Vec::new();
    for raw in entries {
        let entry = raw.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        let request = match entry.rsplit_once(':') {
            Some((id, priority)) => BookRequest {
                id: id.trim().to_string(),
                priority: parse_priority(id.trim(), priority)
                    .with_context(|| format!("Invalid book request '{entry}'"))?,
            },
            None => BookRequest {
                id: entry.to_string(),
                priority: DEFAULT_PRIORITY,
            },
        };
        if request.id.is_empty() {
            anyhow::bail!("Invalid book request '{entry}': empty id");
        }
        requests.push(request);
    }
    Ok(requests)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn req(id: &str, priority: i64) -> BookRequest {
        BookRequest {
            id: id.to_string(),
            priority,
        }
    }

    #[test]
    fn test_parse_requests_with_and_without_priority() {
        let parsed = parse_requests(["a:5", "b", " c : -2 "]).unwrap();
        assert_eq!(parsed, vec![req("a", 5), req("b", DEFAULT_PRIORITY), req("c", -2)]);
    }

    #[test]
    fn test_parse_requests_skips_blank_and_comment_lines() {
        let parsed = parse_requests("# wanted\n\nabc:1\n".lines()).unwrap();
        assert_eq!(parsed, vec![req("abc", 1)]);
    }

    #[test]
    fn test_parse_requests_rejects_bad_priority() {
        let err = parse_requests(["a:high"]).unwrap_err();
        assert!(err.to_string().contains("a:high"));
        assert!(format!("{err:#}").contains("invalid priority"));
    }

    #[test]
    fn test_parse_requests_rejects_empty_id() {
        assert!(parse_requests([":3"]).is_err());
    }
}
