//! Glob pattern matching for datum enumeration.
//!
//! Patterns are matched against slash-separated file paths:
//! - `*` matches any run of characters within one path segment
//! - `?` matches exactly one character within a segment
//! - `[abc]` / `[a-z]` matches any character in the set or range
//! - `[!abc]` or `[^abc]` matches any character NOT in the set
//! - `**` as a whole segment matches zero or more segments
//!
//! `*` and `?` never cross a `/`, so `/*` selects the top-level entries
//! of a commit while `/**` selects entries at every depth.

/// Match a file path against a glob pattern.
///
/// Leading, trailing and repeated slashes are insignificant on both
/// sides; the pattern must cover the entire path.
///
/// # Examples
/// ```
/// use sluice_core::glob::glob_match;
///
/// assert!(glob_match("/*", "/a.txt"));
/// assert!(!glob_match("/*", "/dir/a.txt"));
/// assert!(glob_match("/**", "/dir/a.txt"));
/// assert!(glob_match("/logs/*.gz", "/logs/day1.gz"));
/// ```
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&pattern, &path)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((segment, rest)) => match path.split_first() {
            Some((first, path_rest)) => {
                let seg: Vec<char> = segment.chars().collect();
                let name: Vec<char> = first.chars().collect();
                match_chars(&seg, 0, &name, 0) && match_segments(rest, path_rest)
            }
            None => false,
        },
    }
}

/// Recursive single-segment matching with backtracking for `*`.
fn match_chars(pattern: &[char], pi: usize, name: &[char], ni: usize) -> bool {
    if pi >= pattern.len() {
        return ni >= name.len();
    }

    match pattern[pi] {
        '*' => {
            // collapse consecutive stars
            let mut next = pi;
            while next < pattern.len() && pattern[next] == '*' {
                next += 1;
            }
            if next >= pattern.len() {
                return true;
            }
            (ni..=name.len()).any(|skip| match_chars(pattern, next, name, skip))
        }
        '?' => ni < name.len() && match_chars(pattern, pi + 1, name, ni + 1),
        '[' => {
            if ni >= name.len() {
                return false;
            }
            let (matched, consumed) = match_class(&pattern[pi..], name[ni]);
            matched && match_chars(pattern, pi + consumed, name, ni + 1)
        }
        '\\' if pi + 1 < pattern.len() => {
            ni < name.len()
                && pattern[pi + 1] == name[ni]
                && match_chars(pattern, pi + 2, name, ni + 1)
        }
        c => ni < name.len() && c == name[ni] && match_chars(pattern, pi + 1, name, ni + 1),
    }
}

/// Evaluates a `[...]` class against one character.
///
/// Returns (matched, pattern chars consumed). An unclosed class falls
/// back to matching `[` literally.
fn match_class(pattern: &[char], ch: char) -> (bool, usize) {
    let mut idx = 1;
    let mut negate = false;
    if idx < pattern.len() && (pattern[idx] == '!' || pattern[idx] == '^') {
        negate = true;
        idx += 1;
    }

    let first = idx;
    let mut matched = false;
    let mut closed = false;
    while idx < pattern.len() {
        let c = pattern[idx];
        if c == ']' && idx > first {
            idx += 1;
            closed = true;
            break;
        }
        if idx + 2 < pattern.len() && pattern[idx + 1] == '-' && pattern[idx + 2] != ']' {
            if ch >= c && ch <= pattern[idx + 2] {
                matched = true;
            }
            idx += 3;
            continue;
        }
        if c == ch {
            matched = true;
        }
        idx += 1;
    }

    if !closed {
        return (ch == '[', 1);
    }
    (if negate { !matched } else { matched }, idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_paths() {
        assert!(glob_match("/a.txt", "/a.txt"));
        assert!(glob_match("a.txt", "/a.txt"));
        assert!(glob_match("/dir/a.txt", "/dir/a.txt"));
        assert!(!glob_match("/a.txt", "/b.txt"));
        assert!(!glob_match("/a.txt", "/dir/a.txt"));
    }

    #[test]
    fn star_stays_within_a_segment() {
        assert!(glob_match("/*", "/a.txt"));
        assert!(glob_match("/*.txt", "/a.txt"));
        assert!(!glob_match("/*", "/dir/a.txt"));
        assert!(!glob_match("/*.txt", "/a.gz"));
        assert!(glob_match("/dir/*", "/dir/a.txt"));
        assert!(!glob_match("/dir/*", "/other/a.txt"));
    }

    #[test]
    fn double_star_spans_segments() {
        assert!(glob_match("/**", "/a.txt"));
        assert!(glob_match("/**", "/dir/sub/a.txt"));
        assert!(glob_match("/dir/**", "/dir/sub/a.txt"));
        assert!(!glob_match("/dir/**", "/other/a.txt"));
        assert!(glob_match("/**/leaf.txt", "/a/b/leaf.txt"));
        assert!(glob_match("/**/leaf.txt", "/leaf.txt"));
    }

    #[test]
    fn question_and_classes() {
        assert!(glob_match("/shard-?", "/shard-1"));
        assert!(!glob_match("/shard-?", "/shard-10"));
        assert!(glob_match("/day[0-9].log", "/day5.log"));
        assert!(!glob_match("/day[0-9].log", "/dayX.log"));
        assert!(glob_match("/[!.]*", "/visible"));
        assert!(!glob_match("/[!.]*", "/.hidden"));
    }

    #[test]
    fn root_pattern_matches_only_root() {
        assert!(glob_match("/", "/"));
        assert!(glob_match("", "/"));
        assert!(!glob_match("/", "/a.txt"));
    }

    #[test]
    fn slashes_are_normalized() {
        assert!(glob_match("dir/*", "/dir/a.txt"));
        assert!(glob_match("/dir//*", "/dir/a.txt"));
        assert!(glob_match("/dir/*", "dir/a.txt/"));
    }

    #[test]
    fn escaped_literals() {
        assert!(glob_match("/a\\*b", "/a*b"));
        assert!(!glob_match("/a\\*b", "/axb"));
    }
}
