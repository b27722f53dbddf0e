//! Common-context trimmer for modification edits.
//!
//! Given a matched target and its replacement, compute the longest shared
//! prefix and suffix that can be safely left untouched, so the recorded
//! change covers only what actually differs. "Safely" means:
//!
//! * never split inside a word in either string (back off to a
//!   whitespace boundary);
//! * never strip part of a heading marker run (back off to the start of
//!   the line containing the `#`s);
//! * never cut through an unbalanced `**` or `_` delimiter pair;
//! * a suffix that is purely whitespace is dropped entirely, so
//!   `"word " -> "word2 "` produces one clean replacement instead of a
//!   delete/space/insert fragment sandwich.
//!
//! Returned lengths are byte lengths. The shared regions are identical
//! character sequences in both strings, so a single pair of lengths
//! applies to both.

/// Compute `(prefix_len, suffix_len)` in bytes for `target` vs `new_val`.
pub fn trim_common_context(target: &str, new_val: &str) -> (usize, usize) {
    if target.is_empty() || new_val.is_empty() {
        return (0, 0);
    }

    let t: Vec<char> = target.chars().collect();
    let n: Vec<char> = new_val.chars().collect();

    let mut prefix = 0;
    let limit = t.len().min(n.len());
    while prefix < limit && t[prefix] == n[prefix] {
        prefix += 1;
    }

    // Back off to a word boundary when the cut lands mid-word in
    // either string: the kept prefix is identical in both, but the
    // character after the cut may continue a word in only one of them.
    while prefix > 0
        && !t[prefix - 1].is_whitespace()
        && (nonspace_at(&t, prefix) || nonspace_at(&n, prefix))
    {
        prefix -= 1;
    }

    // If the prefix swallowed part of a heading marker run, retreat to
    // the start of that line.
    let mut probe = prefix;
    while probe > 0 {
        let c = t[probe - 1];
        if c == '#' {
            prefix = probe - 1;
            while prefix > 0 && t[prefix - 1] != '\n' {
                prefix -= 1;
            }
            break;
        }
        if c == '\n' {
            break;
        }
        probe -= 1;
    }

    // Keep the prefix balanced with respect to inline delimiters.
    while prefix > 0 {
        match unbalanced_delimiter_index(&t[..prefix]) {
            Some(idx) => prefix = idx,
            None => break,
        }
    }

    let mut suffix = 0;
    let limit_suffix = (t.len() - prefix).min(n.len() - prefix);
    while suffix < limit_suffix && t[t.len() - 1 - suffix] == n[n.len() - 1 - suffix] {
        suffix += 1;
    }

    // Mirror of the prefix rule: the kept suffix is identical in both
    // strings, but the character just before it may continue a word in
    // only one of them.
    while suffix > 0
        && !t[t.len() - suffix].is_whitespace()
        && (nonspace_before_suffix(&t, suffix) || nonspace_before_suffix(&n, suffix))
    {
        suffix -= 1;
    }

    // An unbalanced delimiter in the would-be-kept suffix means it
    // contains half of a pair. Shrink until balanced.
    while suffix > 0 {
        if unbalanced_delimiter_index(&t[t.len() - suffix..]).is_some() {
            suffix -= 1;
        } else {
            break;
        }
    }

    // A whitespace-only suffix fragments the change for no benefit.
    if suffix > 0 && t[t.len() - suffix..].iter().all(|c| c.is_whitespace()) {
        suffix = 0;
    }

    let prefix_bytes: usize = t[..prefix].iter().map(|c| c.len_utf8()).sum();
    let suffix_bytes: usize = t[t.len() - suffix..].iter().map(|c| c.len_utf8()).sum();
    (prefix_bytes, suffix_bytes)
}

fn nonspace_at(s: &[char], idx: usize) -> bool {
    s.get(idx).is_some_and(|c| !c.is_whitespace())
}

fn nonspace_before_suffix(s: &[char], suffix: usize) -> bool {
    s.len()
        .checked_sub(suffix + 1)
        .is_some_and(|i| !s[i].is_whitespace())
}

/// Index (in chars) of the last unpaired `**` or `_` in the slice, or
/// `None` when balanced. Counting is a conservative proxy for real
/// delimiter parsing: a stray snake_case underscore only costs us a
/// slightly larger recorded change, never a corrupted one.
fn unbalanced_delimiter_index(slice: &[char]) -> Option<usize> {
    let mut bold_starts = Vec::new();
    let mut i = 0;
    while i + 1 < slice.len() {
        if slice[i] == '*' && slice[i + 1] == '*' {
            bold_starts.push(i);
            i += 2;
        } else {
            i += 1;
        }
    }
    if bold_starts.len() % 2 != 0 {
        return bold_starts.last().copied();
    }

    let underscores: Vec<usize> = slice
        .iter()
        .enumerate()
        .filter(|(_, &c)| c == '_')
        .map(|(i, _)| i)
        .collect();
    if underscores.len() % 2 != 0 {
        return underscores.last().copied();
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_change_isolated() {
        let (p, s) = trim_common_context("the deliver clause", "the ship clause");
        assert_eq!(&"the deliver clause"[p.."the deliver clause".len() - s], "deliver");
        assert_eq!(&"the ship clause"[p.."the ship clause".len() - s], "ship");
    }

    #[test]
    fn test_no_mid_word_split() {
        // Shared "deliver" prefix of "deliverable" must not be trimmed.
        let (p, _) = trim_common_context("deliverable goods", "delivery goods");
        assert_eq!(p, 0);
    }

    #[test]
    fn test_whitespace_only_suffix_dropped() {
        let (p, s) = trim_common_context("word ", "word2 ");
        assert_eq!(p, 0);
        assert_eq!(s, 0);
    }

    #[test]
    fn test_prefix_backoff_checks_replacement_word() {
        // The shared prefix "word" would split the new token "word2";
        // the whole token is replaced instead.
        let (p, s) = trim_common_context("word", "word2");
        assert_eq!((p, s), (0, 0));
    }

    #[test]
    fn test_suffix_backoff_checks_replacement_word() {
        // Keeping "word" would leave a bare "s" inserted inside the new
        // token "sword"; the whole token is replaced instead.
        let (p, s) = trim_common_context("x word", "x sword");
        assert_eq!(p, "x ".len());
        assert_eq!(s, 0);
    }

    #[test]
    fn test_heading_marker_backoff() {
        // The common "## " prefix retreats to the line start so heading
        // markers are never half-trimmed.
        let (p, _) = trim_common_context("## Old Title", "## New Title");
        assert_eq!(p, 0);
    }

    #[test]
    fn test_unbalanced_bold_prefix_backoff() {
        // Shared prefix "a **bo" would strand an opening "**".
        let (p, _) = trim_common_context("a **bold** x", "a **bolt** x");
        assert!(p <= 2, "prefix {p} must not cut into the bold pair");
    }

    #[test]
    fn test_balanced_delimiters_kept() {
        let (p, s) = trim_common_context("**bold** old tail", "**bold** new tail");
        assert_eq!(p, "**bold** ".len());
        assert_eq!(s, " tail".len());
    }

    #[test]
    fn test_empty_side_trims_nothing() {
        assert_eq!(trim_common_context("", "x"), (0, 0));
        assert_eq!(trim_common_context("x", ""), (0, 0));
    }

    #[test]
    fn test_multibyte_safe() {
        let (p, s) = trim_common_context("caf\u{e9} au lait", "caf\u{e9} du lait");
        let target = "caf\u{e9} au lait";
        assert!(target.is_char_boundary(p));
        assert!(target.is_char_boundary(target.len() - s));
    }
}
