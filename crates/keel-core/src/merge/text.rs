//! Line-level three-way text merge (diff3).
//!
//! Both sides are diffed against the base with an LCS over lines. Base lines
//! matched on both sides are stable; the spans between stable lines are
//! resolved as a whole: a span changed on one side only takes that side's
//! version, a span changed identically on both sides takes either, and
//! anything else becomes a conflict region with markers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How conflict regions are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStyle {
    /// `<<<<<<<` ours `=======` theirs `>>>>>>>`.
    #[default]
    Merge,
    /// Like `Merge`, plus the base version after `|||||||`.
    Diff3,
}

/// Marker rendering options for one merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarkerStyle {
    pub style: ConflictStyle,
    /// Number of marker characters (7 by default).
    pub size: usize,
    pub ours_label: String,
    pub base_label: String,
    pub theirs_label: String,
}

impl Default for MarkerStyle {
    fn default() -> Self {
        Self {
            style: ConflictStyle::Merge,
            size: 7,
            ours_label: "ours".to_owned(),
            base_label: "base".to_owned(),
            theirs_label: "theirs".to_owned(),
        }
    }
}

/// Result of [`merge_text`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TextMerge {
    Clean(Vec<u8>),
    Conflicted {
        /// The merged content with conflict markers.
        content: Vec<u8>,
        /// Number of conflict regions.
        regions: usize,
    },
}

impl TextMerge {
    /// The merged bytes, with markers if conflicted.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        match self {
            Self::Clean(content) | Self::Conflicted { content, .. } => content,
        }
    }

    #[must_use]
    pub const fn is_clean(&self) -> bool {
        matches!(self, Self::Clean(_))
    }
}

/// Whether content should be treated as binary (NUL in the first 8 KiB).
#[must_use]
pub fn is_binary(data: &[u8]) -> bool {
    let check_len = data.len().min(8192);
    data[..check_len].contains(&0)
}

/// Merge `ours` and `theirs`, both derived from `base`.
#[must_use]
pub fn merge_text(base: &[u8], ours: &[u8], theirs: &[u8], markers: &MarkerStyle) -> TextMerge {
    if ours == theirs || theirs == base {
        return TextMerge::Clean(ours.to_vec());
    }
    if ours == base {
        return TextMerge::Clean(theirs.to_vec());
    }

    let base_lines = split_lines(base);
    let ours_lines = split_lines(ours);
    let theirs_lines = split_lines(theirs);
    let to_ours = lcs_matches(&base_lines, &ours_lines);
    let to_theirs = lcs_matches(&base_lines, &theirs_lines);

    let mut out = Vec::with_capacity(ours.len().max(theirs.len()));
    let mut regions = 0;
    let (mut b, mut o, mut t) = (0, 0, 0);

    loop {
        let next_stable = (b..base_lines.len()).find_map(|i| match (to_ours[i], to_theirs[i]) {
            (Some(oi), Some(ti)) => Some((i, oi, ti)),
            _ => None,
        });
        let (nb, no, nt) =
            next_stable.unwrap_or((base_lines.len(), ours_lines.len(), theirs_lines.len()));

        if (nb, no, nt) == (b, o, t) {
            if next_stable.is_none() {
                break;
            }
            out.extend_from_slice(base_lines[b]);
            b += 1;
            o += 1;
            t += 1;
            continue;
        }

        let base_chunk = &base_lines[b..nb];
        let ours_chunk = &ours_lines[o..no];
        let theirs_chunk = &theirs_lines[t..nt];
        if ours_chunk == base_chunk {
            push_lines(&mut out, theirs_chunk);
        } else if theirs_chunk == base_chunk || ours_chunk == theirs_chunk {
            push_lines(&mut out, ours_chunk);
        } else {
            regions += 1;
            push_conflict(&mut out, markers, base_chunk, ours_chunk, theirs_chunk);
        }
        (b, o, t) = (nb, no, nt);
    }

    if regions == 0 {
        TextMerge::Clean(out)
    } else {
        TextMerge::Conflicted {
            content: out,
            regions,
        }
    }
}

/// Split into lines, each keeping its trailing `\n`.
fn split_lines(data: &[u8]) -> Vec<&[u8]> {
    data.split_inclusive(|&b| b == b'\n').collect()
}

/// Above this many line pairs between the common prefix and suffix, the
/// middle is left unmatched and treated as one changed span.
const MAX_DIFF_CELLS: usize = 1 << 26;

/// For each line of `a`, the index of the line of `b` it is matched with in
/// a longest common subsequence, if any. Matches are strictly increasing.
fn lcs_matches(a: &[&[u8]], b: &[&[u8]]) -> Vec<Option<usize>> {
    let mut matches = vec![None; a.len()];

    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    for (i, slot) in matches.iter_mut().enumerate().take(prefix) {
        *slot = Some(i);
    }
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();
    for k in 0..suffix {
        matches[a.len() - 1 - k] = Some(b.len() - 1 - k);
    }

    let a_mid = &a[prefix..a.len() - suffix];
    let b_mid = &b[prefix..b.len() - suffix];
    if a_mid.len().saturating_mul(b_mid.len()) > MAX_DIFF_CELLS {
        debug!(
            lines = a_mid.len(),
            other = b_mid.len(),
            "diff too large, leaving changed span unmatched"
        );
        return matches;
    }
    let (a_ids, b_ids) = intern(a_mid, b_mid);
    hirschberg(&a_ids, &b_ids, prefix, prefix, &mut matches);
    matches
}

/// Replace lines by small ids so comparisons are integer compares.
fn intern<'a>(a: &[&'a [u8]], b: &[&'a [u8]]) -> (Vec<u32>, Vec<u32>) {
    let mut ids: HashMap<&'a [u8], u32> = HashMap::new();
    let mut to_ids = |lines: &[&'a [u8]]| -> Vec<u32> {
        lines
            .iter()
            .map(|&line| {
                let next = u32::try_from(ids.len()).unwrap_or(u32::MAX);
                *ids.entry(line).or_insert(next)
            })
            .collect()
    };
    let a_ids = to_ids(a);
    let b_ids = to_ids(b);
    (a_ids, b_ids)
}

/// Linear-space LCS: split `a` in half, find where the halves' best
/// alignments meet in `b`, and recurse on both sides.
fn hirschberg(
    a: &[u32],
    b: &[u32],
    a_off: usize,
    b_off: usize,
    matches: &mut [Option<usize>],
) {
    if a.is_empty() || b.is_empty() {
        return;
    }
    if let [only] = a {
        if let Some(j) = b.iter().position(|x| x == only) {
            matches[a_off] = Some(b_off + j);
        }
        return;
    }

    let mid = a.len() / 2;
    let forward = lcs_row(a[..mid].iter(), b.iter());
    let backward = lcs_row(a[mid..].iter().rev(), b.iter().rev());
    let m = b.len();
    let mut split = 0;
    let mut best = 0;
    for j in 0..=m {
        let total = forward[j] + backward[m - j];
        if total > best {
            best = total;
            split = j;
        }
    }

    hirschberg(&a[..mid], &b[..split], a_off, b_off, matches);
    hirschberg(&a[mid..], &b[split..], a_off + mid, b_off + split, matches);
}

/// `row[j]` is the LCS length of all of `a` and the first `j` items of `b`.
fn lcs_row<'a>(
    a: impl Iterator<Item = &'a u32>,
    b: impl Iterator<Item = &'a u32> + Clone,
) -> Vec<u32> {
    let m = b.clone().count();
    let mut prev = vec![0u32; m + 1];
    let mut cur = vec![0u32; m + 1];
    for x in a {
        for (j, y) in b.clone().enumerate() {
            cur[j + 1] = if x == y {
                prev[j] + 1
            } else {
                prev[j + 1].max(cur[j])
            };
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev
}

fn push_lines(out: &mut Vec<u8>, lines: &[&[u8]]) {
    for line in lines {
        out.extend_from_slice(line);
    }
}

/// Lines inside a conflict region always end with a newline so the closing
/// marker starts on its own line.
fn push_region(out: &mut Vec<u8>, lines: &[&[u8]]) {
    push_lines(out, lines);
    if !lines.is_empty() && out.last() != Some(&b'\n') {
        out.push(b'\n');
    }
}

fn push_marker(out: &mut Vec<u8>, ch: u8, size: usize, label: &str) {
    out.extend(std::iter::repeat_n(ch, size));
    if !label.is_empty() {
        out.push(b' ');
        out.extend_from_slice(label.as_bytes());
    }
    out.push(b'\n');
}

fn push_conflict(
    out: &mut Vec<u8>,
    markers: &MarkerStyle,
    base: &[&[u8]],
    ours: &[&[u8]],
    theirs: &[&[u8]],
) {
    push_marker(out, b'<', markers.size, &markers.ours_label);
    push_region(out, ours);
    if markers.style == ConflictStyle::Diff3 {
        push_marker(out, b'|', markers.size, &markers.base_label);
        push_region(out, base);
    }
    push_marker(out, b'=', markers.size, "");
    push_region(out, theirs);
    push_marker(out, b'>', markers.size, &markers.theirs_label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn merge(base: &str, ours: &str, theirs: &str) -> TextMerge {
        merge_text(
            base.as_bytes(),
            ours.as_bytes(),
            theirs.as_bytes(),
            &MarkerStyle::default(),
        )
    }

    fn text(m: &TextMerge) -> &str {
        std::str::from_utf8(m.content()).unwrap()
    }

    #[test]
    fn disjoint_edits_merge_cleanly() {
        let base = "a\nb\nc\nd\ne\n";
        let ours = "A\nb\nc\nd\ne\n";
        let theirs = "a\nb\nc\nd\nE\n";
        let merged = merge(base, ours, theirs);
        assert!(merged.is_clean());
        assert_eq!(text(&merged), "A\nb\nc\nd\nE\n");
    }

    #[test]
    fn insertions_on_both_sides() {
        let base = "one\ntwo\nthree\n";
        let ours = "zero\none\ntwo\nthree\n";
        let theirs = "one\ntwo\nthree\nfour\n";
        assert_eq!(text(&merge(base, ours, theirs)), "zero\none\ntwo\nthree\nfour\n");
    }

    #[test]
    fn same_change_both_sides_is_clean() {
        let base = "x\ny\nz\n";
        let ours = "x\nY\nz\nextra\n";
        let theirs = "x\nY\nz\n";
        let merged = merge(base, ours, theirs);
        assert!(merged.is_clean());
        assert_eq!(text(&merged), "x\nY\nz\nextra\n");
    }

    #[test]
    fn overlapping_edits_conflict() {
        let base = "a\nb\nc\n";
        let ours = "a\nours\nc\n";
        let theirs = "a\ntheirs\nc\n";
        let merged = merge(base, ours, theirs);
        assert_eq!(
            merged,
            TextMerge::Conflicted {
                content: b"a\n<<<<<<< ours\nours\n=======\ntheirs\n>>>>>>> theirs\nc\n".to_vec(),
                regions: 1,
            }
        );
    }

    #[test]
    fn diff3_style_shows_base() {
        let markers = MarkerStyle {
            style: ConflictStyle::Diff3,
            size: 3,
            ours_label: "HEAD".into(),
            base_label: "merged common ancestors".into(),
            theirs_label: "topic".into(),
        };
        let merged = merge_text(b"v1\n", b"v2\n", b"v3\n", &markers);
        assert_eq!(
            std::str::from_utf8(merged.content()).unwrap(),
            "<<< HEAD\nv2\n||| merged common ancestors\nv1\n===\nv3\n>>> topic\n"
        );
    }

    #[test]
    fn missing_trailing_newline_in_region() {
        let merged = merge("a", "b", "c");
        assert_eq!(text(&merged), "<<<<<<< ours\nb\n=======\nc\n>>>>>>> theirs\n");
    }

    #[test]
    fn add_add_against_empty_base() {
        let merged = merge("", "same\nmine\n", "same\nyours\n");
        assert!(!merged.is_clean());
        assert!(text(&merged).starts_with("<<<<<<< ours\n"));
    }

    #[test]
    fn two_regions_counted() {
        let base = "1\n2\n3\n4\n5\n";
        let ours = "1\nA\n3\n4\nB\n";
        let theirs = "1\nX\n3\n4\nY\n";
        match merge(base, ours, theirs) {
            TextMerge::Conflicted { regions, .. } => assert_eq!(regions, 2),
            TextMerge::Clean(_) => panic!("expected conflicts"),
        }
    }

    fn numbered(n: usize, tag: &str) -> String {
        (0..n).map(|i| format!("line {i}{tag}\n")).collect()
    }

    #[test]
    fn large_file_edited_at_both_ends() {
        let base = numbered(50_000, "");
        let ours = base.replacen("line 0\n", "first\n", 1);
        let theirs = base.replace("line 49999\n", "last\n");
        let merged = merge(&base, &ours, &theirs);
        assert!(merged.is_clean());
        let content = text(&merged);
        assert!(content.starts_with("first\nline 1\n"));
        assert!(content.ends_with("line 49998\nlast\n"));
    }

    #[test]
    fn oversized_rewrite_becomes_one_region() {
        let base = numbered(20_000, "");
        let ours = numbered(20_000, " ours");
        let theirs = numbered(20_000, " theirs");
        match merge(&base, &ours, &theirs) {
            TextMerge::Conflicted { content, regions } => {
                assert_eq!(regions, 1);
                assert!(content.starts_with(b"<<<<<<< ours\nline 0 ours\n"));
                assert!(content.ends_with(b"line 19999 theirs\n>>>>>>> theirs\n"));
            }
            TextMerge::Clean(_) => panic!("expected a conflict"),
        }
    }

    #[test]
    fn shuffled_middle_keeps_longest_match() {
        let a = split_lines(b"x\n1\n2\n3\n4\n5\ny\n");
        let b = split_lines(b"x\n5\n1\n2\n9\n4\n3\ny\n");
        let matched = lcs_matches(&a, &b);
        assert_eq!(matched.iter().flatten().count(), 5);
        assert_eq!(matched[0], Some(0));
        assert_eq!(matched[6], Some(7));
    }

    /// Reference LCS length by the full table.
    fn lcs_len(a: &[&[u8]], b: &[&[u8]]) -> usize {
        let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
        for i in (0..a.len()).rev() {
            for j in (0..b.len()).rev() {
                table[i][j] = if a[i] == b[j] {
                    table[i + 1][j + 1] + 1
                } else {
                    table[i + 1][j].max(table[i][j + 1])
                };
            }
        }
        table[0][0]
    }

    #[test]
    fn binary_detection() {
        assert!(is_binary(b"abc\0def"));
        assert!(!is_binary(b"plain text\n"));
        assert!(!is_binary(b""));
    }

    fn lines() -> impl Strategy<Value = String> {
        prop::collection::vec(prop::sample::select(vec!["a\n", "b\n", "c\n", "d\n", "e"]), 0..12)
            .prop_map(|v| v.concat())
    }

    proptest! {
        #[test]
        fn one_sided_change_takes_that_side(base in lines(), changed in lines()) {
            let m = MarkerStyle::default();
            prop_assert_eq!(
                merge_text(base.as_bytes(), changed.as_bytes(), base.as_bytes(), &m),
                TextMerge::Clean(changed.clone().into_bytes())
            );
            prop_assert_eq!(
                merge_text(base.as_bytes(), base.as_bytes(), changed.as_bytes(), &m),
                TextMerge::Clean(changed.into_bytes())
            );
        }

        #[test]
        fn identical_sides_are_clean(base in lines(), changed in lines()) {
            let m = MarkerStyle::default();
            prop_assert_eq!(
                merge_text(base.as_bytes(), changed.as_bytes(), changed.as_bytes(), &m),
                TextMerge::Clean(changed.into_bytes())
            );
        }

        #[test]
        fn lcs_matches_are_increasing(a in lines(), b in lines()) {
            let a_lines = split_lines(a.as_bytes());
            let b_lines = split_lines(b.as_bytes());
            let matched: Vec<usize> = lcs_matches(&a_lines, &b_lines).into_iter().flatten().collect();
            prop_assert!(matched.windows(2).all(|w| w[0] < w[1]));
        }

        #[test]
        fn lcs_matches_are_longest_and_equal(a in lines(), b in lines()) {
            let a_lines = split_lines(a.as_bytes());
            let b_lines = split_lines(b.as_bytes());
            let matches = lcs_matches(&a_lines, &b_lines);
            for (i, j) in matches.iter().enumerate().filter_map(|(i, j)| j.map(|j| (i, j))) {
                prop_assert_eq!(a_lines[i], b_lines[j]);
            }
            prop_assert_eq!(matches.iter().flatten().count(), lcs_len(&a_lines, &b_lines));
        }
    }
}
