//! Detection of repeated sibling patterns ("series") inside one group.
//!
//! Siblings are first clustered by op; within a cluster we look for names
//! that differ only by a number and group maximal runs of consecutive
//! numbers into series like `foo[1-3]`.  Detection is a pure function of a
//! group's immediate children; adoption of the members into a series group
//! node happens in the hierarchy builder.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use ustr::{ustr, Ustr};

use crate::graph::NAMESPACE_DELIM;

/// One member's claim on a candidate series.
#[derive(Debug, Clone)]
struct Candidate {
    member: Ustr,
    id: u64,
}

/// A detected series of two or more siblings with consecutive ids.
#[derive(Debug, Clone)]
pub struct DetectedSeries {
    /// Fully qualified name, e.g. `g/foo[1-3]`.
    pub name: Ustr,
    pub prefix: String,
    pub suffix: String,
    /// Namespace the members live in, empty at the root.
    pub parent: String,
    /// Op shared by every member.
    pub op: Ustr,
    /// Member ids, in run order.
    pub ids: Vec<u64>,
    /// Member node names, in run order.
    pub members: Vec<Ustr>,
}

lazy_static! {
    static ref NUMERIC_SUFFIX_RE: Regex = Regex::new(r"^(\D*)_(\d+)$").unwrap();
    static ref DIGIT_RUN_RE: Regex = Regex::new(r"\d+").unwrap();
}

/// Qualified name for a series, `prefix[start-end]suffix` under `parent`.
pub fn series_node_name(
    prefix: &str,
    suffix: &str,
    parent: &str,
    range: Option<(u64, u64)>,
) -> String {
    let middle = match range {
        Some((start, end)) => format!("{}[{}-{}]{}", prefix, start, end, suffix),
        None => format!("{}#{}", prefix, suffix),
    };
    if parent.is_empty() {
        middle
    } else {
        format!("{}{}{}", parent, NAMESPACE_DELIM, middle)
    }
}

fn split_leaf(name: Ustr) -> (String, String) {
    let text = name.as_str();
    match text.rfind(NAMESPACE_DELIM) {
        Some(idx) => (text[..idx].to_string(), text[idx + 1..].to_string()),
        None => (String::new(), text.to_string()),
    }
}

/// Detect series among `children`, given as `(name, op)` pairs for the op
/// leaves of one group.  With `use_generalized` the number may appear
/// anywhere in the leaf name and each member joins its largest candidate
/// series; otherwise only a trailing `_<number>` counts.
pub fn detect_series(children: &[(Ustr, Ustr)], use_generalized: bool) -> Vec<DetectedSeries> {
    let mut clusters: HashMap<Ustr, Vec<Ustr>> = HashMap::new();
    for (name, op) in children {
        if !op.is_empty() {
            clusters.entry(*op).or_default().push(*name);
        }
    }

    let mut detected = Vec::new();
    for (op, members) in clusters {
        // Isolated clusters can't make series.
        if members.len() <= 1 {
            continue;
        }
        let candidates = if use_generalized {
            candidates_anywhere(&members)
        } else {
            candidates_from_suffixes(&members)
        };
        collect_runs(candidates, op, &mut detected);
    }
    detected.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
    detected
}

type CandidateMap = HashMap<(String, String, String), Vec<Candidate>>;

/// Suffix strategy: split a trailing `_<number>` off the leaf; names
/// without one join as id 0 (so `foo` can head the `foo_1, foo_2` series).
fn candidates_from_suffixes(members: &[Ustr]) -> CandidateMap {
    let mut candidates: CandidateMap = HashMap::new();
    for member in members {
        let (parent, leaf) = split_leaf(*member);
        let (prefix, id, suffix) = match NUMERIC_SUFFIX_RE.captures(&leaf) {
            Some(caps) => (
                caps[1].to_string(),
                caps[2].parse::<u64>().unwrap_or(0),
                String::new(),
            ),
            None => (leaf.clone(), 0, String::new()),
        };
        candidates
            .entry((prefix, suffix, parent))
            .or_default()
            .push(Candidate {
                member: *member,
                id,
            });
    }
    candidates
}

/// Generalized strategy: every digit run in the leaf proposes a candidate
/// series; each member then commits to the candidate with the most claims,
/// preferring the leftmost run on ties.
fn candidates_anywhere(members: &[Ustr]) -> CandidateMap {
    // (prefix, suffix, parent) -> claims across all members.
    let mut claim_counts: HashMap<(String, String, String), usize> = HashMap::new();
    // member -> its possible (key, id) pairs in leaf scan order.
    let mut options: Vec<(Ustr, Vec<((String, String, String), u64)>)> = Vec::new();

    for member in members {
        let (parent, leaf) = split_leaf(*member);
        let mut member_options = Vec::new();
        for run in DIGIT_RUN_RE.find_iter(&leaf) {
            let key = (
                leaf[..run.start()].to_string(),
                leaf[run.end()..].to_string(),
                parent.clone(),
            );
            let id = run.as_str().parse::<u64>().unwrap_or(0);
            member_options.push((key, id));
        }
        if member_options.is_empty() {
            member_options.push(((leaf.clone(), String::new(), parent.clone()), 0));
        }
        for (key, _) in &member_options {
            *claim_counts.entry(key.clone()).or_insert(0) += 1;
        }
        options.push((*member, member_options));
    }

    let mut candidates: CandidateMap = HashMap::new();
    for (member, member_options) in options {
        let mut best: Option<(&(String, String, String), u64, usize)> = None;
        for (key, id) in &member_options {
            let count = claim_counts[key];
            let better = match best {
                Some((_, _, best_count)) => count > best_count,
                None => true,
            };
            if better {
                best = Some((key, *id, count));
            }
        }
        if let Some((key, id, _)) = best {
            candidates
                .entry(key.clone())
                .or_default()
                .push(Candidate { member, id });
        }
    }
    candidates
}

/// Sort each candidate group by id and split it into maximal runs of
/// consecutive ids; runs of two or more become series.
fn collect_runs(candidates: CandidateMap, op: Ustr, out: &mut Vec<DetectedSeries>) {
    for ((prefix, suffix, parent), mut group) in candidates {
        if group.len() < 2 {
            continue;
        }
        group.sort_by_key(|c| c.id);
        let mut run: Vec<&Candidate> = vec![&group[0]];
        for candidate in &group[1..] {
            if candidate.id == run[run.len() - 1].id + 1 {
                run.push(candidate);
                continue;
            }
            finish_run(&run, &prefix, &suffix, &parent, op, out);
            run = vec![candidate];
        }
        finish_run(&run, &prefix, &suffix, &parent, op, out);
    }
}

fn finish_run(
    run: &[&Candidate],
    prefix: &str,
    suffix: &str,
    parent: &str,
    op: Ustr,
    out: &mut Vec<DetectedSeries>,
) {
    if run.len() < 2 {
        return;
    }
    let start = run[0].id;
    let end = run[run.len() - 1].id;
    let name = series_node_name(prefix, suffix, parent, Some((start, end)));
    out.push(DetectedSeries {
        name: ustr(&name),
        prefix: prefix.to_string(),
        suffix: suffix.to_string(),
        parent: parent.to_string(),
        op,
        ids: run.iter().map(|c| c.id).collect(),
        members: run.iter().map(|c| c.member).collect(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn children(names: &[&str]) -> Vec<(Ustr, Ustr)> {
        names.iter().map(|n| (ustr(n), ustr("OP"))).collect()
    }

    #[test]
    fn consecutive_suffixes_form_one_series() {
        let series = detect_series(&children(&["g/foo_1", "g/foo_2", "g/foo_3"]), false);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name.as_str(), "g/foo[1-3]");
        assert_eq!(series[0].ids, vec![1, 2, 3]);
        let members: Vec<&str> = series[0].members.iter().map(|m| m.as_str()).collect();
        assert_eq!(members, vec!["g/foo_1", "g/foo_2", "g/foo_3"]);
    }

    #[test]
    fn a_gap_splits_the_run_and_singletons_drop_out() {
        let series = detect_series(&children(&["foo_1", "foo_2", "foo_4"]), false);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name.as_str(), "foo[1-2]");
        assert_eq!(series[0].ids, vec![1, 2]);
    }

    #[test]
    fn members_with_different_ops_never_mix() {
        let kids = vec![
            (ustr("foo_1"), ustr("A")),
            (ustr("foo_2"), ustr("B")),
            (ustr("foo_3"), ustr("A")),
        ];
        assert!(detect_series(&kids, false).is_empty());
    }

    #[test]
    fn bare_name_heads_the_zero_run() {
        // `foo` participates as id 0, so foo, foo_1, foo_2 is a [0-2] run.
        let series = detect_series(&children(&["foo", "foo_1", "foo_2"]), false);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name.as_str(), "foo[0-2]");
    }

    #[test]
    fn suffix_strategy_ignores_interior_numbers() {
        assert!(detect_series(&children(&["block1a", "block2a", "block3a"]), false).is_empty());
    }

    #[test]
    fn generalized_strategy_matches_interior_numbers() {
        let series = detect_series(&children(&["block1a", "block2a", "block3a"]), true);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name.as_str(), "block[1-3]a");
    }

    #[test]
    fn generalized_strategy_prefers_the_larger_candidate() {
        // `a1b2` could join `a#b2` (three claims) or `a1b#` (one claim);
        // the larger candidate wins.
        let series = detect_series(&children(&["a1b2", "a2b2", "a3b2"]), true);
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name.as_str(), "a[1-3]b2");
        assert_eq!(series[0].members.len(), 3);
    }

    #[test]
    fn series_names_are_parent_qualified() {
        assert_eq!(series_node_name("foo", "", "g/h", Some((1, 3))), "g/h/foo[1-3]");
        assert_eq!(series_node_name("foo", "", "", Some((2, 5))), "foo[2-5]");
        assert_eq!(series_node_name("foo", "x", "", None), "foo#x");
    }
}
