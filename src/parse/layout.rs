//! `%%score` / `%%staves` layout mini-language
//!
//! Space-separated voice ids, `(...)` overlay groups sharing one staff,
//! `{...}` brace (grand staff) groups, `[...]` bracket part-groups. `|`
//! barline-connect hints and `*` markers are accepted and ignored.

use crate::diagnostics::Diagnostics;
use crate::models::ScoreNode;

/// Parse a layout directive value into a list of top-level nodes
pub fn parse_score_directive(text: &str, diags: &mut Diagnostics) -> Vec<ScoreNode> {
    let mut chars = text.chars().peekable();
    let nodes = parse_nodes(&mut chars, None, diags);
    nodes
}

fn parse_nodes(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    closing: Option<char>,
    diags: &mut Diagnostics,
) -> Vec<ScoreNode> {
    let mut nodes = Vec::new();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() || c == '|' || c == '*' => {
                chars.next();
            }
            '(' => {
                chars.next();
                let ids = parse_overlay_ids(chars, diags);
                if !ids.is_empty() {
                    nodes.push(ScoreNode::Overlay(ids));
                }
            }
            '{' => {
                chars.next();
                let children = parse_nodes(chars, Some('}'), diags);
                if !children.is_empty() {
                    nodes.push(ScoreNode::Brace(children));
                }
            }
            '[' => {
                chars.next();
                let children = parse_nodes(chars, Some(']'), diags);
                if !children.is_empty() {
                    nodes.push(ScoreNode::Bracket(children));
                }
            }
            '}' | ']' => {
                chars.next();
                if Some(c) == closing {
                    return nodes;
                }
                // Mismatched close: treat as already closed and continue
                diags.warn("layout_mismatch", format!("unmatched '{}' in layout directive", c));
            }
            ')' => {
                chars.next();
                diags.warn("layout_mismatch", "unmatched ')' in layout directive");
            }
            _ => {
                if let Some(id) = read_voice_id(chars) {
                    nodes.push(ScoreNode::Voice(id));
                } else {
                    let skipped = chars.next();
                    if let Some(s) = skipped {
                        diags.warn(
                            "layout_skip",
                            format!("skipped '{}' in layout directive", s),
                        );
                    }
                }
            }
        }
    }
    if closing.is_some() {
        diags.warn("layout_mismatch", "layout group never closed; closing it at end of directive");
    }
    nodes
}

fn parse_overlay_ids(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    diags: &mut Diagnostics,
) -> Vec<String> {
    let mut ids = Vec::new();
    while let Some(&c) = chars.peek() {
        if c == ')' {
            chars.next();
            return ids;
        }
        if c.is_whitespace() || c == '|' || c == '*' {
            chars.next();
            continue;
        }
        match read_voice_id(chars) {
            Some(id) => ids.push(id),
            None => {
                chars.next();
            }
        }
    }
    diags.warn("layout_mismatch", "overlay group never closed");
    ids
}

fn read_voice_id(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<String> {
    let mut id = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
            id.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<ScoreNode> {
        let mut diags = Diagnostics::new();
        parse_score_directive(text, &mut diags)
    }

    #[test]
    fn test_flat_voices() {
        assert_eq!(
            parse("1 2 3"),
            vec![
                ScoreNode::Voice("1".into()),
                ScoreNode::Voice("2".into()),
                ScoreNode::Voice("3".into()),
            ]
        );
    }

    #[test]
    fn test_overlay_group() {
        assert_eq!(
            parse("(S A) (T B)"),
            vec![
                ScoreNode::Overlay(vec!["S".into(), "A".into()]),
                ScoreNode::Overlay(vec!["T".into(), "B".into()]),
            ]
        );
    }

    #[test]
    fn test_brace_with_overlay() {
        assert_eq!(
            parse("{(RH1 RH2) LH}"),
            vec![ScoreNode::Brace(vec![
                ScoreNode::Overlay(vec!["RH1".into(), "RH2".into()]),
                ScoreNode::Voice("LH".into()),
            ])]
        );
    }

    #[test]
    fn test_bracket_group() {
        assert_eq!(
            parse("[V1 V2] V3"),
            vec![
                ScoreNode::Bracket(vec![
                    ScoreNode::Voice("V1".into()),
                    ScoreNode::Voice("V2".into()),
                ]),
                ScoreNode::Voice("V3".into()),
            ]
        );
    }

    #[test]
    fn test_mismatched_close_heals() {
        let mut diags = Diagnostics::new();
        let nodes = parse_score_directive("1 } 2", &mut diags);
        assert_eq!(nodes.len(), 2);
        assert!(!diags.is_empty());
    }

    #[test]
    fn test_barline_connect_ignored() {
        assert_eq!(
            parse("1 | 2"),
            vec![ScoreNode::Voice("1".into()), ScoreNode::Voice("2".into())]
        );
    }
}
