//! Manual regions inside the generated summary document.
//!
//! A region is the exact text between `<!-- MANUAL:BEGIN <name> -->` and
//! `<!-- MANUAL:END <name> -->`. Scanning never fails: anything that does not
//! form a well-terminated pair is reported as a [`SectionIssue`] and left out.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::document::{DETAIL_DOCUMENTS_HEADING, KNOWLEDGE_HEADING};

pub const MARKER_PREFIX: &str = "<!-- MANUAL:";
pub const MARKER_SUFFIX: &str = " -->";
pub const BEGIN_KEYWORD: &str = "BEGIN ";
pub const END_KEYWORD: &str = "END ";
pub const PRESERVED_HEADING: &str = "## Preserved Manual Sections";

/// Names with a fixed home in the summary. Each is re-inserted directly
/// before its anchor heading.
pub const ANCHORED_SECTIONS: [(&str, &str); 2] = [
    ("Project Notes", KNOWLEDGE_HEADING),
    ("Custom Commands", DETAIL_DOCUMENTS_HEADING),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualSection {
    pub name: String,
    pub content: String,
    /// Byte offset of the BEGIN marker.
    pub start: usize,
    /// Byte offset just past the END marker.
    pub end: usize,
}

impl ManualSection {
    #[must_use]
    pub fn render(&self) -> String {
        render_block(&self.name, &self.content)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SectionIssueKind {
    Malformed,
    Unterminated,
    OrphanEnd,
    MismatchedEnd,
    NestedBegin,
}

impl SectionIssueKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::Unterminated => "unterminated",
            Self::OrphanEnd => "orphan_end",
            Self::MismatchedEnd => "mismatched_end",
            Self::NestedBegin => "nested_begin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionIssue {
    pub kind: SectionIssueKind,
    pub name: Option<String>,
    pub offset: usize,
}

impl Display for SectionIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(
                f,
                "{} manual marker '{name}' at byte {}",
                self.kind.as_str(),
                self.offset
            ),
            None => write!(f, "{} manual marker at byte {}", self.kind.as_str(), self.offset),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SectionScan {
    pub sections: Vec<ManualSection>,
    pub issues: Vec<SectionIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeOutcome {
    pub document: String,
    pub preserved: usize,
    /// Anchored sections whose anchor heading was missing.
    pub dropped: Vec<String>,
}

enum Marker {
    Begin(String),
    End(String),
}

struct OpenSection {
    name: String,
    start: usize,
    content_start: usize,
}

#[must_use]
pub fn begin_marker(name: &str) -> String {
    format!("{MARKER_PREFIX}{BEGIN_KEYWORD}{name}{MARKER_SUFFIX}")
}

#[must_use]
pub fn end_marker(name: &str) -> String {
    format!("{MARKER_PREFIX}{END_KEYWORD}{name}{MARKER_SUFFIX}")
}

#[must_use]
pub fn render_block(name: &str, content: &str) -> String {
    format!("{}{content}{}", begin_marker(name), end_marker(name))
}

/// Returns the anchor heading for a well-known section name.
#[must_use]
pub fn anchor_for(name: &str) -> Option<&'static str> {
    ANCHORED_SECTIONS
        .iter()
        .find(|(anchored, _)| *anchored == name)
        .map(|(_, heading)| *heading)
}

/// Parses the marker starting at `offset`. Returns the marker and the byte
/// length it occupies.
fn parse_marker(text: &str, offset: usize) -> Option<(Marker, usize)> {
    let rest = &text[offset + MARKER_PREFIX.len()..];
    let (is_begin, after_keyword) = if let Some(after) = rest.strip_prefix(BEGIN_KEYWORD) {
        (true, after)
    } else if let Some(after) = rest.strip_prefix(END_KEYWORD) {
        (false, after)
    } else {
        return None;
    };

    let close = after_keyword.find(MARKER_SUFFIX)?;
    let raw_name = &after_keyword[..close];
    if raw_name.contains('\n') || raw_name.contains(MARKER_PREFIX) {
        return None;
    }
    let name = raw_name.trim();
    if name.is_empty() {
        return None;
    }

    let consumed = text.len() - offset - after_keyword.len() + close + MARKER_SUFFIX.len();
    let marker = if is_begin {
        Marker::Begin(name.to_string())
    } else {
        Marker::End(name.to_string())
    };
    Some((marker, consumed))
}

/// Extracts every well-formed manual region from `text`.
#[must_use]
pub fn scan_manual_sections(text: &str) -> SectionScan {
    let mut scan = SectionScan::default();
    let mut open: Option<OpenSection> = None;
    let mut cursor = 0;

    while let Some(found) = text[cursor..].find(MARKER_PREFIX) {
        let offset = cursor + found;
        let Some((marker, consumed)) = parse_marker(text, offset) else {
            scan.issues.push(SectionIssue {
                kind: SectionIssueKind::Malformed,
                name: None,
                offset,
            });
            cursor = offset + MARKER_PREFIX.len();
            continue;
        };
        cursor = offset + consumed;

        match marker {
            Marker::Begin(name) => {
                if let Some(previous) = open.take() {
                    scan.issues.push(SectionIssue {
                        kind: SectionIssueKind::NestedBegin,
                        name: Some(previous.name),
                        offset: previous.start,
                    });
                }
                open = Some(OpenSection {
                    name,
                    start: offset,
                    content_start: cursor,
                });
            }
            Marker::End(name) => match open.take() {
                Some(current) if current.name == name => {
                    scan.sections.push(ManualSection {
                        content: text[current.content_start..offset].to_string(),
                        name,
                        start: current.start,
                        end: cursor,
                    });
                }
                Some(current) => {
                    scan.issues.push(SectionIssue {
                        kind: SectionIssueKind::MismatchedEnd,
                        name: Some(current.name),
                        offset: current.start,
                    });
                    scan.issues.push(SectionIssue {
                        kind: SectionIssueKind::OrphanEnd,
                        name: Some(name),
                        offset,
                    });
                }
                None => scan.issues.push(SectionIssue {
                    kind: SectionIssueKind::OrphanEnd,
                    name: Some(name),
                    offset,
                }),
            },
        }
    }

    if let Some(current) = open {
        scan.issues.push(SectionIssue {
            kind: SectionIssueKind::Unterminated,
            name: Some(current.name),
            offset: current.start,
        });
    }

    scan
}

fn find_heading(document: &str, heading: &str) -> Option<usize> {
    let line = format!("{heading}\n");
    if document.starts_with(&line) {
        return Some(0);
    }
    document.find(&format!("\n{line}")).map(|index| index + 1)
}

/// Splices `sections` into a freshly generated document.
#[must_use]
pub fn merge_manual_sections(generated: &str, sections: &[ManualSection]) -> MergeOutcome {
    let mut anchored: Vec<(usize, String)> = Vec::new();
    let mut trailing = Vec::new();
    let mut dropped = Vec::new();
    let mut preserved = 0;

    for (name, heading) in ANCHORED_SECTIONS {
        let matching: Vec<&ManualSection> = sections
            .iter()
            .filter(|section| section.name == name)
            .collect();
        if matching.is_empty() {
            continue;
        }
        match find_heading(generated, heading) {
            Some(position) => {
                let block: String = matching
                    .iter()
                    .map(|section| format!("{}\n\n", section.render()))
                    .collect();
                preserved += matching.len();
                anchored.push((position, block));
            }
            None => dropped.extend(matching.iter().map(|section| section.name.clone())),
        }
    }

    for section in sections {
        if anchor_for(&section.name).is_none() {
            trailing.push(section.render());
        }
    }

    let mut document = generated.to_string();
    anchored.sort_by(|left, right| right.0.cmp(&left.0));
    for (position, block) in anchored {
        document.insert_str(position, &block);
    }

    if !trailing.is_empty() {
        preserved += trailing.len();
        if !document.ends_with('\n') {
            document.push('\n');
        }
        document.push('\n');
        document.push_str(PRESERVED_HEADING);
        document.push_str("\n\n");
        document.push_str(&trailing.join("\n\n"));
        document.push('\n');
    }

    MergeOutcome {
        document,
        preserved,
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GENERATED: &str = "# demo Project Memory\n\n\
        ## Active Session\n\n_No active session._\n\n\
        ## Knowledge Base\n\n_No knowledge stored yet._\n\n\
        ## Detail Documents\n\n- Sessions\n";

    #[test]
    fn scans_well_formed_sections_in_order() {
        let text = format!(
            "intro\n{}\nfirst\n{}\nmiddle {} tail",
            begin_marker("Project Notes"),
            end_marker("Project Notes"),
            render_block("Extra", "inline")
        );

        let scan = scan_manual_sections(&text);
        assert!(scan.issues.is_empty());
        assert_eq!(scan.sections.len(), 2);
        assert_eq!(scan.sections[0].name, "Project Notes");
        assert_eq!(scan.sections[0].content, "\nfirst\n");
        assert_eq!(scan.sections[1].name, "Extra");
        assert_eq!(scan.sections[1].content, "inline");
        assert_eq!(
            &text[scan.sections[1].start..scan.sections[1].end],
            render_block("Extra", "inline")
        );
    }

    #[test]
    fn unterminated_and_orphan_markers_are_reported_not_preserved() {
        let text = format!(
            "{}\nkept\n{}\n{}\nlost\n{}",
            begin_marker("A"),
            end_marker("A"),
            end_marker("Orphan"),
            begin_marker("B"),
        );

        let scan = scan_manual_sections(&text);
        assert_eq!(scan.sections.len(), 1);
        assert_eq!(scan.sections[0].name, "A");
        let kinds: Vec<_> = scan.issues.iter().map(|issue| issue.kind).collect();
        assert_eq!(
            kinds,
            vec![SectionIssueKind::OrphanEnd, SectionIssueKind::Unterminated]
        );
    }

    #[test]
    fn malformed_and_mismatched_markers_are_reported() {
        let text = format!(
            "<!-- MANUAL:BOGUS x -->\n{}\ninner\n{}",
            begin_marker("Left"),
            end_marker("Right")
        );

        let scan = scan_manual_sections(&text);
        assert!(scan.sections.is_empty());
        let kinds: Vec<_> = scan.issues.iter().map(|issue| issue.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SectionIssueKind::Malformed,
                SectionIssueKind::MismatchedEnd,
                SectionIssueKind::OrphanEnd
            ]
        );
    }

    #[test]
    fn nested_begin_discards_the_outer_section() {
        let text = format!(
            "{}{}inner{}",
            begin_marker("Outer"),
            begin_marker("Inner"),
            end_marker("Inner")
        );
        let scan = scan_manual_sections(&text);
        assert_eq!(scan.sections.len(), 1);
        assert_eq!(scan.sections[0].name, "Inner");
        assert_eq!(scan.issues[0].kind, SectionIssueKind::NestedBegin);
        assert_eq!(scan.issues[0].name.as_deref(), Some("Outer"));
    }

    #[test]
    fn anchored_sections_land_before_their_headings() {
        let sections = scan_manual_sections(&format!(
            "{}\n{}",
            render_block("Project Notes", "\nnotes\n"),
            render_block("Custom Commands", "\nmake ci\n")
        ))
        .sections;

        let merged = merge_manual_sections(GENERATED, &sections);
        assert_eq!(merged.preserved, 2);
        assert!(merged.dropped.is_empty());

        let notes = merged.document.find("MANUAL:BEGIN Project Notes");
        let knowledge = merged.document.find(KNOWLEDGE_HEADING);
        let commands = merged.document.find("MANUAL:BEGIN Custom Commands");
        let details = merged.document.find(DETAIL_DOCUMENTS_HEADING);
        assert!(notes < knowledge);
        assert!(knowledge < commands);
        assert!(commands < details);
        assert!(!merged.document.contains(PRESERVED_HEADING));
    }

    #[test]
    fn unknown_names_go_to_the_trailing_heading_and_duplicates_survive() {
        let sections = scan_manual_sections(&format!(
            "{}{}",
            render_block("Scratch", "one"),
            render_block("Scratch", "two")
        ))
        .sections;

        let merged = merge_manual_sections(GENERATED, &sections);
        assert_eq!(merged.preserved, 2);
        assert!(merged.document.contains(PRESERVED_HEADING));
        assert!(merged.document.contains(&render_block("Scratch", "one")));
        assert!(merged.document.contains(&render_block("Scratch", "two")));
    }

    #[test]
    fn missing_anchor_drops_the_section() {
        let sections = scan_manual_sections(&render_block("Project Notes", "x")).sections;
        let merged = merge_manual_sections("# bare\n", &sections);
        assert_eq!(merged.preserved, 0);
        assert_eq!(merged.dropped, vec!["Project Notes".to_string()]);
        assert_eq!(merged.document, "# bare\n");
    }

    proptest! {
        #[test]
        fn text_without_markers_is_untouched(body in "[a-zA-Z0-9 #*\\n-]{0,200}") {
            let scan = scan_manual_sections(&body);
            prop_assert!(scan.sections.is_empty());
            prop_assert!(scan.issues.is_empty());
            let merged = merge_manual_sections(&body, &scan.sections);
            prop_assert_eq!(merged.document, body);
        }

        #[test]
        fn preserved_content_survives_regeneration(
            name in "[A-Za-z][A-Za-z0-9]{0,6}( [A-Za-z0-9]{1,6})?",
            content in "[a-zA-Z0-9 #*\\n-]{0,80}",
        ) {
            let first = merge_manual_sections(
                GENERATED,
                &scan_manual_sections(&render_block(&name, &content)).sections,
            );
            let rescanned = scan_manual_sections(&first.document);
            prop_assert!(rescanned.issues.is_empty());
            prop_assert_eq!(rescanned.sections.len(), 1);
            prop_assert_eq!(&rescanned.sections[0].content, &content);

            let second = merge_manual_sections(GENERATED, &rescanned.sections);
            prop_assert_eq!(second.document, first.document);
        }
    }
}
