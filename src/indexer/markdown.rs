use super::parser::{ElementKind, LineIndex, ParseError, ParsedSource, SourceElement, SourceParser};
use pulldown_cmark::{Event, Parser, Tag};

/// Splits markdown into one `Section` per heading; paragraphs become split
/// boundaries for sections over the chunk budget.
pub struct MarkdownParser;

impl SourceParser for MarkdownParser {
    fn language(&self) -> &str {
        "markdown"
    }

    fn extensions(&self) -> Vec<String> {
        vec!["md".to_string(), "markdown".to_string()]
    }

    fn parse<'a>(&self, text: &'a str) -> Result<ParsedSource<'a>, ParseError> {
        if text.trim().is_empty() {
            return Ok(ParsedSource {
                text,
                elements: Vec::new(),
            });
        }

        let lines = LineIndex::new(text);

        // Headings as seen by a real markdown parser, so `#` lines inside
        // fenced code blocks do not open sections.
        let mut heading_lines: Vec<usize> = Parser::new(text)
            .into_offset_iter()
            .filter_map(|(event, range)| match event {
                Event::Start(Tag::Heading { .. }) => Some(lines.line_of(range.start)),
                _ => None,
            })
            .collect();
        heading_lines.dedup();

        let mut starts = Vec::new();
        if heading_lines.first() != Some(&1) {
            starts.push(1);
        }
        starts.extend(heading_lines.iter().copied());

        let mut elements = Vec::new();
        for (i, &first) in starts.iter().enumerate() {
            let last = starts
                .get(i + 1)
                .map_or(lines.line_count(), |next| next - 1);
            if let Some(section) = section_element(text, &lines, first, last, &heading_lines) {
                elements.push(section);
            }
        }

        Ok(ParsedSource { text, elements })
    }
}

fn section_element(
    text: &str,
    lines: &LineIndex,
    first: usize,
    last: usize,
    heading_lines: &[usize],
) -> Option<SourceElement> {
    let (start, end) = lines.span(first, last);
    let body = &text[start..end];
    if body.trim().is_empty() {
        return None;
    }

    // Drop trailing blank lines from the section span.
    let end = start + body.trim_end().len();
    let last = lines.line_of(end.saturating_sub(1).max(start));

    let mut section = SourceElement::new(ElementKind::Section, start, end, first, last);
    if heading_lines.contains(&first) {
        let heading = body.lines().next().unwrap_or("");
        let title = heading.trim().trim_start_matches('#').trim().trim_end_matches('#').trim();
        if !title.is_empty() {
            section.name = Some(title.to_string());
        }
    }
    section.children = paragraphs(text, lines, first, last);
    Some(section)
}

/// Runs of non-blank lines inside `first..=last`.
fn paragraphs(text: &str, lines: &LineIndex, first: usize, last: usize) -> Vec<SourceElement> {
    let mut blocks = Vec::new();
    let mut open: Option<usize> = None;

    for line in first..=last {
        let (s, e) = lines.span(line, line);
        let blank = text[s..e].trim().is_empty();
        match (open, blank) {
            (None, false) => open = Some(line),
            (Some(begin), true) => {
                blocks.push(block(lines, begin, line - 1));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(begin) = open {
        blocks.push(block(lines, begin, last));
    }
    blocks
}

fn block(lines: &LineIndex, first: usize, last: usize) -> SourceElement {
    let (start, end) = lines.span(first, last);
    SourceElement::new(ElementKind::Block, start, end, first, last)
}
