//! Turns parser output into final `Chunk` records.
//!
//! Types yield a definition chunk plus one chunk per member. Anything over
//! the token budget is split on the next structural boundary down (type →
//! members → statements, template → top-level entries) and only falls back
//! to line accumulation when no boundary is left. Raw spans become
//! overlapping line windows.
use std::collections::HashMap;

use super::parser::{ElementKind, LineIndex, ParsedSource, SourceElement};
use crate::config::ChunkingConfig;
use crate::db::models::{Chunk, ChunkType, estimate_tokens};

pub struct Chunker {
    config: ChunkingConfig,
}

/// Per-file state shared by the recursive helpers.
struct FileChunks<'a> {
    file_path: &'a str,
    language: &'a str,
    text: &'a str,
    lines: LineIndex,
    chunks: Vec<Chunk>,
    positions: HashMap<String, usize>,
}

impl FileChunks<'_> {
    /// Later (more specific) chunks replace earlier ones with the same id.
    fn push(&mut self, chunk: Chunk) {
        if chunk.content.trim().is_empty() {
            return;
        }
        match self.positions.get(&chunk.id) {
            Some(&pos) => self.chunks[pos] = chunk,
            None => {
                self.positions.insert(chunk.id.clone(), self.chunks.len());
                self.chunks.push(chunk);
            }
        }
    }

    fn tokens(&self, first: usize, last: usize) -> usize {
        let (start, end) = self.lines.span(first, last);
        estimate_tokens(&self.text[start..end])
    }
}

impl Chunker {
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    pub fn chunk(&self, file_path: &str, language: &str, parsed: &ParsedSource<'_>) -> Vec<Chunk> {
        let mut out = FileChunks {
            file_path,
            language,
            text: parsed.text,
            lines: LineIndex::new(parsed.text),
            chunks: Vec::new(),
            positions: HashMap::new(),
        };

        for element in &parsed.elements {
            self.emit(element, &mut out);
        }
        out.chunks
    }

    fn emit(&self, element: &SourceElement, out: &mut FileChunks<'_>) {
        match element.kind {
            ElementKind::Type => {
                self.emit_split(element, ChunkType::Class, element.name.as_deref(), None, out);
                for member in &element.children {
                    self.emit(member, out);
                }
            }
            ElementKind::Method => {
                self.emit_split(
                    element,
                    ChunkType::Method,
                    element.owner.as_deref(),
                    element.name.as_deref(),
                    out,
                );
            }
            ElementKind::Field => {
                self.emit_split(element, ChunkType::Field, element.owner.as_deref(), None, out);
            }
            ElementKind::Section => {
                self.emit_split(element, ChunkType::Doc, None, None, out);
            }
            ElementKind::Template => {
                // Oversized templates split between top-level entries; every
                // piece keeps the template's metadata and graph key.
                self.emit_split(element, ChunkType::Template, None, None, out);
            }
            ElementKind::Raw => {
                for (first, last) in self.windows(element.start_line, element.end_line) {
                    let chunk = self.piece(element, first, last, ChunkType::GenericBlock, out);
                    out.push(chunk);
                }
            }
            ElementKind::Block => {}
        }
    }

    /// One chunk when the element fits the budget, otherwise one per piece
    /// of `split_range`. Only the first piece carries the docstring.
    fn emit_split(
        &self,
        element: &SourceElement,
        chunk_type: ChunkType,
        class_name: Option<&str>,
        method_name: Option<&str>,
        out: &mut FileChunks<'_>,
    ) {
        let content = &out.text[element.start_byte..element.end_byte];
        let pieces = if estimate_tokens(content) <= self.config.max_chunk_tokens {
            vec![(element.start_line, element.end_line)]
        } else {
            self.split_range(element.start_line, element.end_line, &element.children, out)
        };

        for (i, (first, last)) in pieces.into_iter().enumerate() {
            let mut chunk = if first == element.start_line && last == element.end_line {
                let mut whole = Chunk::new(
                    out.file_path,
                    out.language,
                    chunk_type,
                    first,
                    last,
                    content,
                );
                whole.metadata = element.metadata.clone();
                whole
            } else {
                self.piece(element, first, last, chunk_type, out)
            };
            chunk.class_name = class_name.map(str::to_string);
            chunk.method_name = method_name.map(str::to_string);
            if i == 0 {
                chunk.docstring = element.docstring.clone();
            }
            out.push(chunk);
        }
    }

    /// Chunk over lines `first..=last`, clipped to the element's byte span.
    fn piece(
        &self,
        element: &SourceElement,
        first: usize,
        last: usize,
        chunk_type: ChunkType,
        out: &FileChunks<'_>,
    ) -> Chunk {
        let (start, end) = out.lines.span(first, last);
        let start = start.max(element.start_byte);
        let end = end.min(element.end_byte).max(start);
        let mut chunk = Chunk::new(
            out.file_path,
            out.language,
            chunk_type,
            first,
            last,
            &out.text[start..end],
        );
        chunk.metadata = element.metadata.clone();
        chunk
    }

    /// Cut `first..=last` into line ranges under the token budget, only at
    /// boundaries between `parts`. Lines before the first part and after the
    /// last one stay attached to their neighbouring part.
    fn split_range(
        &self,
        first: usize,
        last: usize,
        parts: &[SourceElement],
        out: &FileChunks<'_>,
    ) -> Vec<(usize, usize)> {
        let budget = self.config.max_chunk_tokens;
        if out.tokens(first, last) <= budget {
            return vec![(first, last)];
        }

        // Contiguous units, each ending where a part ends.
        let mut units: Vec<(usize, usize, Option<&SourceElement>)> = Vec::new();
        let mut cursor = first;
        for part in parts {
            if part.end_line < cursor || part.end_line > last {
                continue;
            }
            units.push((cursor, part.end_line, Some(part)));
            cursor = part.end_line + 1;
        }
        if units.is_empty() {
            return self.accumulate_lines(first, last, out);
        }
        if let Some(tail) = units.last_mut() {
            tail.1 = last;
        }

        let mut pieces = Vec::new();
        let mut open: Option<usize> = None;
        let mut open_end = 0;
        for (unit_first, unit_last, part) in units {
            if let Some(start) = open {
                if out.tokens(start, unit_last) <= budget {
                    open_end = unit_last;
                    continue;
                }
                pieces.push((start, open_end));
                open = None;
            }

            if out.tokens(unit_first, unit_last) <= budget {
                open = Some(unit_first);
                open_end = unit_last;
            } else {
                let children = part.map_or(&[][..], |p| p.children.as_slice());
                pieces.extend(self.split_range(unit_first, unit_last, children, out));
            }
        }
        if let Some(start) = open {
            pieces.push((start, open_end));
        }
        pieces
    }

    /// Greedy line accumulation; a single line over budget is kept whole.
    fn accumulate_lines(&self, first: usize, last: usize, out: &FileChunks<'_>) -> Vec<(usize, usize)> {
        let mut pieces = Vec::new();
        let mut start = first;
        for line in first..=last {
            if line > start && out.tokens(start, line) > self.config.max_chunk_tokens {
                pieces.push((start, line - 1));
                start = line;
            }
        }
        pieces.push((start, last));
        pieces
    }

    /// Fixed-size line windows with `window_overlap` lines shared between neighbours.
    fn windows(&self, first: usize, last: usize) -> Vec<(usize, usize)> {
        let size = self.config.window_lines.max(1);
        let overlap = self.config.window_overlap.min(size - 1);

        let mut windows = Vec::new();
        let mut start = first;
        loop {
            let end = (start + size - 1).min(last);
            windows.push((start, end));
            if end >= last {
                break;
            }
            start = end + 1 - overlap;
        }
        windows
    }
}
