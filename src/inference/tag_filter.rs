//! Tag-filtering stream decoder.
//!
//! The model narrates in plain text and embeds tool calls as markup:
//!
//! ```text
//! Let me look around. <tool name="list_files" path="src"/>
//! <tool name="write_file" path="src/health.rs">
//! pub fn health() -> &'static str { "ok" }
//! </tool>
//! ```
//!
//! [`TagFilter`] hides the markup from the visible stream while keeping the raw
//! text for the parser. Opening and closing tokens may be split across chunks
//! at any byte; unresolved prefixes stay buffered until the next chunk.

const OPEN_TOKEN: &str = "<tool";
const CLOSE_TOKEN: &str = "</tool>";

// ─── Element scanning ───────────────────────────────────────────────────────

/// Where a complete `<tool …>` element ends, relative to its `<`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ElementSpan {
    /// Index one past the `>` of the opening tag.
    pub open_tag_end: usize,
    /// Index one past the end of the whole element.
    pub end: usize,
    /// `<tool …/>` rather than `<tool …>…</tool>`.
    pub self_closing: bool,
}

/// Result of checking whether text starting at `<` opens a tool element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMatch {
    Yes,
    No,
    /// Too short to decide.
    Partial,
}

/// Classify text that starts with `<`.
///
/// `<tool` must be followed by whitespace, `>` or `/` so look-alikes such as
/// `<toolbox>` stay narration.
pub(crate) fn match_open(text: &str) -> OpenMatch {
    if text.len() <= OPEN_TOKEN.len() {
        return if OPEN_TOKEN.starts_with(text) {
            OpenMatch::Partial
        } else {
            OpenMatch::No
        };
    }
    if !text.starts_with(OPEN_TOKEN) {
        return OpenMatch::No;
    }
    match text[OPEN_TOKEN.len()..].chars().next() {
        Some(c) if c.is_whitespace() || c == '>' || c == '/' => OpenMatch::Yes,
        _ => OpenMatch::No,
    }
}

/// Find the end of a tool element that starts at index 0 of `text`.
///
/// Quote-aware inside the opening tag, so `>` or `/>` inside an attribute
/// value does not end it. Returns `None` if the element is still incomplete.
pub(crate) fn scan_element(text: &str) -> Option<ElementSpan> {
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = OPEN_TOKEN.len();

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'/' if bytes.get(i + 1) == Some(&b'>') => {
                    return Some(ElementSpan {
                        open_tag_end: i + 2,
                        end: i + 2,
                        self_closing: true,
                    });
                }
                b'>' => {
                    let open_tag_end = i + 1;
                    let close = text[open_tag_end..].find(CLOSE_TOKEN)?;
                    return Some(ElementSpan {
                        open_tag_end,
                        end: open_tag_end + close + CLOSE_TOKEN.len(),
                        self_closing: false,
                    });
                }
                _ => {}
            },
        }
        i += 1;
    }

    None
}

// ─── TagFilter ──────────────────────────────────────────────────────────────

/// Incremental decoder separating narration from tool-call markup.
///
/// One instance per model turn.
#[derive(Debug, Default)]
pub struct TagFilter {
    /// Undecided text: a partial opening token, or an element in progress.
    buffer: String,
    /// Whether `buffer` holds an element that has already been recognized.
    inside_markup: bool,
    /// Every chunk fed so far, unfiltered.
    raw: String,
}

impl TagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one inbound chunk and return the text now safe to show.
    pub fn feed(&mut self, chunk: &str) -> String {
        self.raw.push_str(chunk);
        self.buffer.push_str(chunk);

        let mut visible = String::new();

        loop {
            if self.inside_markup {
                match scan_element(&self.buffer) {
                    Some(span) => {
                        self.buffer.drain(..span.end);
                        self.inside_markup = false;
                    }
                    None => break,
                }
                continue;
            }

            let Some(lt) = self.buffer.find('<') else {
                visible.push_str(&self.buffer);
                self.buffer.clear();
                break;
            };

            visible.push_str(&self.buffer[..lt]);
            self.buffer.drain(..lt);

            match match_open(&self.buffer) {
                OpenMatch::Yes => self.inside_markup = true,
                OpenMatch::No => {
                    visible.push('<');
                    self.buffer.drain(..1);
                }
                OpenMatch::Partial => break,
            }
        }

        visible
    }

    /// Flush at end of stream.
    ///
    /// A dangling partial token (`"<to"`) was narration after all. An element
    /// that never closed stays hidden; the parser will skip it as malformed.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.buffer);
        if self.inside_markup {
            self.inside_markup = false;
            String::new()
        } else {
            rest
        }
    }

    /// The unfiltered concatenation of all chunks.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn into_raw(self) -> String {
        self.raw
    }
}

/// Remove all tool markup from a complete text.
pub fn strip_markup(text: &str) -> String {
    let mut filter = TagFilter::new();
    let mut out = filter.feed(text);
    out.push_str(&filter.finish());
    out
}

// ─── Tests ──────────────────────────────────────────────────────────────────
