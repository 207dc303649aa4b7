use tracing::warn;

/// Where the scanner is relative to string literals.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Lexeme {
    #[default]
    Structure,
    /// Inside a literal opened by `quote`.
    Text { quote: u8, escaped: bool },
    /// Just past a matching quote. It closes the literal only if the next
    /// non-blank byte is `,` `:` `}` or `]`; otherwise it was content.
    AfterQuote { quote: u8, line_break: bool },
}

/// Splits a growing text buffer into balanced-brace frames.
///
/// Scan state survives between calls to [`FrameExtractor::push`], so every
/// byte is looked at once no matter how the body was chunked. Inside a frame,
/// `'` and `"` open string literals whose braces do not count toward depth.
///
/// A second, quote-blind depth runs alongside. When it closes the frame
/// while the quote-aware depth has not, and the next non-blank byte is `{`
/// or a line break, the frame is abandoned and scanning resumes there. One
/// frame with broken quoting therefore cannot swallow the frames after it.
#[derive(Debug, Default)]
pub struct FrameExtractor {
    buffer: String,
    scanned: usize,
    depth: usize,
    raw_depth: usize,
    start: Option<usize>,
    lexeme: Lexeme,
    diverged: bool,
    abandoned: usize,
}

impl FrameExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `fragment` and returns every frame completed by it, in the
    /// order their closing braces were seen.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        if fragment.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(fragment);

        let mut frames = Vec::new();

        for i in self.scanned..self.buffer.len() {
            let byte = self.buffer.as_bytes()[i];

            if self.diverged {
                match byte {
                    b'{' | b'\n' | b'\r' => self.abandon("quote-blind scan closed the frame first"),
                    b' ' | b'\t' => {}
                    _ => self.diverged = false,
                }
            }

            match self.lexeme {
                Lexeme::Structure => {}
                Lexeme::Text { quote, escaped } => {
                    self.text_byte(byte, quote, escaped);
                    continue;
                }
                Lexeme::AfterQuote { quote, line_break } => match byte {
                    b' ' | b'\t' => continue,
                    b'\n' | b'\r' => {
                        self.lexeme = Lexeme::AfterQuote {
                            quote,
                            line_break: true,
                        };
                        continue;
                    }
                    b',' | b':' | b'}' | b']' => self.lexeme = Lexeme::Structure,
                    _ if line_break => self.abandon("line break inside a string literal"),
                    _ => {
                        self.text_byte(byte, quote, false);
                        continue;
                    }
                },
            }

            match byte {
                b'{' => {
                    if self.depth == 0 {
                        self.start = Some(i);
                    }
                    self.depth += 1;
                    self.raw_depth += 1;
                }
                b'}' if self.depth > 0 => {
                    self.depth -= 1;
                    self.close_raw();
                    if self.depth == 0 {
                        self.raw_depth = 0;
                        self.diverged = false;
                        if let Some(start) = self.start.take() {
                            frames.push(self.buffer[start..=i].to_string());
                        }
                    }
                }
                b'\'' | b'"' if self.depth > 0 => {
                    self.lexeme = Lexeme::Text {
                        quote: byte,
                        escaped: false,
                    }
                }
                _ => {}
            }
        }

        // Keep only the unfinished frame, dropping any leading garbage.
        match self.start {
            Some(start) => {
                self.buffer.drain(..start);
                self.start = Some(0);
                self.scanned = self.buffer.len();
            }
            None => {
                self.buffer.clear();
                self.scanned = 0;
            }
        }

        frames
    }

    /// Text retained for the next fragment: empty, or one partial frame.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Frames given up on because their quoting could not be followed.
    pub fn abandoned(&self) -> usize {
        self.abandoned
    }

    /// Discards any unterminated frame, returning how many bytes were dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffer.len();
        *self = Self {
            abandoned: self.abandoned,
            ..Self::default()
        };
        dropped
    }

    fn text_byte(&mut self, byte: u8, quote: u8, escaped: bool) {
        self.lexeme = Lexeme::Text {
            quote,
            escaped: false,
        };
        if escaped {
            return;
        }
        match byte {
            b'\\' => {
                self.lexeme = Lexeme::Text {
                    quote,
                    escaped: true,
                }
            }
            // Neither encoding allows a raw line break inside a string.
            b'\n' | b'\r' => self.abandon("line break inside a string literal"),
            b'{' => self.raw_depth += 1,
            b'}' => self.close_raw(),
            _ if byte == quote => {
                self.lexeme = Lexeme::AfterQuote {
                    quote,
                    line_break: false,
                }
            }
            _ => {}
        }
    }

    fn close_raw(&mut self) {
        if self.raw_depth == 0 {
            return;
        }
        self.raw_depth -= 1;
        if self.raw_depth == 0 && self.depth > 0 {
            self.diverged = true;
        }
    }

    fn abandon(&mut self, reason: &str) {
        warn!(frame_start = ?self.start, reason, "abandoning frame");
        self.depth = 0;
        self.raw_depth = 0;
        self.start = None;
        self.lexeme = Lexeme::Structure;
        self.diverged = false;
        self.abandoned += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "data: {'message': {'role': 'assistant', 'content': 'Hel'}, 'done': False}\n\n\
                        data: {'message': {'content': 'lo {world}'}, 'done': False}\n\n\
                        {\"message\": {\"content\": \"it's\"}, \"done\": false}\
                        {'message': {'content': ''}, 'done': True}\n\ndata: [DONE]\n\n";

    fn extract_all(fragments: &[&str]) -> Vec<String> {
        let mut extractor = FrameExtractor::new();
        fragments
            .iter()
            .flat_map(|fragment| extractor.push(fragment))
            .collect()
    }

    #[test]
    fn extracts_concatenated_frames_in_order() {
        let frames = extract_all(&[BODY]);
        assert_eq!(frames.len(), 4);
        assert!(frames[0].starts_with("{'message'"));
        assert!(frames[1].contains("lo {world}"));
        assert!(frames[2].contains("it's"));
        assert!(frames[3].ends_with("'done': True}"));
    }

    #[test]
    fn chunking_does_not_change_frames() {
        let whole = extract_all(&[BODY]);

        let chars: Vec<String> = BODY.chars().map(String::from).collect();
        let one_per_fragment: Vec<&str> = chars.iter().map(String::as_str).collect();
        assert_eq!(extract_all(&one_per_fragment), whole);

        for split in 1..BODY.len() {
            if !BODY.is_char_boundary(split) {
                continue;
            }
            let (head, tail) = BODY.split_at(split);
            assert_eq!(extract_all(&[head, tail]), whole, "split at {split}");
        }
    }

    #[test]
    fn retains_partial_frame_without_leading_garbage() {
        let mut extractor = FrameExtractor::new();
        let frames = extractor.push("data: {'message': {'content': 'Hel");
        assert!(frames.is_empty());
        assert_eq!(extractor.pending(), "{'message': {'content': 'Hel");

        let frames = extractor.push("lo'}, 'done': False}\n\n");
        assert_eq!(frames, vec!["{'message': {'content': 'Hello'}, 'done': False}"]);
        assert_eq!(extractor.pending(), "");
    }

    #[test]
    fn empty_fragment_leaves_buffer_untouched() {
        let mut extractor = FrameExtractor::new();
        extractor.push("{'a': ");
        assert!(extractor.push("").is_empty());
        assert_eq!(extractor.pending(), "{'a': ");
    }

    #[test]
    fn braces_inside_strings_do_not_close_frames() {
        let frames = extract_all(&["{'content': '}}}'", ", 'other': \"{\"}"]);
        assert_eq!(frames, vec!["{'content': '}}}', 'other': \"{\"}"]);
    }

    #[test]
    fn escaped_quote_stays_inside_string() {
        let frames = extract_all(&[r#"{'content': 'it\'s } here'}"#]);
        assert_eq!(frames, vec![r#"{'content': 'it\'s } here'}"#]);
    }

    #[test]
    fn stray_closing_brace_is_ignored() {
        let frames = extract_all(&["} garbage }{'a': 1}"]);
        assert_eq!(frames, vec!["{'a': 1}"]);
    }

    #[test]
    fn line_break_inside_string_resynchronises() {
        let mut extractor = FrameExtractor::new();
        let frames = extractor.push(
            "data: {'message': {'content': 'bro\nken'}, 'done': False}\n\n\
             data: {'message': {'content': 'next'}, 'done': False}\n\n",
        );

        assert_eq!(frames, vec!["{'message': {'content': 'next'}, 'done': False}"]);
        assert_eq!(extractor.abandoned(), 1);
    }

    #[test]
    fn apostrophe_inside_single_quoted_string_is_content() {
        let frames = extract_all(&[
            "{'message': {'content': 'it's'}, 'done': False}",
            "{'message': {'content': 'rock 'n' roll'}, 'done': False}",
        ]);

        assert_eq!(
            frames,
            vec![
                "{'message': {'content': 'it's'}, 'done': False}",
                "{'message': {'content': 'rock 'n' roll'}, 'done': False}",
            ]
        );
    }

    #[test]
    fn unterminated_string_does_not_swallow_adjacent_frames() {
        const BROKEN: &str = "{'message': {'content': 'unclosed}, 'done': False}";
        const NEXT: &str = "{'message': {'content': 'next'}, 'done': False}";
        const LAST: &str = "{'message': {'content': 'last'}, 'done': False}";

        for separator in ["", " ", "\t ", "\n\ndata: "] {
            let body = format!("{BROKEN}{separator}{NEXT}{separator}{LAST}");
            let mut extractor = FrameExtractor::new();
            let frames = extractor.push(&body);

            assert_eq!(frames, vec![NEXT, LAST], "separator {separator:?}");
            assert_eq!(extractor.abandoned(), 1, "separator {separator:?}");
            assert_eq!(extractor.pending(), "");

            let chars: Vec<String> = body.chars().map(String::from).collect();
            let mut extractor = FrameExtractor::new();
            let frames: Vec<String> = chars.iter().flat_map(|c| extractor.push(c)).collect();
            assert_eq!(frames, vec![NEXT, LAST], "separator {separator:?}, one char at a time");
        }
    }

    #[test]
    fn closing_quote_may_be_followed_by_whitespace() {
        let frames = extract_all(&["{\"content\": \"a\"\n  , \"done\": true\n}"]);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn finish_discards_unterminated_frame() {
        let mut extractor = FrameExtractor::new();
        extractor.push("{'message': {'content': 'cut");
        assert_eq!(extractor.finish(), "{'message': {'content': 'cut".len());
        assert_eq!(extractor.pending(), "");
    }
}
