//! Scanner for the `[N] @username in #channel: content` citation format.
//!
//! A citation starts only at a complete, well-formed header; its content runs
//! until the next complete header or the end of the text. Brackets inside
//! content that do not form a header stay part of the content.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCitation {
    /// 1-based position in the context list
    pub index: usize,
    pub username: String,
    pub channel: String,
    /// Trimmed text after the header
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    index: usize,
    username: String,
    channel: String,
    /// Byte offset of the opening `[`
    start: usize,
    /// Byte offset just past the `:`
    end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Digits,
    AfterBracket,
    Username,
    AfterUsername,
    KeywordN,
    AfterKeyword,
    BeforeChannel,
    Channel,
}

fn is_inline_space(ch: char) -> bool {
    ch == ' ' || ch == '\t'
}

/// Try to read a header starting at byte `start`.
fn parse_header(text: &str, start: usize) -> Option<Header> {
    let mut state = State::Open;
    let mut digits = String::new();
    let mut username = String::new();
    let mut channel = String::new();

    for (offset, ch) in text[start..].char_indices() {
        state = match (state, ch) {
            (State::Open, '[') => State::Digits,
            (State::Open, _) => return None,

            (State::Digits, c) if c.is_ascii_digit() => {
                digits.push(c);
                State::Digits
            }
            (State::Digits, ']') if !digits.is_empty() => State::AfterBracket,
            (State::Digits, _) => return None,

            (State::AfterBracket, c) if is_inline_space(c) => State::AfterBracket,
            (State::AfterBracket, '@') => State::Username,
            (State::AfterBracket, _) => return None,

            (State::Username, c) if is_inline_space(c) && !username.is_empty() => State::AfterUsername,
            (State::Username, c) if c.is_whitespace() => return None,
            (State::Username, c) => {
                username.push(c);
                State::Username
            }

            (State::AfterUsername, c) if is_inline_space(c) => State::AfterUsername,
            (State::AfterUsername, 'i') => State::KeywordN,
            (State::AfterUsername, _) => return None,

            (State::KeywordN, 'n') => State::AfterKeyword,
            (State::KeywordN, _) => return None,

            (State::AfterKeyword, c) if is_inline_space(c) => State::BeforeChannel,
            (State::AfterKeyword, _) => return None,

            (State::BeforeChannel, c) if is_inline_space(c) => State::BeforeChannel,
            (State::BeforeChannel, '#') => State::Channel,
            (State::BeforeChannel, _) => return None,

            (State::Channel, ':') if !channel.is_empty() => {
                return Some(Header {
                    index: digits.parse().ok()?,
                    username,
                    channel,
                    start,
                    end: start + offset + 1,
                });
            }
            (State::Channel, c) if c.is_whitespace() || c == ':' => return None,
            (State::Channel, c) => {
                channel.push(c);
                State::Channel
            }
        };
    }
    None
}

fn find_headers(text: &str) -> Vec<Header> {
    let mut headers = Vec::new();
    let mut pos = 0;
    while let Some(rel) = text[pos..].find('[') {
        let start = pos + rel;
        match parse_header(text, start) {
            Some(header) => {
                pos = header.end;
                headers.push(header);
            }
            None => pos = start + 1,
        }
    }
    headers
}

/// All citations in a sources section, in order of appearance.
pub fn parse_citations(text: &str) -> Vec<ParsedCitation> {
    let headers = find_headers(text);
    headers
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let content_end = headers.get(i + 1).map_or(text.len(), |next| next.start);
            ParsedCitation {
                index: header.index,
                username: header.username.clone(),
                channel: header.channel.clone(),
                excerpt: text[header.end..content_end].trim().to_string(),
            }
        })
        .collect()
}

/// True if `text` contains at least one complete citation header.
pub fn contains_citation_header(text: &str) -> bool {
    let mut pos = 0;
    while let Some(rel) = text[pos..].find('[') {
        let start = pos + rel;
        if parse_header(text, start).is_some() {
            return true;
        }
        pos = start + 1;
    }
    false
}
