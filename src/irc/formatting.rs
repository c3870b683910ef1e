//! IRC text formatting.
//!
//! Converts between mIRC control codes and the HTML subset used for styled
//! room messages, and splits long text into lines that fit an IRC message.

const BOLD: char = '\x02';
const COLOR: char = '\x03';
const RESET: char = '\x0F';
const REVERSE: char = '\x16';
const ITALIC: char = '\x1D';
const UNDERLINE: char = '\x1F';

/// mIRC colour palette, indexed by colour number.
const PALETTE: [&str; 16] = [
    "#ffffff", "#000000", "#000080", "#008000", "#ff0000", "#800000", "#800080", "#808000",
    "#ffff00", "#00ff00", "#008080", "#00ffff", "#0000ff", "#ff00ff", "#808080", "#c0c0c0",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Style {
    bold: bool,
    italic: bool,
    underline: bool,
    color: Option<usize>,
}

impl Style {
    fn open_tags(&self, out: &mut String) {
        if self.bold {
            out.push_str("<b>");
        }
        if self.italic {
            out.push_str("<i>");
        }
        if self.underline {
            out.push_str("<u>");
        }
        if let Some(color) = self.color {
            out.push_str(&format!("<font color=\"{}\">", PALETTE[color]));
        }
    }

    fn close_tags(&self, out: &mut String) {
        if self.color.is_some() {
            out.push_str("</font>");
        }
        if self.underline {
            out.push_str("</u>");
        }
        if self.italic {
            out.push_str("</i>");
        }
        if self.bold {
            out.push_str("</b>");
        }
    }
}

fn escape_html(c: char, out: &mut String) {
    match c {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        '"' => out.push_str("&quot;"),
        other => out.push(other),
    }
}

/// Parse up to two colour digits starting at `chars[i]`.
fn take_color_number(chars: &[char], i: &mut usize) -> Option<usize> {
    let start = *i;
    while *i < chars.len() && *i - start < 2 && chars[*i].is_ascii_digit() {
        *i += 1;
    }
    if *i == start {
        return None;
    }
    chars[start..*i]
        .iter()
        .collect::<String>()
        .parse::<usize>()
        .ok()
        .map(|n| n % PALETTE.len())
}

/// Convert IRC control codes to HTML.
///
/// Text without any control codes is returned unchanged.
pub fn irc_to_html(text: &str) -> String {
    if !text
        .chars()
        .any(|c| matches!(c, BOLD | COLOR | RESET | REVERSE | ITALIC | UNDERLINE))
    {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() * 2);
    let mut style = Style::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        i += 1;

        let mut next = style.clone();
        match c {
            BOLD => next.bold = !next.bold,
            ITALIC => next.italic = !next.italic,
            UNDERLINE => next.underline = !next.underline,
            RESET => next = Style::default(),
            REVERSE => {}
            COLOR => {
                next.color = take_color_number(&chars, &mut i);
                // Background colours are not representable; skip them.
                if next.color.is_some()
                    && i + 1 < chars.len()
                    && chars[i] == ','
                    && chars[i + 1].is_ascii_digit()
                {
                    i += 1;
                    take_color_number(&chars, &mut i);
                }
            }
            other => {
                escape_html(other, &mut out);
                continue;
            }
        }

        if next != style {
            style.close_tags(&mut out);
            next.open_tags(&mut out);
            style = next;
        }
    }

    style.close_tags(&mut out);
    out
}

/// Convert basic HTML to IRC control codes.
///
/// Unknown tags are dropped; entities are decoded.
pub fn html_to_irc(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(pos) = rest.find(|c| c == '<' || c == '&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        if rest.starts_with('&') {
            let (decoded, consumed) = decode_entity(rest);
            out.push_str(decoded);
            rest = &rest[consumed..];
            continue;
        }

        let Some(end) = rest.find('>') else {
            out.push_str(rest);
            return out;
        };
        let tag = &rest[1..end];
        rest = &rest[end + 1..];

        let closing = tag.starts_with('/');
        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match name.as_str() {
            "b" | "strong" => out.push(BOLD),
            "i" | "em" => out.push(ITALIC),
            "u" => out.push(UNDERLINE),
            "br" => out.push('\n'),
            "font" if closing => out.push(COLOR),
            "font" => {
                if let Some(index) = font_color(tag) {
                    out.push_str(&format!("{}{:02}", COLOR, index));
                } else {
                    out.push(COLOR);
                }
            }
            _ => {}
        }
    }

    out.push_str(rest);
    out
}

fn decode_entity(s: &str) -> (&'static str, usize) {
    for (entity, decoded) in [
        ("&amp;", "&"),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#39;", "'"),
        ("&nbsp;", " "),
    ] {
        if s.starts_with(entity) {
            return (decoded, entity.len());
        }
    }
    ("&", 1)
}

fn font_color(tag: &str) -> Option<usize> {
    let start = tag.find("color=")? + "color=".len();
    let value = tag[start..].trim_start_matches(['"', '\'']);
    let value: String = value
        .chars()
        .take_while(|c| *c != '"' && *c != '\'' && !c.is_whitespace())
        .collect();
    let value = value.to_ascii_lowercase();
    PALETTE.iter().position(|p| *p == value)
}

/// Strip all IRC control codes.
pub fn strip_codes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            BOLD | RESET | REVERSE | ITALIC | UNDERLINE => {}
            COLOR => {
                if take_color_number(&chars, &mut i).is_some()
                    && i + 1 < chars.len()
                    && chars[i] == ','
                    && chars[i + 1].is_ascii_digit()
                {
                    i += 1;
                    take_color_number(&chars, &mut i);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Find the largest byte index <= `byte_index` that is a char boundary.
fn floor_char_boundary(s: &str, byte_index: usize) -> usize {
    if byte_index >= s.len() {
        return s.len();
    }
    let mut i = byte_index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Split text into IRC lines of at most `max_len` bytes.
///
/// Embedded newlines always start a new line. Tries to split on word
/// boundaries and never splits inside a multi-byte character.
pub fn split_message(message: &str, max_len: usize) -> Vec<String> {
    message
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .flat_map(|line| split_line(line, max_len))
        .collect()
}

fn split_line(line: &str, max_len: usize) -> Vec<String> {
    if line.len() <= max_len {
        return vec![line.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = line;

    while !remaining.is_empty() {
        remaining = remaining.trim_start();
        if remaining.is_empty() {
            break;
        }

        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let split_at = floor_char_boundary(remaining, max_len);

        if split_at == 0 {
            let first_char_end = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
            chunks.push(remaining[..first_char_end].to_string());
            remaining = &remaining[first_char_end..];
            continue;
        }

        let chunk = &remaining[..split_at];

        if remaining.as_bytes().get(split_at) == Some(&b' ') {
            chunks.push(chunk.to_string());
            remaining = &remaining[split_at + 1..];
            continue;
        }

        match chunk.rfind(' ') {
            Some(space_idx) if space_idx > 0 => {
                chunks.push(remaining[..space_idx].to_string());
                remaining = &remaining[space_idx + 1..];
            }
            _ => {
                chunks.push(chunk.to_string());
                remaining = &remaining[split_at..];
            }
        }
    }

    chunks
}
