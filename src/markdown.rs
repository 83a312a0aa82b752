//! Terminal markdown renderer using winnow 0.7 + crossterm.
//!
//! Parses markdown token by token from a `Partial<&str>` buffer and writes
//! ANSI-styled output to a `Write` sink, wrapping at a fixed content width and
//! indenting every line by a left padding.
use std::io::Write;

use crossterm::Command;
use crossterm::style::{self, Attribute, Stylize};
use winnow::Partial;
use winnow::ascii::{self, digit1, space0, space1, till_line_ending};
use winnow::combinator::{alt, preceded, terminated};
use winnow::error::{ErrMode, ModalResult, ParserError};
use winnow::prelude::*;
use winnow::stream::{AsChar, Offset, Stream};
use winnow::token::{any, take_until, take_while};

pub const DEFAULT_WIDTH: usize = 80;
pub const DEFAULT_PADDING: usize = 6;
const MIN_CONTENT_WIDTH: usize = 20;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum MdError {
    Io(std::io::Error),
    Parse,
}

impl std::fmt::Display for MdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MdError::Io(e) => write!(f, "io: {e}"),
            MdError::Parse => write!(f, "parse error"),
        }
    }
}

impl<I: Stream> ParserError<I> for MdError {
    type Inner = Self;

    fn from_input(_input: &I) -> Self {
        Self::Parse
    }

    fn into_inner(self) -> Result<Self::Inner, Self> {
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Parse state
// ---------------------------------------------------------------------------

pub struct ParseState {
    pub in_codeblock: bool,
    pub bold: bool,
    pub italic: bool,
    pub newline: bool,
    pub set_newline: bool,
    /// Content column, padding excluded.
    pub column: usize,
    pub content_width: Option<usize>,
    pub padding: usize,
}

impl Default for ParseState {
    fn default() -> Self {
        Self::with_layout(DEFAULT_WIDTH, DEFAULT_PADDING)
    }
}

impl ParseState {
    /// `width` is the full line width; content wraps at `width - padding`.
    pub fn with_layout(width: usize, padding: usize) -> Self {
        Self {
            in_codeblock: false,
            bold: false,
            italic: false,
            newline: true,
            set_newline: false,
            column: 0,
            content_width: Some(width.saturating_sub(padding).max(MIN_CONTENT_WIDTH)),
            padding,
        }
    }
}

// ---------------------------------------------------------------------------
// Whole-document rendering
// ---------------------------------------------------------------------------

/// Renders a complete markdown document to styled terminal text.
pub fn render_markdown(text: &str, width: usize, padding: usize) -> String {
    let mut out = Vec::<u8>::new();
    let mut state = ParseState::with_layout(width, padding);
    let mut buf = text.to_string();
    // A trailing newline lets every pending token complete.
    buf.push('\n');

    let mut offset = 0usize;
    while offset < buf.len() {
        let input = Partial::new(&buf[offset..]);
        match parse_markdown(input, &mut out, &mut state) {
            Ok(parsed) => {
                let consumed = parsed.offset_from(&input);
                if consumed == 0 {
                    break;
                }
                offset += consumed;
                state.newline = state.set_newline;
                state.set_newline = false;
            }
            Err(_) => break,
        }
    }

    // Unterminated spans (a lone backtick, an open image) are emitted as-is.
    if offset < buf.len() {
        let _ = q(&mut out, style::ResetColor);
        out.extend_from_slice(buf[offset..].as_bytes());
    }
    let _ = q(&mut out, style::SetAttribute(Attribute::Reset));

    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Top-level parse step
// ---------------------------------------------------------------------------

/// Parse one markdown token from the input, writing styled output to `o`.
/// Returns the remaining input on success, or `Incomplete` if more data needed.
pub fn parse_markdown<'a>(
    mut i: Partial<&'a str>,
    mut o: impl Write,
    state: &mut ParseState,
) -> ModalResult<Partial<&'a str>, MdError> {
    let start = i.checkpoint();

    macro_rules! try_parser {
        ($($parser:ident),*) => {
            $({
                i.reset(&start);
                match $parser(&mut o, state).parse_next(&mut i) {
                    Err(ErrMode::Backtrack(_)) => {},
                    res => return res.map(|_| i),
                }
            })*
        };
    }

    if state.in_codeblock {
        try_parser!(codeblock_end, codeblock_line_ending, codeblock_fallback);
    } else {
        try_parser!(
            image,
            text,
            codeblock_begin,
            horizontal_rule,
            heading,
            bulleted_item,
            numbered_item,
            blockquote,
            code,
            bold,
            italic,
            line_ending,
            fallback
        );
    }

    Err(ErrMode::Backtrack(MdError::Parse))
}

// ---------------------------------------------------------------------------
// Parsers — normal mode
// ---------------------------------------------------------------------------

fn image<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        "![".parse_next(i)?;
        let alt_text = terminated(take_until(0.., "]("), "](").parse_next(i)?;
        let url = terminated(take_until(0.., ")"), ")").parse_next(i)?;
        let label = if alt_text.is_empty() { "image" } else { alt_text };
        let print = format!("[{label}] {url}");
        advance(&mut o, state, print.chars().count())?;
        q(&mut o, style::SetForegroundColor(style::Color::Cyan))?;
        q(&mut o, style::Print(print))?;
        q(&mut o, style::ResetColor)
    }
}

fn text<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        let content = take_while(1.., |t| {
            AsChar::is_alphanum(t) || "+,.?\"'/:;=@%&()[]".contains(t)
        })
        .parse_next(i)?;
        advance(&mut o, state, content.chars().count())?;
        q(&mut o, style::Print(content))
    }
}

fn heading<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        if !state.newline {
            return Err(ErrMode::Backtrack(MdError::Parse));
        }
        let level = terminated(take_while(1.., |c| c == '#'), space1).parse_next(i)?;
        let print = format!("{level} ");
        advance(&mut o, state, print.len())?;
        q(&mut o, style::SetForegroundColor(style::Color::Magenta))?;
        q(&mut o, style::SetAttribute(Attribute::Bold))?;
        q(&mut o, style::Print(print))
    }
}

fn bulleted_item<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        if !state.newline {
            return Err(ErrMode::Backtrack(MdError::Parse));
        }
        let ws = (space0, alt(("-", "*", "+")), space1).parse_next(i)?.0;
        let print = format!("{ws}• ");
        advance(&mut o, state, print.chars().count())?;
        q(&mut o, style::Print(print))
    }
}

fn numbered_item<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        if !state.newline {
            return Err(ErrMode::Backtrack(MdError::Parse));
        }
        let (ws, digits, _, _) = (space0, digit1, ".", space1).parse_next(i)?;
        let print = format!("{ws}{digits}. ");
        advance(&mut o, state, print.len())?;
        q(&mut o, style::Print(print))
    }
}

fn horizontal_rule<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        if !state.newline {
            return Err(ErrMode::Backtrack(MdError::Parse));
        }
        (
            space0,
            alt((
                take_while(3.., '-'),
                take_while(3.., '*'),
                take_while(3.., '_'),
            )),
            ascii::line_ending,
        )
            .parse_next(i)?;
        let rule_width = state.content_width.unwrap_or(40).min(40);
        pad(&mut o, state)?;
        state.column = 0;
        state.set_newline = true;
        q(
            &mut o,
            style::Print(format!("{}\n", "━".repeat(rule_width).dark_grey())),
        )
    }
}

fn code<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        "`".parse_next(i)?;
        let content = terminated(take_until(0.., "`"), "`").parse_next(i)?;
        advance(&mut o, state, content.chars().count())?;
        q(&mut o, style::SetForegroundColor(style::Color::Green))?;
        q(&mut o, style::Print(content))?;
        q(&mut o, style::ResetColor)
    }
}

fn bold<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        alt(("**", "__")).parse_next(i)?;
        state.bold = !state.bold;
        if state.bold {
            q(&mut o, style::SetAttribute(Attribute::Bold))
        } else {
            q(&mut o, style::SetAttribute(Attribute::NormalIntensity))
        }
    }
}

fn italic<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        alt(("*", "_")).parse_next(i)?;
        state.italic = !state.italic;
        if state.italic {
            q(&mut o, style::SetAttribute(Attribute::Italic))
        } else {
            q(&mut o, style::SetAttribute(Attribute::NoItalic))
        }
    }
}

fn blockquote<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        if !state.newline {
            return Err(ErrMode::Backtrack(MdError::Parse));
        }
        (">", space0).parse_next(i)?;
        let print = "│ ";
        advance(&mut o, state, 2)?;
        q(&mut o, style::SetForegroundColor(style::Color::DarkGrey))?;
        q(&mut o, style::Print(print))
    }
}

fn line_ending<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        ascii::line_ending.parse_next(i)?;
        state.column = 0;
        state.set_newline = true;
        q(&mut o, style::ResetColor)?;
        q(&mut o, style::SetAttribute(Attribute::Reset))?;
        q(&mut o, style::Print("\n"))
    }
}

fn fallback<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        let c = any.parse_next(i)?;
        advance(&mut o, state, 1)?;
        if c != ' ' || state.column != 1 {
            q(&mut o, style::Print(c))
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Parsers — codeblock mode
// ---------------------------------------------------------------------------

fn codeblock_begin<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        if !state.newline {
            return Err(ErrMode::Backtrack(MdError::Parse));
        }
        let language = preceded("```", till_line_ending).parse_next(i)?;
        ascii::line_ending.parse_next(i)?;
        state.in_codeblock = true;
        state.column = 0;
        if !language.is_empty() {
            pad(&mut o, state)?;
            q(&mut o, style::Print(format!("{}\n", language.bold())))?;
        }
        q(&mut o, style::SetForegroundColor(style::Color::Green))
    }
}

fn codeblock_end<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        "```".parse_next(i)?;
        state.in_codeblock = false;
        q(&mut o, style::ResetColor)
    }
}

fn codeblock_line_ending<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        ascii::line_ending.parse_next(i)?;
        state.column = 0;
        q(&mut o, style::Print("\n"))
    }
}

fn codeblock_fallback<'a, 'b>(
    mut o: impl Write + 'b,
    state: &'b mut ParseState,
) -> impl FnMut(&mut Partial<&'a str>) -> ModalResult<(), MdError> + 'b {
    move |i| {
        let c = any.parse_next(i)?;
        if state.column == 0 {
            pad(&mut o, state)?;
        }
        state.column += 1;
        q(&mut o, style::Print(c))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Track column position, padding fresh lines and wrapping at the content width.
fn advance(
    mut o: impl Write,
    state: &mut ParseState,
    width: usize,
) -> Result<(), ErrMode<MdError>> {
    if state.column == 0 {
        pad(&mut o, state)?;
    }
    if let Some(limit) = state.content_width
        && state.column > 0
        && state.column + width > limit
    {
        state.column = width;
        q(&mut o, style::Print('\n'))?;
        return pad(&mut o, state);
    }
    state.column += width;
    Ok(())
}

fn pad(mut o: impl Write, state: &ParseState) -> Result<(), ErrMode<MdError>> {
    if state.padding == 0 {
        return Ok(());
    }
    q(&mut o, style::Print(" ".repeat(state.padding)))
}

fn q(mut o: impl Write, cmd: impl Command) -> Result<(), ErrMode<MdError>> {
    use crossterm::QueueableCommand;
    o.queue(cmd).map_err(|e| ErrMode::Cut(MdError::Io(e)))?;
    Ok(())
}
