//! Backtracking pattern matching over a line-buffered text cursor.
//!
//! Two pieces work together:
//!
//! - [`Cursor`]: a position-addressable view of a line-oriented source
//!   (a file or any [`BufRead`]).  Only a window of lines is kept in
//!   memory.  Callers pin lines with LIFO *marks*, revert to them, and
//!   extract the text between a mark and the current position.
//! - [`Regex`]: a tree of matcher [`Node`]s (literals, character classes,
//!   zero-width assertions, sequences, alternations), each carrying
//!   repetition bounds, a backtracking [`Policy`], an optional matching
//!   [`Direction`] and an optional [`Lookaround`].  A [`Matcher`] drives
//!   the tree against a cursor with explicit backtracking.
//!
//! # Architecture
//!
//! ```text
//! regex_syntax::hir::Hir ──RegexBuilder::build──> Node tree ──Matcher──> Cursor
//! ```
//!
//! Parsing pattern text is left to `regex-syntax`; [`RegexBuilder`] only
//! lowers its HIR.  Trees can equally be assembled by hand with the
//! [`Node`] constructors, which is the only way to reach possessive
//! repetitions, backwards matching and lookaround.
//!
//! ## Lines and the sentinel
//!
//! Line terminators are not stored.  [`Cursor::peek`] reports
//! [`LINE_BREAK`] at the end of every line (and before the first column
//! when looking backwards), and advancing over it moves to the adjacent
//! line.  A literal therefore only spans a line break when its text
//! contains `'\n'`, and a character class only matches the break when its
//! set explicitly contains `'\n'` and it is not negated.
//!
//! ## Attempts
//!
//! Every repetition of a node that succeeds leaves an *attempt* behind: the
//! cursor mark set just before the repetition, the position where it
//! ended, and the sub-state of its children (one frame per sequence child,
//! or the chosen alternation branch).  The attempts of one node form its
//! *frame*.  Because every attempt owns a mark, the cursor retains exactly
//! the lines a pending backtrack could still revisit.
//!
//! Undoing an attempt releases its children depth-first, last first, and
//! then reverts the cursor to the attempt's own mark.  Marks are therefore
//! always released in the reverse order they were set.
//!
//! ## Changing a match
//!
//! [`Matcher::change_match`] asks the tree for a different answer:
//!
//! - greedy nodes first re-enter the internal backtracking of their last
//!   repetition (extending again afterwards), then give up one repetition
//!   at a time down to `min`;
//! - reluctant nodes first try one more repetition (up to `max`), then
//!   re-enter the last repetition;
//! - possessive nodes and lookaround nodes never change;
//! - a sequence changes its last child first and only steps back to
//!   earlier children once later ones are exhausted.
//!
//! An alternation commits to the first branch that matches where it was
//! tried.  Changing it re-enters that branch only; once the branch is
//! exhausted the alternation reports exhaustion rather than trying later
//! branches from the same position.  For `(ab|a)` on `"ab"` the only
//! answer is `"ab"`.  Each new repetition of an alternation tries all of
//! its branches again, in order.
//!
//! ## Zero-length repetitions
//!
//! A repetition that succeeds without consuming anything ends the
//! repetition loop at once and counts as reaching `min`.  Without this,
//! `(\b)*` would repeat forever.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use regex_syntax::hir::{self, HirKind};

/// Re-export so users do not need a direct `regex-syntax` dependency.
pub use regex_syntax::hir::Hir;

/// The character reported at line boundaries.
pub const LINE_BREAK: char = '\n';

const BYTE_ORDER_MARK: char = '\u{feff}';

const STREAM_NAME: &str = "<input stream>";

/// Maximum width of the source excerpt shown by [`Diagnostic`].
const CONTEXT_WIDTH: usize = 64;

/// Letters, digits and underscore.  [`LINE_BREAK`] is not a word character.
pub fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors reported by the cursor, the matcher and the HIR lowering.
///
/// A pattern that does not match is not an error: matching operations
/// return `Ok(None)` or `Ok(false)` for that.
#[derive(Debug)]
pub enum Error {
    /// A strict advance ran past the end of the input, or past the start
    /// of the retained lines when moving backwards.
    EndOfInput { position: Position },
    /// A required needle was not found before the input ran out.
    UnterminatedMatch { expected: String, position: Position },
    /// A mark was released or reverted while it was not the most recent
    /// one, or with no mark set at all.  `mark` is the depth recorded in
    /// the offending [`Mark`], if the caller supplied one.
    InvalidMarkOrder { mark: Option<usize>, open: usize },
    /// A node whose repetition bounds are empty (`min > max`).
    RepetitionBoundsViolated { min: usize, max: usize },
    /// A position outside the retained lines was addressed.
    NotRetained { position: Position },
    /// A source location was requested from a cursor that does not read
    /// a file.
    NotFileBacked { name: String },
    /// The file backing a cursor could not be opened.
    Open { path: PathBuf, source: io::Error },
    /// Reading from the underlying source (or echoing it) failed.
    Io(io::Error),
    /// Pattern text rejected by `regex-syntax`.
    Syntax(regex_syntax::Error),
    /// A byte class containing bytes above 0x7F, which do not correspond
    /// to a single `char`.
    UnsupportedClass(hir::Class),
    /// A look-around assertion with no [`Assertion`] counterpart.
    UnsupportedLook(hir::Look),
    /// A literal that is not valid UTF-8.
    UnsupportedLiteral(Box<[u8]>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndOfInput { position } => {
                write!(f, "unexpected end of input at {}", position)
            }
            Self::UnterminatedMatch { expected, position } => {
                write!(f, "expected {} before end of input (stopped at {})", expected, position)
            }
            Self::InvalidMarkOrder { mark: Some(depth), open } => {
                write!(f, "mark #{} released out of order ({} marks open)", depth, open)
            }
            Self::InvalidMarkOrder { mark: None, .. } => write!(f, "no mark to release"),
            Self::RepetitionBoundsViolated { min, max } => {
                write!(f, "invalid repetition bounds {{{},{}}}", min, max)
            }
            Self::NotRetained { position } => {
                write!(f, "position {} is outside the retained lines", position)
            }
            Self::NotFileBacked { name } => {
                write!(f, "cursor {:?} does not read from a file", name)
            }
            Self::Open { path, source } => {
                write!(f, "cannot open {}: {}", path.display(), source)
            }
            Self::Io(err) => write!(f, "read error: {}", err),
            Self::Syntax(err) => write!(f, "failed to parse pattern: {}", err),
            Self::UnsupportedClass(class) => {
                write!(f, "unsupported character class: {:?}", class)
            }
            Self::UnsupportedLook(look) => {
                write!(f, "unsupported look-around assertion: {:?}", look)
            }
            Self::UnsupportedLiteral(bytes) => {
                write!(f, "unsupported non-UTF-8 literal: {:?}", bytes)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } => Some(source),
            Self::Io(err) => Some(err),
            Self::Syntax(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

// ---------------------------------------------------------------------------
// Positions, spans and options
// ---------------------------------------------------------------------------

/// A cursor coordinate.  Ordering is by line, then column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    /// 1-based line number.
    pub line: usize,
    /// 0-based column, counted in `char`s.
    pub column: usize,
}

impl Position {
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// The region between two positions, with `start <= end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    /// Builds a span from two positions given in either order.
    pub fn new(a: Position, b: Position) -> Self {
        if a <= b {
            Self { start: a, end: b }
        } else {
            Self { start: b, end: a }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    #[default]
    Forwards,
    Backwards,
}

/// Options for moving and scanning the cursor.
///
/// * `direction`: which way to move.
/// * `single_line`: stop at the line boundary instead of crossing it.
/// * `consume`: [`Cursor::matches`] keeps the cursor after the needle
///   instead of restoring it.
/// * `lookahead`: [`Cursor::seek`] restores the starting position once
///   the search is over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub direction: Direction,
    pub single_line: bool,
    pub consume: bool,
    pub lookahead: bool,
}

impl ScanOptions {
    pub const fn new() -> Self {
        Self {
            direction: Direction::Forwards,
            single_line: false,
            consume: false,
            lookahead: false,
        }
    }

    pub const fn towards(self, direction: Direction) -> Self {
        Self { direction, ..self }
    }

    pub const fn backwards(self) -> Self {
        self.towards(Direction::Backwards)
    }

    pub const fn single_line(self) -> Self {
        Self {
            single_line: true,
            ..self
        }
    }

    pub const fn consume(self) -> Self {
        Self {
            consume: true,
            ..self
        }
    }

    pub const fn lookahead(self) -> Self {
        Self {
            lookahead: true,
            ..self
        }
    }
}

/// What happens to the mark after reverting to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevertMode {
    KeepMark,
    RemoveMark,
}

/// A token for a mark set by [`Cursor::set_mark`].
///
/// The token records the mark's depth in the mark stack so that
/// [`Cursor::release`] and [`Cursor::revert_to`] can reject marks
/// released out of order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mark {
    depth: usize,
    position: Position,
}

impl Mark {
    pub fn position(&self) -> Position {
        self.position
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// What [`Cursor::matches`] and [`Cursor::seek`] look for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Needle<'a> {
    Char(char),
    Str(&'a str),
    /// Any single character of the string.
    AnyOf(&'a str),
    /// Any single character not in the string.
    NoneOf(&'a str),
    /// A position where exactly one neighbour is a word character.
    WordBoundary,
}

impl fmt::Display for Needle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Char(c) => write!(f, "{:?}", c),
            Self::Str(text) => write!(f, "{:?}", text),
            Self::AnyOf(chars) => write!(f, "any of {:?}", chars),
            Self::NoneOf(chars) => write!(f, "none of {:?}", chars),
            Self::WordBoundary => write!(f, "a word boundary"),
        }
    }
}

/// A character test applied while extracting text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe<'a> {
    /// Hit when some extracted character is in the set.
    AnyOf(&'a str),
    /// Hit when some extracted character is outside the set.  With
    /// whitespace as the set this detects non-blank content.
    NoneOf(&'a str),
}

impl Probe<'_> {
    fn hit(self, c: char) -> bool {
        match self {
            Self::AnyOf(chars) => chars.contains(c),
            Self::NoneOf(chars) => !chars.contains(c),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractOptions<'a> {
    /// Leave the mark set after extracting.
    pub keep_mark: bool,
    /// Insert `'\n'` between lines instead of joining them directly.
    pub keep_newlines: bool,
    pub probe: Option<Probe<'a>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extracted {
    pub text: String,
    /// Whether the probe matched any extracted character (always `false`
    /// without a probe).
    pub probe_hit: bool,
}

/// Construction-time configuration of a [`Cursor`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CursorOptions {
    /// Name used in diagnostics.  Defaults to the file path, or
    /// `"<input stream>"` for streams.
    pub name: Option<String>,
    /// A line ending in this character is joined with the next one.
    pub continuation: Option<char>,
}

/// Where a file-backed cursor stood, so that it can be reopened later.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub path: PathBuf,
    pub position: Position,
}

/// A message tied to a cursor position, rendered with the offending line
/// and a caret under the column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub name: String,
    pub position: Position,
    pub line: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "error in {:?}, line {}, column {}: {}",
            self.name, self.position.line, self.position.column, self.message
        )?;
        let chars: Vec<char> = self.line.chars().collect();
        if chars.is_empty() {
            return Ok(());
        }
        let pos = self.position.column.min(chars.len() - 1);
        let excerpt = |from: usize, to: usize| chars[from..to].iter().collect::<String>();
        let len = chars.len();
        if len <= CONTEXT_WIDTH {
            writeln!(f, "\t{}", self.line)?;
            writeln!(f, "\t{}^", "_".repeat(pos))
        } else if pos < CONTEXT_WIDTH / 2 {
            writeln!(f, "\t{}...", excerpt(0, CONTEXT_WIDTH - 3))?;
            writeln!(f, "\t{}^", "_".repeat(pos))
        } else if len - pos < CONTEXT_WIDTH / 2 {
            writeln!(f, "\t...{}", excerpt(len - (CONTEXT_WIDTH - 3), len))?;
            writeln!(f, "\t{}^", "_".repeat(pos - (len - CONTEXT_WIDTH)))
        } else {
            let from = pos - CONTEXT_WIDTH / 2 + 3;
            writeln!(f, "\t...{}...", excerpt(from, from + CONTEXT_WIDTH - 6))?;
            writeln!(f, "\t{}^", "_".repeat(CONTEXT_WIDTH / 2))
        }
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LineBuf {
    chars: Vec<char>,
    /// Marks currently pinning this line.
    marks: usize,
}

struct Echo {
    out: Box<dyn Write + Send>,
    prefix: String,
}

/// A line-buffered, mark-addressable view of a text source.
///
/// Lines are read lazily.  A line stays in memory while the cursor is on
/// it or past it (after a revert), and while a mark points into it or
/// into an older line.  Older lines are dropped as soon as the cursor
/// moves on, so a scan with no marks set keeps a single line in memory.
///
/// Line terminators (`\n` or `\r\n`) are stripped when a line is read; see
/// [`LINE_BREAK`] for how boundaries are reported.
pub struct Cursor<R> {
    name: String,
    path: Option<PathBuf>,
    source: R,
    exhausted: bool,
    /// Set by the first failed read.  Later reads fail the same way, so
    /// no line after the lost one is ever numbered.
    failure: Option<(io::ErrorKind, String)>,
    continuation: Option<char>,
    echo: Option<Echo>,
    /// Retained lines, newest first: `lines[max_line - n]` holds line `n`.
    lines: VecDeque<LineBuf>,
    min_line: usize,
    max_line: usize,
    line: usize,
    column: usize,
    marks: Vec<Position>,
}

impl<R> fmt::Debug for Cursor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("name", &self.name)
            .field("position", &self.position())
            .field("retained", &self.retained_lines())
            .field("marks", &self.marks)
            .finish_non_exhaustive()
    }
}

impl Cursor<BufReader<File>> {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::file_with_options(path, CursorOptions::default())
    }

    pub fn file_with_options(
        path: impl AsRef<Path>,
        options: CursorOptions,
    ) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let options = CursorOptions {
            name: Some(options.name.unwrap_or_else(|| path.display().to_string())),
            ..options
        };
        let mut cursor = Cursor::with_options(BufReader::new(file), options)?;
        cursor.path = Some(path.to_path_buf());
        Ok(cursor)
    }

    /// Opens the file of `location` again and moves to its position.
    ///
    /// Fails with [`Error::EndOfInput`] if the file no longer has that
    /// line.  A column past the end of the line is clamped.
    pub fn reopen(location: &SourceLocation) -> Result<Self, Error> {
        let mut cursor = Self::from_file(&location.path)?;
        while cursor.line < location.position.line {
            if !cursor.advance_line(Direction::Forwards)? {
                return Err(Error::EndOfInput {
                    position: cursor.position(),
                });
            }
        }
        cursor.column = location.position.column.min(cursor.current().chars.len());
        log::debug!("reopened {} at {}", cursor.name, cursor.position());
        Ok(cursor)
    }
}

impl<R: BufRead> Cursor<R> {
    pub fn from_stream(source: R) -> Result<Self, Error> {
        Self::with_options(source, CursorOptions::default())
    }

    /// Creates a cursor positioned at line 1, column 0.  Empty input
    /// yields a single empty line.
    pub fn with_options(source: R, options: CursorOptions) -> Result<Self, Error> {
        let mut cursor = Cursor {
            name: options.name.unwrap_or_else(|| STREAM_NAME.to_string()),
            path: None,
            source,
            exhausted: false,
            failure: None,
            continuation: options.continuation,
            echo: None,
            lines: VecDeque::new(),
            min_line: 1,
            max_line: 0,
            line: 1,
            column: 0,
            marks: Vec::new(),
        };
        if !cursor.fill_line()? {
            cursor.lines.push_front(LineBuf::default());
            cursor.max_line = 1;
        }
        Ok(cursor)
    }

    fn read_raw_line(&mut self) -> Result<Option<String>, Error> {
        if let Some((kind, message)) = &self.failure {
            return Err(Error::Io(io::Error::new(*kind, message.clone())));
        }
        let mut text = String::new();
        let read = match self.source.read_line(&mut text) {
            Ok(read) => read,
            Err(err) => {
                log::debug!("{}: read failed after line {}: {}", self.name, self.max_line, err);
                self.failure = Some((err.kind(), err.to_string()));
                return Err(err.into());
            }
        };
        if read == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        if text.ends_with('\n') {
            text.pop();
            if text.ends_with('\r') {
                text.pop();
            }
        }
        Ok(Some(text))
    }

    /// Reads one more logical line into the buffer.  Returns `false` once
    /// the source is exhausted.
    fn fill_line(&mut self) -> Result<bool, Error> {
        if self.exhausted {
            return Ok(false);
        }
        let Some(mut text) = self.read_raw_line()? else {
            return Ok(false);
        };
        // The continuation character itself stays in the joined line.
        if let Some(continuation) = self.continuation {
            while text.ends_with(continuation) {
                match self.read_raw_line()? {
                    Some(next) => text.push_str(&next),
                    None => break,
                }
            }
        }
        if self.max_line == 0 && text.starts_with(BYTE_ORDER_MARK) {
            text.drain(..BYTE_ORDER_MARK.len_utf8());
        }
        let number = self.max_line + 1;
        log::trace!("{}: read line {}", self.name, number);
        if let Some(echo) = self.echo.as_mut() {
            writeln!(echo.out, "{}{}", echo.prefix, text)?;
        }
        self.lines.push_front(LineBuf {
            chars: text.chars().collect(),
            marks: 0,
        });
        self.max_line = number;
        Ok(true)
    }

    /// Moves one character in `options.direction`.
    ///
    /// At a line edge the move crosses to the adjacent line unless
    /// `single_line` is set.  Returns `false`, leaving the cursor where it
    /// was, at the end of input, before the oldest retained line, or at a
    /// line edge in single-line mode.
    pub fn advance(&mut self, options: ScanOptions) -> Result<bool, Error> {
        match options.direction {
            Direction::Forwards => {
                if self.column < self.current().chars.len() {
                    self.column += 1;
                    return Ok(true);
                }
                if options.single_line {
                    return Ok(false);
                }
                self.next_line()
            }
            Direction::Backwards => {
                if self.column > 0 {
                    self.column -= 1;
                    return Ok(true);
                }
                if options.single_line {
                    return Ok(false);
                }
                Ok(self.previous_line())
            }
        }
    }

    /// Moves to the start of the next line, or to the end of the previous
    /// one.
    pub fn advance_line(&mut self, direction: Direction) -> Result<bool, Error> {
        match direction {
            Direction::Forwards => self.next_line(),
            Direction::Backwards => Ok(self.previous_line()),
        }
    }

    /// Advances up to `count` characters and returns how many moves
    /// succeeded.
    pub fn advance_by(&mut self, count: usize, options: ScanOptions) -> Result<usize, Error> {
        for moved in 0..count {
            if !self.advance(options)? {
                return Ok(moved);
            }
        }
        Ok(count)
    }

    /// Like [`advance`](Self::advance), but running out of input is an error.
    pub fn expect_advance(&mut self, direction: Direction) -> Result<(), Error> {
        if self.advance(ScanOptions::new().towards(direction))? {
            Ok(())
        } else {
            Err(Error::EndOfInput {
                position: self.position(),
            })
        }
    }

    fn next_line(&mut self) -> Result<bool, Error> {
        if self.line == self.max_line && !self.fill_line()? {
            return Ok(false);
        }
        self.line += 1;
        self.column = 0;
        self.retire();
        Ok(true)
    }

    /// `true` at the end of the last line of the input.
    pub fn is_at_end(&mut self) -> Result<bool, Error> {
        Ok(self.at_line_end() && self.line == self.max_line && !self.fill_line()?)
    }

    /// Tests whether `needle` matches at the cursor, looking in
    /// `options.direction`.
    ///
    /// With `consume` a successful match leaves the cursor after the
    /// needle; otherwise the cursor does not move.
    pub fn matches(&mut self, needle: Needle<'_>, options: ScanOptions) -> Result<bool, Error> {
        let mark = self.set_mark();
        let matched = self.consume_needle(needle, options)?;
        if matched && options.consume {
            self.release(mark)?;
        } else {
            self.revert_to(mark, RevertMode::RemoveMark)?;
        }
        Ok(matched)
    }

    /// Moves until `needle` matches at the cursor and returns whether it
    /// was found.
    ///
    /// The cursor stops in front of the needle, or after it with
    /// `consume`.  With `lookahead` it returns to the starting position
    /// either way.  A failed search leaves the cursor at the end of the
    /// input (or the start of the retained lines when going backwards).
    pub fn seek(&mut self, needle: Needle<'_>, options: ScanOptions) -> Result<bool, Error> {
        let start = options.lookahead.then(|| self.set_mark());
        let step = ScanOptions {
            consume: false,
            lookahead: false,
            ..options
        };
        let found = loop {
            if self.matches(needle, options)? {
                break true;
            }
            if !self.advance(step)? {
                break false;
            }
        };
        if let Some(start) = start {
            self.revert_to(start, RevertMode::RemoveMark)?;
        }
        log::trace!("{}: seek {} found={} at {}", self.name, needle, found, self.position());
        Ok(found)
    }

    /// [`seek`](Self::seek), failing with [`Error::UnterminatedMatch`] when
    /// the needle never shows up.
    pub fn expect(&mut self, needle: Needle<'_>, options: ScanOptions) -> Result<(), Error> {
        if self.seek(needle, options)? {
            Ok(())
        } else {
            Err(Error::UnterminatedMatch {
                expected: needle.to_string(),
                position: self.position(),
            })
        }
    }

    fn consume_needle(&mut self, needle: Needle<'_>, options: ScanOptions) -> Result<bool, Error> {
        let step = ScanOptions {
            consume: false,
            lookahead: false,
            ..options
        };
        match needle {
            Needle::Char(c) => self.consume_if(|p| p == c, step),
            Needle::AnyOf(chars) => self.consume_if(|p| chars.contains(p), step),
            Needle::NoneOf(chars) => self.consume_if(|p| !chars.contains(p), step),
            Needle::WordBoundary => Ok(self.at_word_boundary()),
            Needle::Str(text) => {
                let mut chars = text.chars();
                loop {
                    let next = match options.direction {
                        Direction::Forwards => chars.next(),
                        Direction::Backwards => chars.next_back(),
                    };
                    let Some(expected) = next else {
                        return Ok(true);
                    };
                    if !self.consume_if(|p| p == expected, step)? {
                        return Ok(false);
                    }
                }
            }
        }
    }

    fn consume_if(
        &mut self,
        test: impl Fn(char) -> bool,
        step: ScanOptions,
    ) -> Result<bool, Error> {
        Ok(test(self.peek(step.direction)) && self.advance(step)?)
    }
}

impl<R> Cursor<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backing file, for cursors created with [`Cursor::from_file`].
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    pub fn line_number(&self) -> usize {
        self.line
    }

    pub fn column(&self) -> usize {
        self.column
    }

    pub fn current_line(&self) -> String {
        self.current().chars.iter().collect()
    }

    pub fn is_at_start(&self) -> bool {
        self.line == 1 && self.column == 0
    }

    pub fn at_line_end(&self) -> bool {
        self.column == self.current().chars.len()
    }

    /// The character that an advance in `direction` would cross, or
    /// [`LINE_BREAK`] at the corresponding line edge.
    pub fn peek(&self, direction: Direction) -> char {
        let chars = &self.current().chars;
        let at = match direction {
            Direction::Forwards => chars.get(self.column),
            Direction::Backwards => self.column.checked_sub(1).and_then(|col| chars.get(col)),
        };
        at.copied().unwrap_or(LINE_BREAK)
    }

    pub fn at_word_boundary(&self) -> bool {
        let before = is_word_char(self.peek(Direction::Backwards));
        before != is_word_char(self.peek(Direction::Forwards))
    }

    /// The line numbers currently held in memory.
    pub fn retained_lines(&self) -> RangeInclusive<usize> {
        self.min_line..=self.max_line
    }

    /// Number of marks currently set.
    pub fn mark_depth(&self) -> usize {
        self.marks.len()
    }

    fn current(&self) -> &LineBuf {
        self.line_buf(self.line)
    }

    fn line_buf(&self, line: usize) -> &LineBuf {
        &self.lines[self.max_line - line]
    }

    fn line_buf_mut(&mut self, line: usize) -> &mut LineBuf {
        let idx = self.max_line - line;
        &mut self.lines[idx]
    }

    fn previous_line(&mut self) -> bool {
        if self.line <= self.min_line {
            return false;
        }
        self.line -= 1;
        self.column = self.current().chars.len();
        true
    }

    /// Drops the oldest lines that are behind the cursor and not pinned
    /// by a mark.
    fn retire(&mut self) {
        while self.min_line < self.line
            && self.lines.back().is_some_and(|oldest| oldest.marks == 0)
        {
            self.lines.pop_back();
            self.min_line += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Marks
    // -----------------------------------------------------------------------

    /// Records the current position on the mark stack.  The line of the
    /// mark (and every newer line) stays retained until the mark is gone.
    pub fn set_mark(&mut self) -> Mark {
        let position = self.position();
        self.line_buf_mut(position.line).marks += 1;
        self.marks.push(position);
        Mark {
            depth: self.marks.len() - 1,
            position,
        }
    }

    /// Pops the most recent mark without moving.
    pub fn unset_mark(&mut self) -> Result<(), Error> {
        let position = self
            .marks
            .pop()
            .ok_or(Error::InvalidMarkOrder { mark: None, open: 0 })?;
        self.line_buf_mut(position.line).marks -= 1;
        self.retire();
        Ok(())
    }

    /// Moves back to the most recent mark.
    pub fn revert_to_mark(&mut self, mode: RevertMode) -> Result<(), Error> {
        let &position = self
            .marks
            .last()
            .ok_or(Error::InvalidMarkOrder { mark: None, open: 0 })?;
        self.line = position.line;
        self.column = position.column;
        if mode == RevertMode::RemoveMark {
            self.unset_mark()?;
        }
        Ok(())
    }

    /// Replaces the most recent mark with one at the current position.
    pub fn reset_mark(&mut self) -> Result<Mark, Error> {
        self.unset_mark()?;
        Ok(self.set_mark())
    }

    /// Pops `mark`, which must be the most recent mark.
    pub fn release(&mut self, mark: Mark) -> Result<(), Error> {
        self.check_mark(mark)?;
        self.unset_mark()
    }

    /// Moves back to `mark`, which must be the most recent mark.
    pub fn revert_to(&mut self, mark: Mark, mode: RevertMode) -> Result<(), Error> {
        self.check_mark(mark)?;
        self.revert_to_mark(mode)
    }

    fn check_mark(&self, mark: Mark) -> Result<(), Error> {
        let open = self.marks.len();
        if mark.depth + 1 == open && self.marks[mark.depth] == mark.position {
            Ok(())
        } else {
            Err(Error::InvalidMarkOrder {
                mark: Some(mark.depth),
                open,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Text extraction
    // -----------------------------------------------------------------------

    /// Returns the text between the most recent mark and the cursor, in
    /// source order whichever side the mark is on.  The mark is popped
    /// unless `keep_mark` is set.
    pub fn extract(&mut self, options: ExtractOptions<'_>) -> Result<Extracted, Error> {
        let &mark = self
            .marks
            .last()
            .ok_or(Error::InvalidMarkOrder { mark: None, open: 0 })?;
        let text = self.slice(Span::new(mark, self.position()), options.keep_newlines)?;
        let probe_hit = options
            .probe
            .is_some_and(|probe| text.chars().any(|c| c != LINE_BREAK && probe.hit(c)));
        if !options.keep_mark {
            self.unset_mark()?;
        }
        Ok(Extracted { text, probe_hit })
    }

    /// The text covered by `span`.  Both ends must lie within the
    /// retained lines.
    pub fn slice(&self, span: Span, keep_newlines: bool) -> Result<String, Error> {
        for position in [span.start, span.end] {
            if !self.retained_lines().contains(&position.line)
                || position.column > self.line_buf(position.line).chars.len()
            {
                return Err(Error::NotRetained { position });
            }
        }
        let mut text = String::new();
        for line in span.start.line..=span.end.line {
            let chars = &self.line_buf(line).chars;
            let from = if line == span.start.line { span.start.column } else { 0 };
            let to = if line == span.end.line { span.end.column } else { chars.len() };
            if line > span.start.line && keep_newlines {
                text.push(LINE_BREAK);
            }
            text.extend(&chars[from..to]);
        }
        Ok(text)
    }

    // -----------------------------------------------------------------------
    // Locations and diagnostics
    // -----------------------------------------------------------------------

    pub fn location(&self) -> Result<SourceLocation, Error> {
        match &self.path {
            Some(path) => Ok(SourceLocation {
                path: path.clone(),
                position: self.position(),
            }),
            None => Err(Error::NotFileBacked {
                name: self.name.clone(),
            }),
        }
    }

    /// Copies every line read from now on to `out`, each preceded by
    /// `prefix`.  With `print_current` the current line is written first.
    pub fn enable_echo(
        &mut self,
        out: impl Write + Send + 'static,
        prefix: impl Into<String>,
        print_current: bool,
    ) -> Result<(), Error> {
        let mut echo = Echo {
            out: Box::new(out),
            prefix: prefix.into(),
        };
        if print_current {
            writeln!(echo.out, "{}{}", echo.prefix, self.current_line())?;
        }
        self.echo = Some(echo);
        Ok(())
    }

    pub fn disable_echo(&mut self) {
        self.echo = None;
    }

    pub fn diagnostic(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic {
            name: self.name.clone(),
            position: self.position(),
            line: self.current_line(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Character sets
// ---------------------------------------------------------------------------

/// A set of `char`s stored as sorted, non-overlapping inclusive ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CharSet {
    ranges: Box<[(char, char)]>,
}

impl CharSet {
    /// Builds a set from inclusive ranges given in any order.  Reversed
    /// ranges are flipped, and overlapping or adjacent ranges are merged.
    pub fn new(ranges: impl IntoIterator<Item = (char, char)>) -> Self {
        let mut ranges: Vec<(char, char)> = ranges
            .into_iter()
            .map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
            .collect();
        ranges.sort_unstable();
        let mut merged: Vec<(char, char)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if (start as u32) <= (last.1 as u32) + 1 => {
                    last.1 = last.1.max(end);
                }
                _ => merged.push((start, end)),
            }
        }
        Self {
            ranges: merged.into_boxed_slice(),
        }
    }

    /// The set of the characters in `chars`.
    pub fn from_chars(chars: &str) -> Self {
        Self::new(chars.chars().map(|c| (c, c)))
    }

    pub fn contains(&self, c: char) -> bool {
        self.ranges
            .binary_search_by(|&(start, end)| {
                if end < c {
                    Ordering::Less
                } else if start > c {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn ranges(&self) -> &[(char, char)] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

impl fmt::Display for CharSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 8;
        write!(f, "[")?;
        for &(start, end) in self.ranges.iter().take(SHOWN) {
            if start == end {
                write!(f, "{}", start.escape_debug())?;
            } else {
                write!(f, "{}-{}", start.escape_debug(), end.escape_debug())?;
            }
        }
        if self.ranges.len() > SHOWN {
            write!(f, "...(+{} ranges)", self.ranges.len() - SHOWN)?;
        }
        write!(f, "]")
    }
}

// ---------------------------------------------------------------------------
// Matcher nodes
// ---------------------------------------------------------------------------

/// Zero-width tests on the cursor position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Assertion {
    /// Line 1, column 0.
    Start,
    /// End of the last line of the input.
    End,
    LineStart,
    LineEnd,
    /// Either edge of a line.
    LineBoundary,
    WordBoundary,
    NotWordBoundary,
}

impl Assertion {
    fn holds<R: BufRead>(self, cursor: &mut Cursor<R>) -> Result<bool, Error> {
        Ok(match self {
            Self::Start => cursor.is_at_start(),
            Self::End => cursor.is_at_end()?,
            Self::LineStart => cursor.column() == 0,
            Self::LineEnd => cursor.at_line_end(),
            Self::LineBoundary => cursor.column() == 0 || cursor.at_line_end(),
            Self::WordBoundary => cursor.at_word_boundary(),
            Self::NotWordBoundary => !cursor.at_word_boundary(),
        })
    }

    fn label(self) -> &'static str {
        match self {
            Self::Start => r"\A",
            Self::End => r"\z",
            Self::LineStart => "(?m:^)",
            Self::LineEnd => "(?m:$)",
            Self::LineBoundary => "line-boundary",
            Self::WordBoundary => r"\b",
            Self::NotWordBoundary => r"\B",
        }
    }
}

/// How a repeated node explores its repetition counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Policy {
    /// Take as many repetitions as possible, give them back one by one.
    #[default]
    Greedy,
    /// Take as few repetitions as possible, add them one by one.
    Reluctant,
    /// Take as many repetitions as possible and never give any back.
    Possessive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lookaround {
    /// The node must match; nothing is consumed.
    Positive,
    /// The node must not match; nothing is consumed.
    Negative,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Literal(Box<[char]>),
    Class { set: Arc<CharSet>, negated: bool },
    Assertion(Assertion),
    /// Children matched one after the other (last to first when matching
    /// backwards).
    Sequence(Vec<Node>),
    /// Branches tried in order; the first that matches is taken.
    Alternation(Vec<Node>),
}

/// One node of a matcher tree.
///
/// Every node is matched between `min` and `max` times (`None` meaning
/// unbounded).  The defaults are exactly once, greedy, in the parent's
/// direction, capturing nothing.
#[derive(Clone, Debug)]
pub struct Node {
    kind: NodeKind,
    min: usize,
    max: Option<usize>,
    /// Capture group index, `0` for none.
    group: usize,
    policy: Policy,
    /// `None` inherits the parent's direction.
    direction: Option<Direction>,
    look: Option<Lookaround>,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            min: 1,
            max: Some(1),
            group: 0,
            policy: Policy::Greedy,
            direction: None,
            look: None,
        }
    }

    /// Matches `text` exactly.  A `'\n'` in `text` matches a line break.
    pub fn literal(text: &str) -> Self {
        Self::new(NodeKind::Literal(text.chars().collect()))
    }

    pub fn class(set: impl Into<Arc<CharSet>>) -> Self {
        Self::new(NodeKind::Class {
            set: set.into(),
            negated: false,
        })
    }

    /// Matches any character outside `set`.  Never matches a line break.
    pub fn negated_class(set: impl Into<Arc<CharSet>>) -> Self {
        Self::new(NodeKind::Class {
            set: set.into(),
            negated: true,
        })
    }

    pub fn any_of(chars: &str) -> Self {
        Self::class(CharSet::from_chars(chars))
    }

    pub fn none_of(chars: &str) -> Self {
        Self::negated_class(CharSet::from_chars(chars))
    }

    pub fn assertion(assertion: Assertion) -> Self {
        Self::new(NodeKind::Assertion(assertion))
    }

    pub fn sequence(children: impl IntoIterator<Item = Node>) -> Self {
        Self::new(NodeKind::Sequence(children.into_iter().collect()))
    }

    pub fn alternation(branches: impl IntoIterator<Item = Node>) -> Self {
        Self::new(NodeKind::Alternation(branches.into_iter().collect()))
    }

    /// Sets the repetition bounds.  Bounds with `min > max` are rejected
    /// by [`Regex::new`].
    pub fn repeat(self, min: usize, max: Option<usize>) -> Self {
        Self { min, max, ..self }
    }

    pub fn optional(self) -> Self {
        self.repeat(0, Some(1))
    }

    pub fn zero_or_more(self) -> Self {
        self.repeat(0, None)
    }

    pub fn one_or_more(self) -> Self {
        self.repeat(1, None)
    }

    pub fn greedy(self) -> Self {
        Self {
            policy: Policy::Greedy,
            ..self
        }
    }

    pub fn reluctant(self) -> Self {
        Self {
            policy: Policy::Reluctant,
            ..self
        }
    }

    pub fn possessive(self) -> Self {
        Self {
            policy: Policy::Possessive,
            ..self
        }
    }

    /// Matches this node (and, unless they override it, its children)
    /// towards the start of the input.
    pub fn backwards(self) -> Self {
        Self {
            direction: Some(Direction::Backwards),
            ..self
        }
    }

    pub fn forwards(self) -> Self {
        Self {
            direction: Some(Direction::Forwards),
            ..self
        }
    }

    /// Turns the node into a zero-width positive lookaround.  Combine with
    /// [`backwards`](Self::backwards) for a lookbehind.
    pub fn lookahead(self) -> Self {
        Self {
            look: Some(Lookaround::Positive),
            ..self
        }
    }

    pub fn negative_lookahead(self) -> Self {
        Self {
            look: Some(Lookaround::Negative),
            ..self
        }
    }

    /// Records the span of the node's last repetition as group `group`.
    pub fn capture(self, group: usize) -> Self {
        Self { group, ..self }
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> Option<usize> {
        self.max
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn look(&self) -> Option<Lookaround> {
        self.look
    }

    fn max_reps(&self) -> usize {
        self.max.unwrap_or(usize::MAX)
    }

    fn direction(&self, parent: Direction) -> Direction {
        self.direction.unwrap_or(parent)
    }

    /// Whether the node still has every modifier at its default.
    fn is_plain(&self) -> bool {
        self.min == 1
            && self.max == Some(1)
            && self.group == 0
            && self.policy == Policy::Greedy
            && self.direction.is_none()
            && self.look.is_none()
    }

    fn label(&self) -> &'static str {
        match self.kind {
            NodeKind::Literal(_) => "literal",
            NodeKind::Class { .. } => "class",
            NodeKind::Assertion(_) => "assertion",
            NodeKind::Sequence(_) => "sequence",
            NodeKind::Alternation(_) => "alternation",
        }
    }

    fn validate(&self, groups: &mut usize) -> Result<(), Error> {
        if let Some(max) = self.max
            && self.min > max
        {
            return Err(Error::RepetitionBoundsViolated { min: self.min, max });
        }
        *groups = (*groups).max(self.group + 1);
        if let NodeKind::Sequence(children) | NodeKind::Alternation(children) = &self.kind {
            for child in children {
                child.validate(groups)?;
            }
        }
        Ok(())
    }

    fn write_tree(&self, out: &mut impl Write, depth: usize) -> io::Result<()> {
        write!(out, "{:indent$}", "", indent = depth * 2)?;
        match &self.kind {
            NodeKind::Literal(text) => {
                write!(out, "literal {:?}", text.iter().collect::<String>())?
            }
            NodeKind::Class { set, negated } => {
                write!(out, "class {}{}", if *negated { "^" } else { "" }, set)?
            }
            NodeKind::Assertion(assertion) => write!(out, "assert {}", assertion.label())?,
            NodeKind::Sequence(_) => write!(out, "sequence")?,
            NodeKind::Alternation(_) => write!(out, "alternation")?,
        }
        if self.min != 1 || self.max != Some(1) {
            match self.max {
                Some(max) => write!(out, " {{{},{}}}", self.min, max)?,
                None => write!(out, " {{{},}}", self.min)?,
            }
            match self.policy {
                Policy::Greedy => {}
                Policy::Reluctant => write!(out, "?")?,
                Policy::Possessive => write!(out, "+")?,
            }
        }
        if self.group > 0 {
            write!(out, " group={}", self.group)?;
        }
        if self.direction == Some(Direction::Backwards) {
            write!(out, " backwards")?;
        }
        match self.look {
            Some(Lookaround::Positive) => write!(out, " lookahead")?,
            Some(Lookaround::Negative) => write!(out, " negative-lookahead")?,
            None => {}
        }
        writeln!(out)?;
        if let NodeKind::Sequence(children) | NodeKind::Alternation(children) = &self.kind {
            for child in children {
                child.write_tree(out, depth + 1)?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Attempts
// ---------------------------------------------------------------------------

/// The successful repetitions of one node, oldest first.
#[derive(Debug, Default)]
struct Frame {
    attempts: Vec<Attempt>,
}

/// One successful repetition of a node.
#[derive(Debug)]
struct Attempt {
    /// Set just before the repetition started.
    mark: Mark,
    end: Position,
    /// 1-based repetition index.
    rep: usize,
    sub: SubMatch,
}

#[derive(Debug)]
enum SubMatch {
    /// Literal, class or assertion: the number of characters consumed.
    Leaf(usize),
    /// One frame per matched child, in matching order.
    Sequence(Vec<Frame>),
    Alternation { branch: usize, frame: Frame },
    /// A lookaround that held.  Its inner match is already undone.
    Look,
}

impl Attempt {
    fn len(&self) -> usize {
        match &self.sub {
            SubMatch::Leaf(len) => *len,
            SubMatch::Sequence(frames) => frames.iter().map(Frame::len).sum(),
            SubMatch::Alternation { frame, .. } => frame.len(),
            SubMatch::Look => 0,
        }
    }

    /// Undoes the repetition: children first, then back to the mark.
    fn release<R>(self, cursor: &mut Cursor<R>) -> Result<(), Error> {
        match self.sub {
            SubMatch::Sequence(frames) => {
                for frame in frames.into_iter().rev() {
                    frame.release(cursor)?;
                }
            }
            SubMatch::Alternation { frame, .. } => frame.release(cursor)?,
            SubMatch::Leaf(_) | SubMatch::Look => {}
        }
        cursor.revert_to(self.mark, RevertMode::RemoveMark)
    }

    /// Drops the marks of the repetition, keeping the cursor where it is.
    fn commit<R>(self, cursor: &mut Cursor<R>) -> Result<(), Error> {
        match self.sub {
            SubMatch::Sequence(frames) => {
                for frame in frames.into_iter().rev() {
                    frame.commit(cursor)?;
                }
            }
            SubMatch::Alternation { frame, .. } => frame.commit(cursor)?,
            SubMatch::Leaf(_) | SubMatch::Look => {}
        }
        cursor.release(self.mark)
    }
}

impl Frame {
    fn len(&self) -> usize {
        self.attempts.iter().map(Attempt::len).sum()
    }

    /// A zero-length repetition ends the repetition loop.
    fn saturated(&self) -> bool {
        self.attempts.last().is_some_and(|attempt| attempt.len() == 0)
    }

    fn release<R>(mut self, cursor: &mut Cursor<R>) -> Result<(), Error> {
        while let Some(attempt) = self.attempts.pop() {
            attempt.release(cursor)?;
        }
        Ok(())
    }

    fn commit<R>(mut self, cursor: &mut Cursor<R>) -> Result<(), Error> {
        while let Some(attempt) = self.attempts.pop() {
            attempt.commit(cursor)?;
        }
        Ok(())
    }

    fn collect_captures(&self, node: &Node, parent: Direction, groups: &mut [Option<Span>]) {
        let dir = node.direction(parent);
        if node.group > 0
            && let Some(last) = self.attempts.last()
        {
            groups[node.group] = Some(Span::new(last.mark.position, last.end));
        }
        for attempt in &self.attempts {
            match (&node.kind, &attempt.sub) {
                (NodeKind::Sequence(children), SubMatch::Sequence(frames)) => {
                    for (step, frame) in frames.iter().enumerate() {
                        let child = &children[ordered_index(dir, step, children.len())];
                        frame.collect_captures(child, dir, groups);
                    }
                }
                (NodeKind::Alternation(branches), SubMatch::Alternation { branch, frame }) => {
                    frame.collect_captures(&branches[*branch], dir, groups);
                }
                _ => {}
            }
        }
    }
}

/// Index of the child matched at `step` when walking `len` children.
fn ordered_index(dir: Direction, step: usize, len: usize) -> usize {
    match dir {
        Direction::Forwards => step,
        Direction::Backwards => len - 1 - step,
    }
}

// ---------------------------------------------------------------------------
// Backtracking driver
// ---------------------------------------------------------------------------

impl Node {
    /// Matches the node at the cursor.  On success the cursor sits at the
    /// end of the match and the returned frame holds one mark per
    /// repetition.  On failure the cursor and the mark stack are as they
    /// were.
    fn match_node<R: BufRead>(
        &self,
        cursor: &mut Cursor<R>,
        parent: Direction,
    ) -> Result<Option<Frame>, Error> {
        let dir = self.direction(parent);
        match self.look {
            Some(look) => self.match_look(look, cursor, dir),
            None => self.match_repeated(cursor, dir),
        }
    }

    fn match_repeated<R: BufRead>(
        &self,
        cursor: &mut Cursor<R>,
        dir: Direction,
    ) -> Result<Option<Frame>, Error> {
        let target = match self.policy {
            Policy::Reluctant => self.min,
            Policy::Greedy | Policy::Possessive => self.max_reps(),
        };
        let mut frame = Frame::default();
        Ok(self.fill(&mut frame, cursor, dir, target)?.then_some(frame))
    }

    fn match_look<R: BufRead>(
        &self,
        look: Lookaround,
        cursor: &mut Cursor<R>,
        dir: Direction,
    ) -> Result<Option<Frame>, Error> {
        let mark = cursor.set_mark();
        let matched = match self.match_repeated(cursor, dir)? {
            Some(inner) => {
                inner.release(cursor)?;
                true
            }
            None => false,
        };
        if matched == (look == Lookaround::Positive) {
            let attempt = Attempt {
                mark,
                end: cursor.position(),
                rep: 1,
                sub: SubMatch::Look,
            };
            Ok(Some(Frame {
                attempts: vec![attempt],
            }))
        } else {
            cursor.revert_to(mark, RevertMode::RemoveMark)?;
            Ok(None)
        }
    }

    /// Adds repetitions until `target` is reached, a repetition comes out
    /// empty, or no further repetition matches.  Falls back on
    /// [`backtrack`](Self::backtrack) while fewer than `min` repetitions
    /// hold.  Returns `false` with an empty frame when `min` is out of
    /// reach.
    fn fill<R: BufRead>(
        &self,
        frame: &mut Frame,
        cursor: &mut Cursor<R>,
        dir: Direction,
        target: usize,
    ) -> Result<bool, Error> {
        loop {
            if frame.attempts.len() >= target || frame.saturated() {
                return Ok(true);
            }
            let rep = frame.attempts.len() + 1;
            if let Some(attempt) = self.match_single(cursor, dir, rep)? {
                frame.attempts.push(attempt);
                continue;
            }
            if frame.attempts.len() >= self.min {
                return Ok(true);
            }
            if !self.backtrack(frame, cursor, dir)? {
                return Ok(false);
            }
        }
    }

    /// Changes the last repetition that can still change, dropping the
    /// exhausted ones after it.
    fn backtrack<R: BufRead>(
        &self,
        frame: &mut Frame,
        cursor: &mut Cursor<R>,
        dir: Direction,
    ) -> Result<bool, Error> {
        while let Some(last) = frame.attempts.last_mut() {
            if self.change_single(last, cursor, dir)? {
                return Ok(true);
            }
            if let Some(attempt) = frame.attempts.pop() {
                attempt.release(cursor)?;
            }
        }
        Ok(false)
    }

    /// Moves a matched node to its next answer.  Returns `false` once the
    /// node is exhausted, in which case the frame is emptied and the cursor
    /// is back where the node started.
    fn change_node<R: BufRead>(
        &self,
        frame: &mut Frame,
        cursor: &mut Cursor<R>,
        parent: Direction,
    ) -> Result<bool, Error> {
        let dir = self.direction(parent);
        let changed = match (self.look, self.policy) {
            (Some(_), _) | (None, Policy::Possessive) => false,
            (None, Policy::Greedy) => self.change_greedy(frame, cursor, dir)?,
            (None, Policy::Reluctant) => self.change_reluctant(frame, cursor, dir)?,
        };
        if !changed {
            std::mem::take(frame).release(cursor)?;
        }
        log::trace!(
            "{} changed={} reps={} at {}",
            self.label(),
            changed,
            frame.attempts.len(),
            cursor.position()
        );
        Ok(changed)
    }

    fn change_greedy<R: BufRead>(
        &self,
        frame: &mut Frame,
        cursor: &mut Cursor<R>,
        dir: Direction,
    ) -> Result<bool, Error> {
        while let Some(last) = frame.attempts.last_mut() {
            if self.change_single(last, cursor, dir)? {
                return self.fill(frame, cursor, dir, self.max_reps());
            }
            if let Some(attempt) = frame.attempts.pop() {
                attempt.release(cursor)?;
            }
            if frame.attempts.len() >= self.min {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn change_reluctant<R: BufRead>(
        &self,
        frame: &mut Frame,
        cursor: &mut Cursor<R>,
        dir: Direction,
    ) -> Result<bool, Error> {
        if !frame.saturated() && frame.attempts.len() < self.max_reps() {
            let rep = frame.attempts.len() + 1;
            if let Some(attempt) = self.match_single(cursor, dir, rep)? {
                frame.attempts.push(attempt);
                return Ok(true);
            }
        }
        if self.backtrack(frame, cursor, dir)? {
            return self.fill(frame, cursor, dir, self.min);
        }
        Ok(false)
    }

    /// Matches one repetition of the node.
    fn match_single<R: BufRead>(
        &self,
        cursor: &mut Cursor<R>,
        dir: Direction,
        rep: usize,
    ) -> Result<Option<Attempt>, Error> {
        let mark = cursor.set_mark();
        let sub = match &self.kind {
            NodeKind::Literal(text) => {
                consume_literal(text, cursor, dir)?.then_some(SubMatch::Leaf(text.len()))
            }
            NodeKind::Class { set, negated } => {
                consume_class(set, *negated, cursor, dir)?.then_some(SubMatch::Leaf(1))
            }
            NodeKind::Assertion(assertion) => assertion.holds(cursor)?.then_some(SubMatch::Leaf(0)),
            NodeKind::Sequence(children) => {
                let mut frames = Vec::with_capacity(children.len());
                run_sequence(children, &mut frames, cursor, dir)?
                    .then_some(SubMatch::Sequence(frames))
            }
            NodeKind::Alternation(branches) => match_branch(branches, cursor, dir)?,
        };
        match sub {
            Some(sub) => {
                log::trace!(
                    "{} rep {} matched {}..{}",
                    self.label(),
                    rep,
                    mark.position,
                    cursor.position()
                );
                Ok(Some(Attempt {
                    mark,
                    end: cursor.position(),
                    rep,
                    sub,
                }))
            }
            None => {
                cursor.revert_to(mark, RevertMode::RemoveMark)?;
                Ok(None)
            }
        }
    }

    /// Finds another answer inside one repetition.  Only sequences and
    /// alternations have one.
    fn change_single<R: BufRead>(
        &self,
        attempt: &mut Attempt,
        cursor: &mut Cursor<R>,
        dir: Direction,
    ) -> Result<bool, Error> {
        let changed = match (&self.kind, &mut attempt.sub) {
            (NodeKind::Sequence(children), SubMatch::Sequence(frames)) => {
                backtrack_sequence(children, frames, cursor, dir)?
                    && run_sequence(children, frames, cursor, dir)?
            }
            (NodeKind::Alternation(branches), SubMatch::Alternation { branch, frame }) => {
                branches[*branch].change_node(frame, cursor, dir)?
            }
            _ => false,
        };
        if changed {
            attempt.end = cursor.position();
            log::trace!("{} rep {} now ends at {}", self.label(), attempt.rep, attempt.end);
        }
        Ok(changed)
    }
}

fn consume_literal<R: BufRead>(
    text: &[char],
    cursor: &mut Cursor<R>,
    dir: Direction,
) -> Result<bool, Error> {
    let step = ScanOptions::new().towards(dir);
    for idx in 0..text.len() {
        let expected = text[ordered_index(dir, idx, text.len())];
        if cursor.peek(dir) != expected || !cursor.advance(step)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn consume_class<R: BufRead>(
    set: &CharSet,
    negated: bool,
    cursor: &mut Cursor<R>,
    dir: Direction,
) -> Result<bool, Error> {
    let c = cursor.peek(dir);
    let hit = if c == LINE_BREAK {
        !negated && set.contains(LINE_BREAK)
    } else {
        set.contains(c) != negated
    };
    Ok(hit && cursor.advance(ScanOptions::new().towards(dir))?)
}

/// Extends `frames` until every child has matched, backtracking into
/// earlier children on failure.  Returns `false` with `frames` emptied
/// when the sequence cannot match.
fn run_sequence<R: BufRead>(
    children: &[Node],
    frames: &mut Vec<Frame>,
    cursor: &mut Cursor<R>,
    dir: Direction,
) -> Result<bool, Error> {
    while frames.len() < children.len() {
        let child = &children[ordered_index(dir, frames.len(), children.len())];
        match child.match_node(cursor, dir)? {
            Some(frame) => frames.push(frame),
            None => {
                if !backtrack_sequence(children, frames, cursor, dir)? {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Changes the most recent child that still has an answer.
fn backtrack_sequence<R: BufRead>(
    children: &[Node],
    frames: &mut Vec<Frame>,
    cursor: &mut Cursor<R>,
    dir: Direction,
) -> Result<bool, Error> {
    while let Some(step) = frames.len().checked_sub(1) {
        let child = &children[ordered_index(dir, step, children.len())];
        if child.change_node(&mut frames[step], cursor, dir)? {
            return Ok(true);
        }
        frames.pop();
    }
    Ok(false)
}

fn match_branch<R: BufRead>(
    branches: &[Node],
    cursor: &mut Cursor<R>,
    dir: Direction,
) -> Result<Option<SubMatch>, Error> {
    for (branch, node) in branches.iter().enumerate() {
        if let Some(frame) = node.match_node(cursor, dir)? {
            return Ok(Some(SubMatch::Alternation { branch, frame }));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// A matching session of a [`Regex`] on a cursor.
///
/// While a match is live its marks pin the lines it covers.  End the
/// session with [`commit`](Self::commit) to keep the cursor after the
/// match, or [`release`](Self::release) to return to the start.  Dropping
/// a matcher releases a live match.
pub struct Matcher<'r, 'c, R> {
    regex: &'r Regex,
    cursor: &'c mut Cursor<R>,
    start: Position,
    frame: Option<Frame>,
}

impl<R> fmt::Debug for Matcher<'_, '_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("start", &self.start)
            .field("len", &self.match_len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl<R: BufRead> Matcher<'_, '_, R> {
    /// Matches the tree at the cursor position.  Returns the number of
    /// characters consumed (line breaks included), or `None`.
    ///
    /// A live match from a previous call is released first, so calling
    /// this again restarts the session at the same position.
    pub fn try_match(&mut self) -> Result<Option<usize>, Error> {
        if let Some(frame) = self.frame.take() {
            frame.release(self.cursor)?;
        }
        self.start = self.cursor.position();
        let frame = self.regex.root.match_node(self.cursor, Direction::Forwards)?;
        let len = frame.as_ref().map(Frame::len);
        log::debug!("{}: match at {}: {:?}", self.cursor.name(), self.start, len);
        self.frame = frame;
        Ok(len)
    }

    /// Asks the tree for its next answer at the same start position.
    /// Returns `None` once every answer has been produced, with the cursor
    /// back at the start.
    pub fn change_match(&mut self) -> Result<Option<usize>, Error> {
        let Some(frame) = self.frame.as_mut() else {
            return Ok(None);
        };
        if self.regex.root.change_node(frame, self.cursor, Direction::Forwards)? {
            let len = frame.len();
            log::debug!("{}: alternative at {}: {}", self.cursor.name(), self.start, len);
            Ok(Some(len))
        } else {
            self.frame = None;
            log::debug!("{}: no more alternatives at {}", self.cursor.name(), self.start);
            Ok(None)
        }
    }
}

impl<R> Matcher<'_, '_, R> {
    pub fn is_matched(&self) -> bool {
        self.frame.is_some()
    }

    pub fn match_len(&self) -> Option<usize> {
        self.frame.as_ref().map(Frame::len)
    }

    /// Spans of the capture groups of the live match, indexed by group.
    /// Group 0 spans the whole match.  All `None` without a live match.
    pub fn captures(&self) -> Vec<Option<Span>> {
        let mut groups = vec![None; self.regex.groups];
        if let Some(frame) = &self.frame {
            groups[0] = Some(Span::new(self.start, self.cursor.position()));
            frame.collect_captures(&self.regex.root, Direction::Forwards, &mut groups);
        }
        groups
    }

    /// Accepts the live match: its marks are dropped and the cursor stays
    /// at the end of the match.
    pub fn commit(mut self) -> Result<Option<usize>, Error> {
        match self.frame.take() {
            Some(frame) => {
                let len = frame.len();
                frame.commit(self.cursor)?;
                Ok(Some(len))
            }
            None => Ok(None),
        }
    }

    /// Abandons the live match, returning the cursor to the start.
    pub fn release(mut self) -> Result<(), Error> {
        match self.frame.take() {
            Some(frame) => frame.release(self.cursor),
            None => Ok(()),
        }
    }
}

impl<R> Drop for Matcher<'_, '_, R> {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            log::warn!("matcher at {} dropped with a live match, releasing it", self.start);
            if let Err(err) = frame.release(self.cursor) {
                log::warn!("failed to release match at {}: {}", self.start, err);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Regex
// ---------------------------------------------------------------------------

/// A validated matcher tree.
#[derive(Clone, Debug)]
pub struct Regex {
    root: Node,
    /// Number of capture slots, group 0 included.
    groups: usize,
    names: IndexMap<String, usize>,
}

/// A match found by [`Regex::find`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Match {
    pub span: Span,
    /// Characters consumed, line breaks included.
    pub len: usize,
    /// Matched text, with `'\n'` between lines.
    pub text: String,
    pub groups: Vec<Option<Span>>,
}

impl Regex {
    pub fn new(root: Node) -> Result<Self, Error> {
        Self::with_names(root, IndexMap::new())
    }

    /// Parses `pattern` with `regex-syntax` and lowers it.
    ///
    /// Alternations keep the first branch that matches (see the crate
    /// docs), so the result can differ from a leftmost-first engine:
    /// `(?:ab|a)b` matches `"abb"` but never `"ab"`.  List the longer
    /// branch last, as in `(?:a|ab)b`, when later branches must stay
    /// reachable.
    pub fn parse(pattern: &str) -> Result<Self, Error> {
        let hir = regex_syntax::Parser::new().parse(pattern).map_err(Error::Syntax)?;
        RegexBuilder::new().build(&hir)
    }

    fn with_names(root: Node, names: IndexMap<String, usize>) -> Result<Self, Error> {
        let mut groups = 1;
        root.validate(&mut groups)?;
        Ok(Self { root, groups, names })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Number of capture slots, group 0 included.
    pub fn group_len(&self) -> usize {
        self.groups
    }

    pub fn group_index(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    /// Named groups in the order they appear in the pattern.
    pub fn group_names(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.names.iter().map(|(name, &idx)| (name.as_str(), idx))
    }

    pub fn matcher<'r, 'c, R>(&'r self, cursor: &'c mut Cursor<R>) -> Matcher<'r, 'c, R> {
        let start = cursor.position();
        Matcher {
            regex: self,
            cursor,
            start,
            frame: None,
        }
    }

    /// Matches at the cursor and, on success, leaves the cursor after the
    /// match.
    pub fn match_at<R: BufRead>(&self, cursor: &mut Cursor<R>) -> Result<Option<usize>, Error> {
        let mut matcher = self.matcher(cursor);
        matcher.try_match()?;
        matcher.commit()
    }

    /// Scans forward from the cursor for the first position where the tree
    /// matches.  On success the cursor is left after the match; otherwise
    /// it ends at the end of the input.
    ///
    /// An empty match leaves the cursor where it was, so calling `find`
    /// again returns the same match.  Advance the cursor one character
    /// before searching again.
    pub fn find<R: BufRead>(&self, cursor: &mut Cursor<R>) -> Result<Option<Match>, Error> {
        loop {
            let start = cursor.set_mark();
            let mut matcher = self.matcher(cursor);
            if let Some(len) = matcher.try_match()? {
                let groups = matcher.captures();
                matcher.commit()?;
                let span = Span::new(start.position, cursor.position());
                let extracted = cursor.extract(ExtractOptions {
                    keep_newlines: true,
                    ..ExtractOptions::default()
                })?;
                return Ok(Some(Match {
                    span,
                    len,
                    text: extracted.text,
                    groups,
                }));
            }
            matcher.release()?;
            cursor.release(start)?;
            if !cursor.advance(ScanOptions::new())? {
                return Ok(None);
            }
        }
    }

    /// Writes an indented rendering of the tree, one node per line.
    pub fn to_tree(&self, mut out: impl Write) -> io::Result<()> {
        self.root.write_tree(&mut out, 0)
    }
}

// ---------------------------------------------------------------------------
// RegexBuilder
// ---------------------------------------------------------------------------

/// Lowers `regex-syntax` HIR into a matcher tree.
///
/// Equal character classes are interned so that repeated classes share
/// one set.
#[derive(Debug, Default)]
pub struct RegexBuilder {
    classes: IndexSet<Arc<CharSet>>,
    names: IndexMap<String, usize>,
}

impl RegexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct character classes interned so far.
    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    pub fn build(&mut self, hir: &Hir) -> Result<Regex, Error> {
        let root = self.lower(hir)?;
        Regex::with_names(root, std::mem::take(&mut self.names))
    }

    fn intern_class(&mut self, set: CharSet) -> Arc<CharSet> {
        let (idx, _) = self.classes.insert_full(Arc::new(set));
        Arc::clone(&self.classes[idx])
    }

    fn lower(&mut self, hir: &Hir) -> Result<Node, Error> {
        match hir.kind() {
            HirKind::Empty => Ok(Node::sequence([])),
            HirKind::Literal(lit) => {
                let text = std::str::from_utf8(&lit.0)
                    .map_err(|_| Error::UnsupportedLiteral(lit.0.clone()))?;
                Ok(Node::literal(text))
            }
            HirKind::Class(hir::Class::Unicode(class)) => {
                let set = CharSet::new(class.ranges().iter().map(|r| (r.start(), r.end())));
                Ok(Node::class(self.intern_class(set)))
            }
            HirKind::Class(hir::Class::Bytes(class)) => {
                if class.ranges().iter().any(|r| r.end() > 0x7F) {
                    return Err(Error::UnsupportedClass(hir::Class::Bytes(class.clone())));
                }
                let set = CharSet::new(
                    class
                        .ranges()
                        .iter()
                        .map(|r| (char::from(r.start()), char::from(r.end()))),
                );
                Ok(Node::class(self.intern_class(set)))
            }
            HirKind::Look(look) => {
                let assertion = match look {
                    hir::Look::Start => Assertion::Start,
                    hir::Look::End => Assertion::End,
                    hir::Look::StartLF | hir::Look::StartCRLF => Assertion::LineStart,
                    hir::Look::EndLF | hir::Look::EndCRLF => Assertion::LineEnd,
                    hir::Look::WordAscii | hir::Look::WordUnicode => Assertion::WordBoundary,
                    hir::Look::WordAsciiNegate | hir::Look::WordUnicodeNegate => {
                        Assertion::NotWordBoundary
                    }
                    other => return Err(Error::UnsupportedLook(*other)),
                };
                Ok(Node::assertion(assertion))
            }
            HirKind::Capture(capture) => {
                let sub = self.lower(&capture.sub)?;
                let group = capture.index as usize;
                if let Some(name) = &capture.name {
                    self.names.insert(name.to_string(), group);
                }
                Ok(wrap(sub).capture(group))
            }
            HirKind::Concat(children) => {
                let children = children
                    .iter()
                    .map(|c| self.lower(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::sequence(children))
            }
            HirKind::Alternation(branches) => {
                let branches = branches
                    .iter()
                    .map(|b| self.lower(b))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Node::alternation(branches))
            }
            HirKind::Repetition(rep) => {
                let sub = self.lower(&rep.sub)?;
                let node = wrap(sub).repeat(rep.min as usize, rep.max.map(|max| max as usize));
                Ok(if rep.greedy { node } else { node.reluctant() })
            }
        }
    }
}

/// A node that already carries modifiers is wrapped in a one-child
/// sequence, so that new modifiers apply to it as a whole.
fn wrap(node: Node) -> Node {
    if node.is_plain() {
        node
    } else {
        Node::sequence([node])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    fn cursor(text: &str) -> Cursor<&[u8]> {
        Cursor::from_stream(text.as_bytes()).expect("in-memory cursor")
    }

    fn parse_hir(pattern: &str) -> Hir {
        use regex_syntax::ast::parse::ParserBuilder;
        use regex_syntax::hir::translate::TranslatorBuilder;

        let ast = ParserBuilder::new()
            .build()
            .parse(pattern)
            .expect("regex-syntax AST parse should succeed");
        TranslatorBuilder::new()
            .build()
            .translate(pattern, &ast)
            .expect("regex-syntax HIR translation should succeed")
    }

    fn build(pattern: &str) -> Regex {
        RegexBuilder::new()
            .build(&parse_hir(pattern))
            .expect("pattern should lower")
    }

    /// Writer that can be handed to a cursor and inspected afterwards.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    // -----------------------------------------------------------------------
    // Cursor movement
    // -----------------------------------------------------------------------

    #[test]
    fn test_advance_crosses_lines_through_sentinel() {
        let mut c = cursor("ab\ncd");
        let fwd = ScanOptions::new();
        assert_eq!(c.peek(Direction::Forwards), 'a');
        assert_eq!(c.peek(Direction::Backwards), LINE_BREAK);
        assert_eq!(c.advance_by(2, fwd).unwrap(), 2);
        assert_eq!(c.position(), Position::new(1, 2));
        assert_eq!(c.peek(Direction::Forwards), LINE_BREAK);
        assert!(c.at_line_end());

        assert!(c.advance(fwd).unwrap());
        assert_eq!(c.position(), Position::new(2, 0));
        assert_eq!(c.peek(Direction::Forwards), 'c');
        assert_eq!(c.peek(Direction::Backwards), LINE_BREAK);

        assert_eq!(c.advance_by(5, fwd).unwrap(), 2);
        assert!(c.is_at_end().unwrap());
        assert!(!c.advance(fwd).unwrap());
        assert_eq!(c.position(), Position::new(2, 2));
    }

    #[test]
    fn test_single_line_stops_at_edges() {
        let mut c = cursor("ab\ncd");
        let opts = ScanOptions::new().single_line();
        assert_eq!(c.advance_by(10, opts).unwrap(), 2);
        assert_eq!(c.position(), Position::new(1, 2));
        assert_eq!(c.advance_by(10, opts.backwards()).unwrap(), 2);
        assert!(c.is_at_start());
    }

    #[test]
    fn test_empty_input_is_one_empty_line() {
        let mut c = cursor("");
        assert_eq!(c.peek(Direction::Forwards), LINE_BREAK);
        assert!(!c.advance(ScanOptions::new()).unwrap());
        assert!(c.is_at_start());
        assert!(c.is_at_end().unwrap());
        assert_eq!(c.retained_lines(), 1..=1);
    }

    #[test]
    fn test_crlf_and_byte_order_mark_are_stripped() {
        let mut c = cursor("\u{feff}ab\r\ncd\r\n");
        assert_eq!(c.current_line(), "ab");
        assert!(c.advance_line(Direction::Forwards).unwrap());
        assert_eq!(c.current_line(), "cd");
        assert!(!c.advance_line(Direction::Forwards).unwrap());
        assert_eq!(c.line_number(), 2);
    }

    #[test]
    fn test_expect_advance_reports_end_of_input() {
        let mut c = cursor("a");
        c.expect_advance(Direction::Forwards).unwrap();
        let err = c.expect_advance(Direction::Forwards).unwrap_err();
        assert!(matches!(err, Error::EndOfInput { position } if position == Position::new(1, 1)));
    }

    #[test]
    fn test_continuation_lines_are_joined() {
        let options = CursorOptions {
            name: Some("joined".to_string()),
            continuation: Some('\\'),
        };
        let mut c = Cursor::with_options("a \\\nb\nc".as_bytes(), options).unwrap();
        assert_eq!(c.name(), "joined");
        assert_eq!(c.current_line(), "a \\b");
        assert!(c.advance_line(Direction::Forwards).unwrap());
        assert_eq!(c.current_line(), "c");
        assert_eq!(c.line_number(), 2);
    }

    #[test]
    fn test_invalid_utf8_fails_the_cursor_for_good() {
        let mut c = Cursor::from_stream(&b"ok\n\xff\xfe bad\nafter\n"[..]).unwrap();
        assert_eq!(c.current_line(), "ok");
        for _ in 0..2 {
            let err = c.advance_line(Direction::Forwards).unwrap_err();
            assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::InvalidData));
            assert_eq!(c.position(), Position::new(1, 0));
            assert_eq!(c.retained_lines(), 1..=1);
        }
        assert_eq!(c.advance_by(2, ScanOptions::new().single_line()).unwrap(), 2);
        assert!(matches!(c.is_at_end(), Err(Error::Io(_))));
        assert_eq!(c.current_line(), "ok");
    }

    // -----------------------------------------------------------------------
    // Marks and retention
    // -----------------------------------------------------------------------

    #[test]
    fn test_unmarked_lines_are_retired() {
        let mut c = cursor("one\ntwo\nthree\nfour");
        c.advance_line(Direction::Forwards).unwrap();
        c.advance_line(Direction::Forwards).unwrap();
        assert_eq!(c.retained_lines(), 3..=3);
        assert!(!c.advance(ScanOptions::new().backwards()).unwrap());
        assert_eq!(c.position(), Position::new(3, 0));
    }

    #[test]
    fn test_marks_pin_lines_until_released() {
        let mut c = cursor("one\ntwo\nthree\nfour");
        c.advance_by(2, ScanOptions::new()).unwrap();
        let mark = c.set_mark();
        c.advance_line(Direction::Forwards).unwrap();
        c.advance_line(Direction::Forwards).unwrap();
        assert_eq!(c.retained_lines(), 1..=3);

        // Backwards movement may revisit pinned lines.
        c.advance_by(4, ScanOptions::new().backwards()).unwrap();
        assert_eq!(c.position(), Position::new(2, 0));

        c.revert_to(mark, RevertMode::RemoveMark).unwrap();
        assert_eq!(c.position(), Position::new(1, 2));
        assert_eq!(c.mark_depth(), 0);
        assert_eq!(c.retained_lines(), 1..=3);

        // Lines read ahead survive the revert; moving on retires line 1.
        c.advance_line(Direction::Forwards).unwrap();
        assert_eq!(c.retained_lines(), 2..=3);
        assert_eq!(c.current_line(), "two");
    }

    #[test]
    fn test_revert_keep_mark_and_reset() {
        let mut c = cursor("abcdef");
        c.set_mark();
        c.advance_by(3, ScanOptions::new()).unwrap();
        c.revert_to_mark(RevertMode::KeepMark).unwrap();
        assert_eq!(c.column(), 0);
        assert_eq!(c.mark_depth(), 1);

        c.advance_by(4, ScanOptions::new()).unwrap();
        let mark = c.reset_mark().unwrap();
        assert_eq!(mark.position(), Position::new(1, 4));
        assert_eq!(mark.depth(), 0);
        c.advance_by(2, ScanOptions::new()).unwrap();
        c.revert_to(mark, RevertMode::RemoveMark).unwrap();
        assert_eq!(c.column(), 4);
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_out_of_order_release_is_rejected() {
        let mut c = cursor("abc");
        let outer = c.set_mark();
        c.advance(ScanOptions::new()).unwrap();
        let inner = c.set_mark();

        let err = c.release(outer).unwrap_err();
        assert!(matches!(err, Error::InvalidMarkOrder { mark: Some(0), open: 2 }));
        let err = c.revert_to(outer, RevertMode::KeepMark).unwrap_err();
        assert!(matches!(err, Error::InvalidMarkOrder { mark: Some(0), open: 2 }));

        c.release(inner).unwrap();
        c.release(outer).unwrap();
        assert!(matches!(
            c.unset_mark().unwrap_err(),
            Error::InvalidMarkOrder { mark: None, .. }
        ));
    }

    // -----------------------------------------------------------------------
    // Needles
    // -----------------------------------------------------------------------

    #[test]
    fn test_matches_consume_and_restore() {
        let mut c = cursor("ab\ncd");
        assert!(c.matches(Needle::Str("ab"), ScanOptions::new()).unwrap());
        assert_eq!(c.column(), 0);
        assert!(!c.matches(Needle::Str("abc"), ScanOptions::new().consume()).unwrap());
        assert_eq!(c.column(), 0);
        assert!(c.matches(Needle::Str("ab\nc"), ScanOptions::new().consume()).unwrap());
        assert_eq!(c.position(), Position::new(2, 1));
        assert!(c.matches(Needle::Str("c"), ScanOptions::new().backwards()).unwrap());
        assert!(c.matches(Needle::NoneOf("ab"), ScanOptions::new()).unwrap());
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_whitespace_needle_matches_line_end() {
        let mut c = cursor("ab\ncd");
        c.advance_by(2, ScanOptions::new()).unwrap();
        assert!(c.matches(Needle::AnyOf(" \t\n"), ScanOptions::new()).unwrap());
        assert_eq!(c.position(), Position::new(1, 2));
        assert!(c.matches(Needle::AnyOf(" \t\n"), ScanOptions::new().consume()).unwrap());
        assert_eq!(c.position(), Position::new(2, 0));
    }

    #[test]
    fn test_seek_positions() {
        let mut c = cursor("foo bar\nbaz qux");
        assert!(c.seek(Needle::Str("bar"), ScanOptions::new()).unwrap());
        assert_eq!(c.position(), Position::new(1, 4));
        assert!(c.seek(Needle::Str("baz"), ScanOptions::new().consume()).unwrap());
        assert_eq!(c.position(), Position::new(2, 3));
        assert!(c.seek(Needle::WordBoundary, ScanOptions::new().lookahead()).unwrap());
        assert_eq!(c.position(), Position::new(2, 3));
        assert!(c.seek(Needle::Char('q'), ScanOptions::new().lookahead()).unwrap());
        assert_eq!(c.position(), Position::new(2, 3));
        assert!(c.seek(Needle::Char('b'), ScanOptions::new().backwards()).unwrap());
        assert_eq!(c.position(), Position::new(2, 1));
        // Line 1 was retired when the scan moved past it.
        assert!(!c.seek(Needle::Char('o'), ScanOptions::new().backwards()).unwrap());
        assert_eq!(c.position(), Position::new(2, 0));
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_expect_reports_unterminated_needle() {
        let mut c = cursor("/* never closed\nstill going");
        c.advance_by(2, ScanOptions::new()).unwrap();
        let err = c.expect(Needle::Str("*/"), ScanOptions::new()).unwrap_err();
        match err {
            Error::UnterminatedMatch { expected, position } => {
                assert_eq!(expected, "\"*/\"");
                assert_eq!(position, Position::new(2, 11));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_word_boundaries() {
        let mut c = cursor(" cat_1 ");
        assert!(!c.at_word_boundary());
        c.advance(ScanOptions::new()).unwrap();
        assert!(c.at_word_boundary());
        c.advance_by(3, ScanOptions::new()).unwrap();
        assert!(!c.at_word_boundary());
        c.advance_by(2, ScanOptions::new()).unwrap();
        assert!(c.at_word_boundary());
        assert!(is_word_char('é'));
        assert!(!is_word_char(LINE_BREAK));
    }

    // -----------------------------------------------------------------------
    // Extraction
    // -----------------------------------------------------------------------

    #[test]
    fn test_extract_across_lines() {
        let mut c = cursor("foo bar\nbaz");
        c.advance_by(4, ScanOptions::new()).unwrap();
        c.set_mark();
        c.advance_by(6, ScanOptions::new()).unwrap();
        assert_eq!(c.position(), Position::new(2, 2));

        let kept = c
            .extract(ExtractOptions {
                keep_mark: true,
                keep_newlines: true,
                probe: Some(Probe::AnyOf("z")),
            })
            .unwrap();
        assert_eq!(kept.text, "bar\nba");
        assert!(!kept.probe_hit);
        assert_eq!(c.mark_depth(), 1);

        let joined = c
            .extract(ExtractOptions {
                probe: Some(Probe::NoneOf(" \t")),
                ..ExtractOptions::default()
            })
            .unwrap();
        assert_eq!(joined.text, "barba");
        assert!(joined.probe_hit);
        assert_eq!(c.mark_depth(), 0);
        assert!(c.extract(ExtractOptions::default()).is_err());
    }

    #[test]
    fn test_extract_backwards_keeps_source_order() {
        let mut c = cursor("hello world");
        c.advance_by(11, ScanOptions::new()).unwrap();
        c.set_mark();
        c.advance_by(5, ScanOptions::new().backwards()).unwrap();
        let blank = c
            .extract(ExtractOptions {
                keep_mark: true,
                probe: Some(Probe::NoneOf(" \t")),
                ..ExtractOptions::default()
            })
            .unwrap();
        assert_eq!(blank.text, "world");
        assert!(blank.probe_hit);
    }

    #[test]
    fn test_slice_outside_window() {
        let mut c = cursor("one\ntwo");
        c.advance_line(Direction::Forwards).unwrap();
        let span = Span::new(Position::new(1, 0), Position::new(2, 1));
        assert!(matches!(
            c.slice(span, true),
            Err(Error::NotRetained { position }) if position == Position::new(1, 0)
        ));
        let reversed = Span::new(Position::new(2, 3), Position::new(2, 1));
        assert_eq!(c.slice(reversed, true).unwrap(), "wo");
    }

    // -----------------------------------------------------------------------
    // Files, echo and diagnostics
    // -----------------------------------------------------------------------

    #[test]
    fn test_file_location_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "first\nsecond line\n").unwrap();
        file.flush().unwrap();

        let mut c = Cursor::from_file(file.path()).unwrap();
        assert_eq!(c.path(), Some(file.path()));
        assert_eq!(c.name(), file.path().display().to_string());
        c.advance_line(Direction::Forwards).unwrap();
        c.advance_by(3, ScanOptions::new()).unwrap();
        let location = c.location().unwrap();
        assert_eq!(location.position, Position::new(2, 3));

        let reopened = Cursor::reopen(&location).unwrap();
        assert_eq!(reopened.position(), Position::new(2, 3));
        assert_eq!(reopened.peek(Direction::Forwards), 'o');

        let far = SourceLocation {
            path: location.path.clone(),
            position: Position::new(9, 0),
        };
        assert!(matches!(Cursor::reopen(&far), Err(Error::EndOfInput { .. })));
    }

    #[test]
    fn test_stream_and_missing_file_errors() {
        let c = cursor("x");
        assert!(matches!(
            c.location(),
            Err(Error::NotFileBacked { name }) if name == "<input stream>"
        ));

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        let err = Cursor::from_file(&missing).unwrap_err();
        assert!(matches!(err, Error::Open { ref path, .. } if *path == missing));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_echo_copies_lines_as_read() {
        let buf = SharedBuf::default();
        let mut c = cursor("a\nb\nc");
        c.enable_echo(buf.clone(), "> ", true).unwrap();
        c.advance_line(Direction::Forwards).unwrap();
        c.advance_line(Direction::Forwards).unwrap();
        c.disable_echo();
        assert_eq!(buf.contents(), "> a\n> b\n> c\n");
    }

    #[test]
    fn test_diagnostic_points_at_column() {
        let mut c = cursor("let x = ;");
        c.advance_by(8, ScanOptions::new()).unwrap();
        let rendered = c.diagnostic("missing value").to_string();
        assert_eq!(
            rendered,
            concat!(
                "error in \"<input stream>\", line 1, column 8: missing value\n",
                "\tlet x = ;\n",
                "\t________^\n",
            )
        );
    }

    #[test]
    fn test_diagnostic_windows_long_lines() {
        let line = "x".repeat(100);
        let mut c = cursor(&line);
        c.advance_by(50, ScanOptions::new()).unwrap();
        let rendered = c.diagnostic("here").to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[1], format!("\t...{}...", "x".repeat(58)));
        assert_eq!(lines[2], format!("\t{}^", "_".repeat(32)));

        c.advance_by(48, ScanOptions::new()).unwrap();
        let rendered = c.diagnostic("near the end").to_string();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[1], format!("\t...{}", "x".repeat(61)));
        assert_eq!(lines[2], format!("\t{}^", "_".repeat(62)));
    }

    // -----------------------------------------------------------------------
    // Character sets
    // -----------------------------------------------------------------------

    #[test]
    fn test_char_set_merges_ranges() {
        let set = CharSet::new([('d', 'f'), ('a', 'c'), ('z', 'x'), ('e', 'g')]);
        assert_eq!(set.ranges(), &[('a', 'g'), ('x', 'z')]);
        assert!(set.contains('a'));
        assert!(set.contains('g'));
        assert!(!set.contains('h'));
        assert!(set.contains('y'));
        assert_eq!(set.to_string(), "[a-gx-z]");
        assert!(CharSet::default().is_empty());
        assert_eq!(CharSet::from_chars("cab"), CharSet::new([('a', 'c')]));
    }

    // -----------------------------------------------------------------------
    // Matching
    // -----------------------------------------------------------------------

    fn alternatives<R: BufRead>(matcher: &mut Matcher<'_, '_, R>) -> Vec<usize> {
        let mut lens: Vec<usize> = matcher.try_match().unwrap().into_iter().collect();
        while let Some(len) = matcher.change_match().unwrap() {
            lens.push(len);
        }
        lens
    }

    #[test]
    fn test_greedy_and_reluctant_are_dual() {
        let greedy = Regex::new(Node::literal("a").repeat(0, Some(3))).unwrap();
        let mut c = cursor("aaaa");
        assert_eq!(alternatives(&mut greedy.matcher(&mut c)), [3, 2, 1, 0]);
        assert_eq!(c.position(), Position::new(1, 0));
        assert_eq!(c.mark_depth(), 0);

        let reluctant = Regex::new(Node::literal("a").repeat(0, Some(3)).reluctant()).unwrap();
        assert_eq!(alternatives(&mut reluctant.matcher(&mut c)), [0, 1, 2, 3]);
        assert_eq!(c.position(), Position::new(1, 0));
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_possessive_never_gives_back() {
        let possessive = Regex::new(Node::sequence([
            Node::literal("a").zero_or_more().possessive(),
            Node::literal("a"),
        ]))
        .unwrap();
        let mut c = cursor("aaa");
        assert_eq!(possessive.match_at(&mut c).unwrap(), None);
        assert_eq!(c.column(), 0);

        let greedy = Regex::new(Node::sequence([
            Node::literal("a").zero_or_more(),
            Node::literal("a"),
        ]))
        .unwrap();
        assert_eq!(greedy.match_at(&mut c).unwrap(), Some(3));

        let alone = Regex::new(Node::any_of("ab").one_or_more().possessive()).unwrap();
        let mut c = cursor("abba");
        assert_eq!(alternatives(&mut alone.matcher(&mut c)), [4]);
    }

    #[test]
    fn test_alternation_keeps_its_first_branch() {
        let regex =
            Regex::new(Node::alternation([Node::literal("ab"), Node::literal("a")])).unwrap();
        let mut c = cursor("ab");
        let mut matcher = regex.matcher(&mut c);
        assert_eq!(matcher.try_match().unwrap(), Some(2));
        assert_eq!(matcher.change_match().unwrap(), None);
        assert!(!matcher.is_matched());
        drop(matcher);
        assert_eq!(c.column(), 0);
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_alternation_commitment_holds_inside_sequences() {
        let long_first = build("(?:ab|a)b");
        let mut c = cursor("ab");
        assert_eq!(long_first.find(&mut c).unwrap(), None);
        let mut c = cursor("aabb");
        let found = long_first.find(&mut c).unwrap().unwrap();
        assert_eq!(found.span.start, Position::new(1, 1));
        assert_eq!(found.text, "abb");

        let short_first = build("(?:a|ab)b");
        let mut c = cursor("ab");
        let found = short_first.find(&mut c).unwrap().unwrap();
        assert_eq!(found.text, "ab");
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_alternation_branches_in_order_per_repetition() {
        let regex = Regex::new(Node::sequence([
            Node::alternation([Node::literal("ab"), Node::literal("a")]).zero_or_more(),
            Node::literal("c"),
        ]))
        .unwrap();
        let mut c = cursor("abaabc");
        assert_eq!(regex.match_at(&mut c).unwrap(), Some(6));

        let later = Regex::new(Node::sequence([
            Node::alternation([Node::literal("x"), Node::literal("b")]),
            Node::literal("c"),
        ]))
        .unwrap();
        let mut c = cursor("bc");
        assert_eq!(later.match_at(&mut c).unwrap(), Some(2));
    }

    #[test]
    fn test_sequence_backtracks_into_earlier_children() {
        let regex = build("[a-z]*ing");
        let mut c = cursor("testing");
        assert_eq!(regex.match_at(&mut c).unwrap(), Some(7));
        assert!(c.is_at_end().unwrap());
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_lookahead_consumes_nothing() {
        let regex = Regex::new(Node::sequence([
            Node::literal("a"),
            Node::literal("b").lookahead(),
        ]))
        .unwrap();
        let mut c = cursor("ab");
        assert_eq!(regex.match_at(&mut c).unwrap(), Some(1));
        assert_eq!(c.column(), 1);

        let negative = Regex::new(Node::sequence([
            Node::literal("a"),
            Node::literal("b").negative_lookahead(),
        ]))
        .unwrap();
        let mut c = cursor("ab");
        assert_eq!(negative.match_at(&mut c).unwrap(), None);
        let mut c = cursor("ac");
        assert_eq!(negative.match_at(&mut c).unwrap(), Some(1));
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_lookbehind() {
        let regex = Regex::new(Node::sequence([
            Node::literal("a").backwards().lookahead(),
            Node::literal("b"),
        ]))
        .unwrap();
        let mut c = cursor("bab");
        let found = regex.find(&mut c).unwrap().unwrap();
        assert_eq!(found.span.start, Position::new(1, 2));
        assert_eq!(found.text, "b");

        let not_after_digit = Regex::new(Node::sequence([
            Node::class(CharSet::new([('0', '9')])).backwards().negative_lookahead(),
            Node::literal("x"),
        ]))
        .unwrap();
        let mut c = cursor("1x x");
        let found = not_after_digit.find(&mut c).unwrap().unwrap();
        assert_eq!(found.span.start, Position::new(1, 3));
    }

    #[test]
    fn test_backwards_matching() {
        let mut c = cursor("xabc");
        c.advance_by(4, ScanOptions::new()).unwrap();
        let tail = Regex::new(Node::literal("bc").backwards()).unwrap();
        assert_eq!(tail.match_at(&mut c).unwrap(), Some(2));
        assert_eq!(c.column(), 2);

        let seq = Node::sequence([Node::literal("x"), Node::literal("a")]).backwards();
        let seq = Regex::new(seq).unwrap();
        assert_eq!(seq.match_at(&mut c).unwrap(), Some(2));
        assert!(c.is_at_start());
    }

    #[test]
    fn test_word_boundary_assertion() {
        let regex = Regex::new(Node::assertion(Assertion::WordBoundary)).unwrap();
        let mut c = cursor("cat");
        assert_eq!(regex.match_at(&mut c).unwrap(), Some(0));

        let mut c = cursor(" cat");
        assert_eq!(regex.match_at(&mut c).unwrap(), None);
        c.advance(ScanOptions::new()).unwrap();
        assert_eq!(regex.match_at(&mut c).unwrap(), Some(0));
        assert_eq!(c.column(), 1);
    }

    #[test]
    fn test_line_assertions() {
        let start = Regex::new(Node::assertion(Assertion::LineStart)).unwrap();
        let end = Regex::new(Node::assertion(Assertion::LineEnd)).unwrap();
        let edge = Regex::new(Node::assertion(Assertion::LineBoundary)).unwrap();
        let mut c = cursor("ab\ncd");
        assert_eq!(start.match_at(&mut c).unwrap(), Some(0));
        assert_eq!(end.match_at(&mut c).unwrap(), None);
        c.advance(ScanOptions::new()).unwrap();
        assert_eq!(edge.match_at(&mut c).unwrap(), None);
        c.advance(ScanOptions::new()).unwrap();
        assert_eq!(end.match_at(&mut c).unwrap(), Some(0));
        assert_eq!(edge.match_at(&mut c).unwrap(), Some(0));
    }

    #[test]
    fn test_zero_length_repetition_terminates() {
        let regex = Regex::new(Node::assertion(Assertion::WordBoundary).zero_or_more()).unwrap();
        let mut c = cursor("cat");
        let mut matcher = regex.matcher(&mut c);
        assert_eq!(matcher.try_match().unwrap(), Some(0));
        assert_eq!(matcher.frame.as_ref().unwrap().attempts.len(), 1);
        assert_eq!(matcher.change_match().unwrap(), Some(0));
        assert_eq!(matcher.change_match().unwrap(), None);

        // An empty repetition also stands in for the remaining minimum.
        let clamped = Regex::new(Node::sequence([]).repeat(3, None)).unwrap();
        let mut c = cursor("x");
        assert_eq!(clamped.match_at(&mut c).unwrap(), Some(0));

        let nested = build("(?:a*)*b");
        let mut c = cursor("aab");
        assert_eq!(nested.match_at(&mut c).unwrap(), Some(3));
    }

    #[test]
    fn test_literal_spans_lines_only_with_newline() {
        let mut c = cursor("foo\nbar");
        let plain = Regex::new(Node::literal("foobar")).unwrap();
        assert_eq!(plain.match_at(&mut c).unwrap(), None);
        let across = Regex::new(Node::literal("foo\nbar")).unwrap();
        assert_eq!(across.match_at(&mut c).unwrap(), Some(7));
        assert_eq!(c.position(), Position::new(2, 3));
    }

    #[test]
    fn test_classes_and_line_breaks() {
        let dot = build("o.b");
        let mut c = cursor("foo\nbar");
        assert_eq!(dot.find(&mut c).unwrap(), None);

        let dot_all = build("(?s)o.b");
        let mut c = cursor("foo\nbar");
        let found = dot_all.find(&mut c).unwrap().unwrap();
        assert_eq!(found.text, "o\nb");
        assert_eq!(found.len, 3);
        assert_eq!(found.span, Span::new(Position::new(1, 2), Position::new(2, 1)));

        let not_x = Regex::new(Node::sequence([Node::literal("o"), Node::none_of("x")])).unwrap();
        let mut c = cursor("o\nz");
        assert_eq!(not_x.match_at(&mut c).unwrap(), None);
    }

    #[test]
    fn test_failed_match_restores_cursor() {
        let regex = build("a+b");
        let mut c = cursor("aaac");
        c.advance(ScanOptions::new()).unwrap();
        assert_eq!(regex.match_at(&mut c).unwrap(), None);
        assert_eq!(c.column(), 1);
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_dropped_matcher_releases_its_marks() {
        let regex = build("a*");
        let mut c = cursor("aaa");
        {
            let mut matcher = regex.matcher(&mut c);
            assert_eq!(matcher.try_match().unwrap(), Some(3));
            assert_eq!(matcher.match_len(), Some(3));
        }
        assert_eq!(c.column(), 0);
        assert_eq!(c.mark_depth(), 0);

        let mut matcher = regex.matcher(&mut c);
        matcher.try_match().unwrap();
        matcher.release().unwrap();
        assert_eq!(c.column(), 0);
    }

    #[test]
    fn test_attempt_release_unwinds_nested_frames() {
        let mut c = cursor("abc\ndef");
        let fwd = ScanOptions::new();

        let outer = c.set_mark();
        let head = c.set_mark();
        c.advance_by(2, fwd).unwrap();
        let head = Frame {
            attempts: vec![Attempt {
                mark: head,
                end: c.position(),
                rep: 1,
                sub: SubMatch::Leaf(2),
            }],
        };
        let branch = c.set_mark();
        let inner = c.set_mark();
        c.advance_by(3, fwd).unwrap();
        let end = c.position();
        let inner = Frame {
            attempts: vec![Attempt {
                mark: inner,
                end,
                rep: 1,
                sub: SubMatch::Leaf(3),
            }],
        };
        let tail = Frame {
            attempts: vec![Attempt {
                mark: branch,
                end,
                rep: 1,
                sub: SubMatch::Alternation {
                    branch: 1,
                    frame: inner,
                },
            }],
        };
        let frame = Frame {
            attempts: vec![Attempt {
                mark: outer,
                end,
                rep: 1,
                sub: SubMatch::Sequence(vec![head, tail]),
            }],
        };

        assert_eq!(end, Position::new(2, 1));
        assert_eq!(frame.len(), 5);
        assert_eq!(c.mark_depth(), 4);
        assert_eq!(c.retained_lines(), 1..=2);

        frame.release(&mut c).unwrap();
        assert_eq!(c.position(), Position::new(1, 0));
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_attempt_release_out_of_order_is_rejected() {
        let mut c = cursor("ab");
        let first = c.set_mark();
        c.advance(ScanOptions::new()).unwrap();
        let _second = c.set_mark();
        let attempt = Attempt {
            mark: first,
            end: c.position(),
            rep: 1,
            sub: SubMatch::Leaf(1),
        };
        let err = attempt.release(&mut c).unwrap_err();
        assert!(matches!(err, Error::InvalidMarkOrder { mark: Some(0), open: 2 }));
        assert_eq!(c.column(), 1);
    }

    #[test]
    fn test_repetition_bounds_are_validated() {
        let err = Regex::new(Node::literal("a").repeat(3, Some(2))).unwrap_err();
        assert!(matches!(err, Error::RepetitionBoundsViolated { min: 3, max: 2 }));

        let nested = Node::sequence([Node::literal("x"), Node::any_of("ab").repeat(1, Some(0))]);
        assert!(matches!(
            Regex::new(nested),
            Err(Error::RepetitionBoundsViolated { min: 1, max: 0 })
        ));
    }

    #[test]
    fn test_captures() {
        let regex = build(r"(?P<user>\w+)@(?P<host>\w+)(x)?");
        assert_eq!(regex.group_len(), 4);
        assert_eq!(regex.group_index("host"), Some(2));
        assert_eq!(regex.group_index("nope"), None);
        assert_eq!(
            regex.group_names().collect::<Vec<_>>(),
            [("user", 1), ("host", 2)]
        );

        let mut c = cursor("  joe@host!");
        let found = regex.find(&mut c).unwrap().unwrap();
        let at = |col| Position::new(1, col);
        assert_eq!(found.groups[0], Some(Span::new(at(2), at(10))));
        assert_eq!(found.groups[1], Some(Span::new(at(2), at(5))));
        assert_eq!(found.groups[2], Some(Span::new(at(6), at(10))));
        assert_eq!(found.groups[3], None);
        assert_eq!(found.text, "joe@host");
    }

    #[test]
    fn test_find_releases_lines_while_scanning() {
        let mut text = String::new();
        for i in 0..500 {
            text.push_str(&format!("filler line {i}\n"));
        }
        text.push_str("the needle is here\n");
        let regex = build("needle");
        let mut c = cursor(&text);
        let found = regex.find(&mut c).unwrap().unwrap();
        assert_eq!(found.span.start, Position::new(501, 4));
        assert_eq!(c.retained_lines(), 501..=501);
        assert_eq!(c.mark_depth(), 0);
        assert_eq!(regex.find(&mut c).unwrap(), None);
    }

    #[test]
    fn test_find_repeats_an_empty_match_until_advanced() {
        let regex = build("x*");
        let mut c = cursor("ab");
        let first = regex.find(&mut c).unwrap().unwrap();
        assert!(first.span.is_empty());
        assert_eq!(regex.find(&mut c).unwrap().as_ref(), Some(&first));
        assert_eq!(c.position(), Position::new(1, 0));

        assert!(c.advance(ScanOptions::new()).unwrap());
        let next = regex.find(&mut c).unwrap().unwrap();
        assert_eq!(next.span.start, Position::new(1, 1));
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_matcher_restart_and_commit() {
        let regex = build("a{1,3}?");
        let mut c = cursor("aaa");
        let mut matcher = regex.matcher(&mut c);
        assert_eq!(matcher.try_match().unwrap(), Some(1));
        assert_eq!(matcher.change_match().unwrap(), Some(2));
        assert_eq!(matcher.try_match().unwrap(), Some(1));
        assert_eq!(matcher.change_match().unwrap(), Some(2));
        assert_eq!(matcher.commit().unwrap(), Some(2));
        assert_eq!(c.column(), 2);
        assert_eq!(c.mark_depth(), 0);
    }

    // -----------------------------------------------------------------------
    // HIR lowering
    // -----------------------------------------------------------------------

    #[test]
    fn test_builder_interns_classes() {
        let mut builder = RegexBuilder::new();
        builder.build(&parse_hir(r"\d\d\d")).unwrap();
        assert_eq!(builder.class_count(), 1);
        builder.build(&parse_hir("[ab]x[cd]")).unwrap();
        assert_eq!(builder.class_count(), 3);
    }

    #[test]
    fn test_unsupported_hir() {
        let hir = regex_syntax::ParserBuilder::new()
            .utf8(false)
            .build()
            .parse(r"(?-u)[\x80-\xFF]")
            .unwrap();
        assert!(matches!(
            RegexBuilder::new().build(&hir),
            Err(Error::UnsupportedClass(_))
        ));

        assert!(matches!(
            RegexBuilder::new().build(&parse_hir(r"\b{start}a")),
            Err(Error::UnsupportedLook(_))
        ));
        assert!(matches!(Regex::parse("(unclosed"), Err(Error::Syntax(_))));
    }

    #[test]
    fn test_tree_rendering() {
        let regex = build("(a+?)b");
        let mut out = Vec::new();
        regex.to_tree(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "sequence\n  sequence group=1\n    literal \"a\" {1,}?\n  literal \"b\"\n"
        );
    }

    // -----------------------------------------------------------------------
    // Cross-check against the regex crate
    // -----------------------------------------------------------------------

    fn assert_find_matches_regex_crate(pattern: &str, regex: &Regex, input: &str) {
        let re = regex::Regex::new(pattern).expect("regex crate should parse pattern");
        let expected = re.find(input).map(|m| (m.start(), m.end()));

        let mut c = cursor(input);
        let actual = regex
            .find(&mut c)
            .expect("find should not fail")
            .map(|m| (m.span.start.column, m.span.end.column));
        assert_eq!(actual, expected, "pattern {:?} on input {:?}", pattern, input);
        assert_eq!(c.mark_depth(), 0);
    }

    #[test]
    fn test_find_agrees_with_regex_crate() {
        use itertools::Itertools;

        let patterns = [
            "a*b",
            "a*?b",
            "(?:ab)*a",
            "b{2,3}",
            "a+?b+",
            "[ab]*a[ab]",
            "(?:a*b)*a",
            "a(?:ba)*",
            "(?:a|b)*?bb",
            "^a*",
            "b$",
            r"\bab",
            r"a\B",
            "(?:aa){1,2}?b",
        ];
        for p in patterns {
            let re = build(p);
            assert_find_matches_regex_crate(p, &re, "");
            for len in 1..=5 {
                for v in std::iter::repeat_n(["a", "b"], len)
                    .map(|a| a.into_iter())
                    .multi_cartesian_product()
                {
                    let input = v.into_iter().collect::<String>();
                    assert_find_matches_regex_crate(p, &re, &input);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    fn sample_tree(idx: usize) -> Node {
        match idx {
            0 => Node::sequence([Node::literal("a").zero_or_more(), Node::literal("b")]),
            1 => Node::any_of("ab").repeat(1, Some(3)).reluctant(),
            2 => Node::alternation([Node::literal("ab"), Node::literal("b")]).zero_or_more(),
            3 => Node::sequence([Node::literal("b\na"), Node::any_of("ab\n").zero_or_more()]),
            4 => Node::sequence([
                Node::any_of("ab\n").zero_or_more(),
                Node::literal("ab").lookahead(),
                Node::literal("a"),
            ]),
            _ => Node::sequence([
                Node::literal("b"),
                Node::any_of("ab\n").repeat(0, Some(4)).reluctant(),
            ])
            .backwards(),
        }
    }

    /// Samples from this index on match backwards from the end of input.
    const BACKWARDS_SAMPLES: usize = 5;

    proptest! {
        #[test]
        fn prop_revert_restores_position(
            text in "[a-c \n]{0,40}",
            skip in 0usize..20,
            moves in prop::collection::vec(any::<bool>(), 0..60),
        ) {
            let mut c = cursor(&text);
            c.advance_by(skip, ScanOptions::new()).unwrap();
            let before = c.position();
            let mark = c.set_mark();
            for forwards in moves {
                let dir = if forwards { Direction::Forwards } else { Direction::Backwards };
                c.advance(ScanOptions::new().towards(dir)).unwrap();
            }
            c.revert_to(mark, RevertMode::RemoveMark).unwrap();
            prop_assert_eq!(c.position(), before);
            prop_assert_eq!(c.mark_depth(), 0);
        }

        #[test]
        fn prop_match_length_replays_exactly(
            text in "[ab]{0,12}(\n[ab]{0,6})?",
            idx in 0usize..6,
        ) {
            let regex = Regex::new(sample_tree(idx)).unwrap();
            let (dir, skip) = if idx >= BACKWARDS_SAMPLES {
                (Direction::Backwards, text.chars().count())
            } else {
                (Direction::Forwards, 0)
            };
            let mut c = cursor(&text);
            prop_assert_eq!(c.advance_by(skip, ScanOptions::new()).unwrap(), skip);
            let start = c.position();

            let mut matcher = regex.matcher(&mut c);
            let mut answers = Vec::new();
            let mut len = matcher.try_match().unwrap();
            while let Some(n) = len {
                let span = matcher.captures()[0].unwrap();
                let end = match dir {
                    Direction::Forwards => span.end,
                    Direction::Backwards => span.start,
                };
                answers.push((n, end));
                len = matcher.change_match().unwrap();
            }
            drop(matcher);
            prop_assert_eq!(c.position(), start);
            prop_assert_eq!(c.mark_depth(), 0);

            for (n, end) in answers {
                let mut replay = cursor(&text);
                replay.advance_by(skip, ScanOptions::new()).unwrap();
                let moved = replay.advance_by(n, ScanOptions::new().towards(dir)).unwrap();
                prop_assert_eq!(moved, n);
                prop_assert_eq!(replay.position(), end);
            }
        }
    }
}
