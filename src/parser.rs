// https://redis.io/docs/reference/protocol-spec

use std::str;
use strum_macros::Display;
use tracing::trace;

use crate::buffer::SharedBuffer;
use crate::command::Command;
use crate::error::Error;
use crate::reader::BufferReader;

static CRLF: &[u8; 2] = b"\r\n";
static SPLIT_SIGNS: &[u8; 2] = b" \n";

pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;
pub const DEFAULT_MAX_INLINE_LEN: usize = 64 * 1024;
pub const DEFAULT_MAX_MULTIBULK_LEN: usize = 1024 * 1024;

/// Request arguments at least this long keep sharing the input buffer. Shorter ones are copied
/// out, so a request fed a few bytes at a time cannot pin one input store per argument.
pub const BIG_ARG_LEN: usize = 32 * 1024;

/// Upper bounds guarding the proxy against peers that never finish a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_bulk_len: usize,
    pub max_inline_len: usize,
    pub max_multibulk_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_inline_len: DEFAULT_MAX_INLINE_LEN,
            max_multibulk_len: DEFAULT_MAX_MULTIBULK_LEN,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
enum Strategy {
    Inline,
    Multibulk,
}

/// Where a multibulk decode stopped, so the next call resumes without re-reading anything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Progress {
    #[default]
    AwaitingCount,
    AwaitingLength,
    AwaitingBody(usize),
}

/// Resumable decoder for one RESP message at a time.
///
/// The parser owns the input buffer the I/O layer reads into. Each `parse_*` call consumes what it
/// can, drops the consumed prefix by narrowing the input window and returns [`Error::TryAgain`]
/// when the message is not complete yet. The partially decoded message stays in the caller's
/// output (command or reply buffer) and in the parser's counters, so the next call, made once more
/// bytes arrived, carries on where this one stopped. Call [`Parser::reset`] once a message has
/// been handed off.
#[derive(Debug, Default)]
pub struct Parser {
    strategy: Option<Strategy>,
    multibulk: Multibulk,
    // Bytes of the current inline line consumed so far.
    inline_len: usize,
    limits: Limits,
    input: SharedBuffer,
}

impl Parser {
    pub fn new() -> Parser {
        Parser::default()
    }

    pub fn with_limits(limits: Limits) -> Parser {
        Parser {
            limits,
            ..Parser::default()
        }
    }

    /// Unconsumed input.
    pub fn input(&self) -> &SharedBuffer {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut SharedBuffer {
        &mut self.input
    }

    /// Decodes a client request into `cmd`. A leading `*` selects the multibulk encoding,
    /// anything else the inline one.
    pub fn parse_request(&mut self, cmd: &mut Command) -> Result<(), Error> {
        if self.input.is_empty() {
            return Err(Error::TryAgain);
        }

        let mut reader = BufferReader::new(&self.input);
        let strategy = *self.strategy.get_or_insert(match reader.current() {
            b'*' => Strategy::Multibulk,
            _ => Strategy::Inline,
        });

        let result = match strategy {
            Strategy::Multibulk => self.multibulk.handle_request(cmd, &mut reader, &self.limits),
            Strategy::Inline => {
                inline_request(cmd, &mut reader, &self.limits, &mut self.inline_len)
            }
        };

        let consumed = reader.offset();
        self.compact(consumed);
        trace!(%strategy, consumed, ?result, "parsed request bytes");

        result
    }

    /// Frames one backend reply and appends its raw bytes to `out`.
    ///
    /// `*` and `$` select the multibulk encoding, `+`, `-` and `:` the inline one. Any other
    /// leading byte means the stream is out of sync and is reported as [`Error::Unknown`].
    pub fn parse_response(&mut self, out: &mut SharedBuffer) -> Result<(), Error> {
        if self.input.is_empty() {
            return Err(Error::TryAgain);
        }

        let mut reader = BufferReader::new(&self.input);
        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => {
                let strategy = match reader.current() {
                    b'*' | b'$' => Strategy::Multibulk,
                    b'+' | b'-' | b':' => Strategy::Inline,
                    other => return Err(Error::Unknown(other)),
                };
                *self.strategy.insert(strategy)
            }
        };

        let result = match strategy {
            Strategy::Multibulk => self.multibulk.handle_response(out, &mut reader, &self.limits),
            Strategy::Inline => inline_response(out, &mut reader),
        };

        let consumed = reader.offset();
        self.compact(consumed);
        trace!(%strategy, consumed, ?result, "parsed response bytes");

        result
    }

    /// Forgets the current message. The unconsumed input is kept.
    pub fn reset(&mut self) {
        self.strategy = None;
        self.inline_len = 0;
        self.multibulk.reset();
    }

    fn compact(&mut self, consumed: usize) {
        if consumed > 0 {
            self.input.narrow(consumed, 0);
        }
    }
}

/// Space or newline separated tokens, terminated by a newline. The whole line, tokens consumed
/// by earlier calls included, must fit in `max_inline_len`.
fn inline_request(
    cmd: &mut Command,
    reader: &mut BufferReader,
    limits: &Limits,
    line_len: &mut usize,
) -> Result<(), Error> {
    loop {
        let mut token = SharedBuffer::new();
        if let Err(err) = reader.read_until(&mut token, SPLIT_SIGNS, 0) {
            if err == Error::NotFound && *line_len + reader.remaining() > limits.max_inline_len {
                return Err(Error::Protocol("too big inline request"));
            }
            return Err(try_again(err));
        }

        *line_len += token.len() + 1;
        if *line_len > limits.max_inline_len {
            return Err(Error::Protocol("too big inline request"));
        }

        let end_of_line = reader.current() == b'\n';
        if end_of_line && reader.last() == b'\r' {
            token.narrow(0, -1);
        }

        // Runs of separators and blank lines produce no argument.
        if !token.is_empty() {
            cmd.push_arg(own_arg(token));
        }
        reader.next(1)?;

        if end_of_line {
            return Ok(());
        }
    }
}

/// A single line, terminator included.
fn inline_response(out: &mut SharedBuffer, reader: &mut BufferReader) -> Result<(), Error> {
    reader.read_until(out, b"\n", 1).map_err(try_again)
}

#[derive(Debug, Default)]
struct Multibulk {
    expected: usize,
    index: usize,
    progress: Progress,
}

impl Multibulk {
    fn reset(&mut self) {
        *self = Multibulk::default();
    }

    // *<number-of-arguments>\r\n$<length>\r\n<argument>\r\n...
    fn handle_request(
        &mut self,
        cmd: &mut Command,
        reader: &mut BufferReader,
        limits: &Limits,
    ) -> Result<(), Error> {
        if self.progress == Progress::AwaitingCount {
            let line = read_line(reader)?;
            self.expected = non_negative(parse_integer(&line)?);
            if self.expected > limits.max_multibulk_len {
                return Err(Error::Protocol("invalid multibulk length"));
            }
            self.progress = Progress::AwaitingLength;
        }

        while self.index < self.expected {
            if self.progress == Progress::AwaitingLength {
                let line = read_line(reader)?;
                let marker = line.get(0)?;
                if marker != b'$' {
                    return Err(Error::Unknown(marker));
                }

                let length = parse_integer(&line)?;
                if length < 0 {
                    cmd.push_arg(SharedBuffer::new());
                    self.index += 1;
                    continue;
                }

                self.progress = Progress::AwaitingBody(bulk_length(length, limits)?);
            }

            if let Progress::AwaitingBody(length) = self.progress {
                let mut arg = SharedBuffer::new();
                reader
                    .read(&mut arg, length + CRLF.len())
                    .map_err(try_again)?;
                expect_crlf(&arg)?;

                arg.narrow(0, -(CRLF.len() as isize));
                cmd.push_arg(own_arg(arg));

                self.index += 1;
                self.progress = Progress::AwaitingLength;
            }
        }

        Ok(())
    }

    // Frames one reply. A top-level `$` counts as a one element array. Array headers met on the
    // way add their element count, so nested arrays are framed whole.
    fn handle_response(
        &mut self,
        out: &mut SharedBuffer,
        reader: &mut BufferReader,
        limits: &Limits,
    ) -> Result<(), Error> {
        if self.progress == Progress::AwaitingCount {
            if reader.current() == b'*' {
                let line = read_line(reader)?;
                out.append(&line, line.len())?;
                self.expected = non_negative(parse_integer(&line)?);
            } else {
                self.expected = 1;
            }
            self.progress = Progress::AwaitingLength;
        }

        while self.index < self.expected {
            if self.progress == Progress::AwaitingLength {
                let line = read_line(reader)?;
                out.append(&line, line.len())?;

                match line.get(0)? {
                    b'$' => {
                        let length = parse_integer(&line)?;
                        if length < 0 {
                            self.index += 1;
                            continue;
                        }
                        self.progress = Progress::AwaitingBody(bulk_length(length, limits)?);
                    }
                    b'*' => {
                        let count = non_negative(parse_integer(&line)?);
                        self.expected = self.expected.saturating_add(count);
                        self.index += 1;
                        continue;
                    }
                    b'+' | b'-' | b':' => {
                        self.index += 1;
                        continue;
                    }
                    other => return Err(Error::Unknown(other)),
                }
            }

            if let Progress::AwaitingBody(length) = self.progress {
                reader
                    .read(out, length + CRLF.len())
                    .map_err(try_again)?;
                if !out.as_slice().ends_with(CRLF) {
                    return Err(Error::Protocol("expected CRLF after bulk string"));
                }

                self.index += 1;
                self.progress = Progress::AwaitingLength;
            }
        }

        Ok(())
    }
}

/// Reads one `\n` terminated line, terminator included.
fn read_line(reader: &mut BufferReader) -> Result<SharedBuffer, Error> {
    let mut line = SharedBuffer::new();
    reader.read_until(&mut line, b"\n", 1).map_err(try_again)?;
    Ok(line)
}

/// Parses the decimal integer between the marker byte and the line terminator.
fn parse_integer(line: &SharedBuffer) -> Result<i64, Error> {
    let digits = line.as_slice().get(1..).unwrap_or_default();
    let digits = digits
        .strip_suffix(b"\n")
        .map(|digits| digits.strip_suffix(b"\r").unwrap_or(digits))
        .unwrap_or(digits);

    // An optional minus, then decimal digits only. `str::parse` would also take a leading `+`.
    let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.iter().all(u8::is_ascii_digit) {
        return Err(Error::Protocol("invalid integer field"));
    }

    str::from_utf8(digits)
        .ok()
        .and_then(|digits| digits.parse::<i64>().ok())
        .ok_or(Error::Protocol("invalid integer field"))
}

fn own_arg(arg: SharedBuffer) -> SharedBuffer {
    if arg.len() < BIG_ARG_LEN {
        SharedBuffer::from_bytes(arg.as_slice())
    } else {
        arg
    }
}

fn bulk_length(length: i64, limits: &Limits) -> Result<usize, Error> {
    usize::try_from(length)
        .ok()
        .filter(|length| *length <= limits.max_bulk_len)
        .ok_or(Error::Protocol("invalid bulk length"))
}

fn non_negative(count: i64) -> usize {
    usize::try_from(count).unwrap_or(0)
}

fn expect_crlf(body: &SharedBuffer) -> Result<(), Error> {
    if body.as_slice().ends_with(CRLF) {
        Ok(())
    } else {
        Err(Error::Protocol("expected CRLF after bulk string"))
    }
}

// Missing bytes all mean the same thing to the caller: wait for the socket and call again.
fn try_again(err: Error) -> Error {
    match err {
        Error::NotFound | Error::OutOfBound => Error::TryAgain,
        err => err,
    }
}
