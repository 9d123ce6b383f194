use std::fmt;

use crate::buffer::SharedBuffer;
use crate::error::Error;

static CRLF: &[u8; 2] = b"\r\n";

/// One request: the verb followed by its arguments. Large arguments are windows over the bytes
/// they were parsed from, small ones own a copy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
    // 0 is the verb, 1..N the arguments.
    argv: Vec<SharedBuffer>,
}

impl Command {
    pub fn new() -> Command {
        Command::default()
    }

    pub fn name(&self) -> Option<&SharedBuffer> {
        self.argv.first()
    }

    /// The `index`-th argument after the verb.
    pub fn arg(&self, index: usize) -> Option<&SharedBuffer> {
        self.argv.get(index + 1)
    }

    /// Number of arguments after the verb.
    pub fn arg_count(&self) -> usize {
        self.argv.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    pub fn push_arg(&mut self, arg: SharedBuffer) {
        self.argv.push(arg);
    }

    pub fn reset(&mut self) {
        self.argv.clear();
    }

    /// Size of the multibulk rendering of this command.
    pub fn encoded_len(&self) -> usize {
        let header = 1 + self.argv.len().to_string().len() + CRLF.len();

        self.argv.iter().fold(header, |total, arg| {
            total + 1 + arg.len().to_string().len() + CRLF.len() + arg.len() + CRLF.len()
        })
    }

    /// Renders the command as `*<argc>\r\n` followed by `$<len>\r\n<bytes>\r\n` per argument.
    pub fn format_resp2(&self, out: &mut SharedBuffer) -> Result<(), Error> {
        out.append_capacity(self.encoded_len())?;

        out.append_slice(format!("*{}\r\n", self.argv.len()).as_bytes())?;
        for arg in &self.argv {
            out.append_slice(format!("${}\r\n", arg.len()).as_bytes())?;
            out.append_slice(arg.as_slice())?;
            out.append_slice(CRLF)?;
        }

        Ok(())
    }
}

impl<T: AsRef<[u8]>> FromIterator<T> for Command {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Command {
            argv: iter
                .into_iter()
                .map(|arg| SharedBuffer::from_bytes(arg.as_ref()))
                .collect(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", String::from_utf8_lossy(arg.as_slice()))?;
        }
        Ok(())
    }
}
