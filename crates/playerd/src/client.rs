//! Interactive control client: relays prompt input to the daemon's FIFO.

use std::io::{self, Read, Write};

use crate::line::LineReader;

pub const PROMPT: &str = "Player> ";

const HELP: &str = "\
Commands sent to the daemon:
  play <file>   play a WAV or AU file, replacing the current one
  play, resume  resume paused playback
  pause         pause playback
  stop          stop playback
  status        write the player state to the daemon log
  exit          stop playback and shut the daemon down
Local commands:
  help, !help   show this text
  !exit         leave this prompt; the daemon keeps running
";

/// Why the relay loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEnd {
    /// `exit` was sent; the daemon is shutting down.
    DaemonExit,
    /// `!exit` was typed.
    Detached,
    /// Input reached end of file.
    InputClosed,
}

/// Read lines from `input`, answer local commands on `out`, forward the rest to `fifo`.
///
/// A failed write to `fifo` is returned as an error.
pub fn relay(
    input: impl Read,
    mut out: impl Write,
    mut fifo: impl Write,
    max_line_len: usize,
) -> io::Result<ClientEnd> {
    let mut lines = LineReader::new(input, max_line_len).keep_blank();
    writeln!(out, "Type \"help\" for the list of commands.")?;
    loop {
        out.write_all(PROMPT.as_bytes())?;
        out.flush()?;
        let Some(line) = lines.next_line()? else {
            out.write_all(b"\n")?;
            return Ok(ClientEnd::InputClosed);
        };
        let line = line.trim();
        match line {
            "" => continue,
            "help" | "!help" => out.write_all(HELP.as_bytes())?,
            "!exit" => return Ok(ClientEnd::Detached),
            local if local.starts_with('!') => {
                writeln!(out, "unknown local command: {local}")?;
            }
            _ => {
                fifo.write_all(format!("{line}\n").as_bytes())?;
                fifo.flush()?;
                let first = line.split_whitespace().next().unwrap_or_default();
                if first.eq_ignore_ascii_case("exit") {
                    return Ok(ClientEnd::DaemonExit);
                }
            }
        }
    }
}
