//! Line-oriented console input for the binaries.
//!
//! Lines are read on a plain thread and handed to the async tick loop over
//! a Tokio channel. Blank lines are skipped; end of input or a closed
//! channel ends the reader.

use std::io::{BufRead, Write};
use std::thread::JoinHandle;

use tokio::sync::mpsc;

/// Prompt printed before each line is read.
pub const PROMPT: &str = "] ";

/// Reads trimmed lines from `input` into `tx` until end of input, a read
/// error, or the receiver going away. Returns the number of lines sent.
pub fn read_lines<R: BufRead, W: Write>(
    mut input: R,
    mut prompt: W,
    tx: &mpsc::Sender<String>,
) -> usize {
    let mut sent = 0;
    loop {
        let _ = write!(prompt, "{PROMPT}");
        let _ = prompt.flush();
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if tx.blocking_send(line.to_string()).is_err() {
            break;
        }
        sent += 1;
    }
    sent
}

/// Spawns a thread feeding stdin lines into a new channel.
pub fn spawn_stdin_reader(capacity: usize) -> (mpsc::Receiver<String>, JoinHandle<usize>) {
    let (tx, rx) = mpsc::channel(capacity);
    let handle = std::thread::spawn(move || {
        let stdin = std::io::stdin();
        read_lines(stdin.lock(), std::io::stdout(), &tx)
    });
    (rx, handle)
}
