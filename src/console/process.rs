//! Console channel backed by a child process's stdio.
//!
//! Works for both backends: QEMU with `-serial mon:stdio` exposes the
//! guest serial port on the child's pipes, and `virsh console` is itself
//! a child process bridging to the domain's pty.
//!
//! # Why chunks, not lines
//!
//! Prompts worth waiting for usually do not end in a newline
//! (`alpine login: `, `localhost:~# `). A line-buffered reader would sit
//! on them forever. The reader thread therefore forwards raw chunks as
//! they arrive and matching runs over an accumulated window, the way an
//! interactive user reads the screen.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use super::{strip_ansi, ChannelError, ConsoleChannel};

/// How often the expect loop wakes to re-check deadlines.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// [`ConsoleChannel`] over a child process's piped stdin/stdout.
pub struct ProcessConsole {
    stdin: Option<ChildStdin>,
    rx: Receiver<String>,
    /// Output already stripped and normalized but not yet consumed by a
    /// match. Matches drain this from the front.
    pending: String,
    /// Tail of the current unterminated console line.
    partial: String,
    transcript: Vec<String>,
    /// Set when the console itself owns the bridge process.
    owned: Option<Child>,
    closed: bool,
}

impl ProcessConsole {
    /// Attach to a child whose lifetime the caller manages (QEMU: the
    /// child *is* the VM). Takes the child's stdin and stdout pipes.
    pub fn attach(child: &mut Child) -> Result<Self, ChannelError> {
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        Ok(Self::from_pipes(stdin, stdout, None))
    }

    /// Take ownership of a bridge process (for example `virsh console`).
    /// The process is killed and reaped when the channel closes.
    pub fn adopt(mut child: Child) -> Result<Self, ChannelError> {
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        Ok(Self::from_pipes(stdin, stdout, Some(child)))
    }

    fn from_pipes(stdin: ChildStdin, stdout: ChildStdout, owned: Option<Child>) -> Self {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || reader_thread(stdout, tx));
        Self {
            stdin: Some(stdin),
            rx,
            pending: String::new(),
            partial: String::new(),
            transcript: Vec::new(),
            owned,
            closed: false,
        }
    }

    /// Fold a raw chunk into the match window and the transcript.
    fn ingest(&mut self, raw: &str) {
        let clean = strip_ansi(raw).replace("\r\n", "\n").replace('\r', "\n");
        self.pending.push_str(&clean);
        self.partial.push_str(&clean);
        while let Some(pos) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=pos).collect();
            self.transcript.push(line.trim_end_matches('\n').to_string());
        }
    }

    /// If `pattern` is in the window, consume through the end of the
    /// match and return the consumed text.
    fn take_match(&mut self, pattern: &str) -> Option<String> {
        let pos = self.pending.find(pattern)?;
        let end = pos + pattern.len();
        Some(self.pending.drain(..end).collect())
    }
}

impl ConsoleChannel for ProcessConsole {
    fn send_line(&mut self, text: &str) -> Result<(), ChannelError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(ChannelError::Closed);
        };
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        match stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(ChannelError::Closed),
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    fn expect(&mut self, pattern: &str, timeout: Duration) -> Result<String, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let start = Instant::now();
        loop {
            if let Some(seen) = self.take_match(pattern) {
                return Ok(seen);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(ChannelError::Timeout {
                    pattern: pattern.to_string(),
                    elapsed,
                });
            }
            match self.rx.recv_timeout(POLL_INTERVAL.min(timeout - elapsed)) {
                Ok(chunk) => self.ingest(&chunk),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Reader is gone; whatever it sent is already in the
                    // window, so one last scan decides.
                    return match self.take_match(pattern) {
                        Some(seen) => Ok(seen),
                        None => Err(ChannelError::Closed),
                    };
                }
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Dropping our write end sends EOF to the guest side.
        self.stdin = None;
        if let Some(mut child) = self.owned.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if !self.partial.is_empty() {
            let tail = std::mem::take(&mut self.partial);
            self.transcript.push(tail);
        }
    }

    fn transcript(&self) -> &[String] {
        &self.transcript
    }
}

impl Drop for ProcessConsole {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_thread(mut stdout: ChildStdout, tx: Sender<String>) {
    let mut buf = [0u8; 4096];
    loop {
        match stdout.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send(chunk).is_err() {
                    break;
                }
            }
        }
    }
}

fn missing_pipe(which: &str) -> ChannelError {
    ChannelError::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        format!("child {which} is not piped"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn sh")
    }

    #[test]
    fn matches_prompt_without_trailing_newline() {
        let mut child = spawn_sh(
            r#"printf "alpine login: "; read u; printf "Welcome %s\n" "$u"; printf "alpine:~# ""#,
        );
        let mut console = ProcessConsole::attach(&mut child).unwrap();

        console.expect("login:", Duration::from_secs(5)).unwrap();
        console.send_line("root").unwrap();
        let seen = console.expect("alpine:~#", Duration::from_secs(5)).unwrap();
        assert!(seen.contains("Welcome root"), "got: {seen:?}");

        console.close();
        let _ = child.wait();
    }

    #[test]
    fn match_consumes_window_up_to_pattern_end() {
        let mut child = spawn_sh(r#"printf "one two three\n""#);
        let mut console = ProcessConsole::attach(&mut child).unwrap();

        let first = console.expect("one", Duration::from_secs(5)).unwrap();
        assert_eq!(first, "one");
        // "two" was already received; no new output is needed.
        let second = console.expect("two", Duration::from_secs(5)).unwrap();
        assert_eq!(second, " two");

        let _ = child.wait();
    }

    #[test]
    fn times_out_when_pattern_never_appears() {
        let mut child = spawn_sh("sleep 5");
        let mut console = ProcessConsole::attach(&mut child).unwrap();

        let start = Instant::now();
        let err = console
            .expect("never-printed", Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }), "got {err:?}");
        assert!(start.elapsed() >= Duration::from_millis(200));

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn reports_closed_after_child_exit() {
        let mut child = spawn_sh(r#"printf "done\n""#);
        let mut console = ProcessConsole::attach(&mut child).unwrap();

        console.expect("done", Duration::from_secs(5)).unwrap();
        let err = console
            .expect("anything-else", Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, ChannelError::Closed), "got {err:?}");

        let _ = child.wait();
    }

    #[test]
    fn close_is_idempotent_and_blocks_further_use() {
        let mut child = spawn_sh("sleep 5");
        let mut console = ProcessConsole::attach(&mut child).unwrap();

        console.close();
        console.close();
        assert!(matches!(
            console.send_line("hello"),
            Err(ChannelError::Closed)
        ));
        assert!(matches!(
            console.expect("x", Duration::from_millis(50)),
            Err(ChannelError::Closed)
        ));

        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn transcript_keeps_full_lines_and_flushes_tail_on_close() {
        let mut child = spawn_sh(r#"printf "first line\nsecond line\nno newline""#);
        let mut console = ProcessConsole::attach(&mut child).unwrap();

        console.expect("no newline", Duration::from_secs(5)).unwrap();
        console.close();
        let transcript = console.transcript();
        assert_eq!(transcript[0], "first line");
        assert_eq!(transcript[1], "second line");
        assert_eq!(transcript.last().unwrap(), "no newline");

        let _ = child.wait();
    }

    #[test]
    fn strips_escape_sequences_before_matching() {
        let mut child = spawn_sh(r#"printf "\033[1;32malpine\033[0m login: ""#);
        let mut console = ProcessConsole::attach(&mut child).unwrap();

        let seen = console
            .expect("alpine login:", Duration::from_secs(5))
            .unwrap();
        assert_eq!(seen, "alpine login:");

        let _ = child.wait();
    }

    #[test]
    fn adopted_child_is_reaped_promptly_on_close() {
        let child = spawn_sh("sleep 30");
        let mut console = ProcessConsole::adopt(child).unwrap();

        let start = Instant::now();
        console.close();
        // kill + wait, not a 30s sit.
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
