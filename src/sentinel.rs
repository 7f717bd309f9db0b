//! Prompt-sentinel protocol: detecting when an interactive shell is done.
//!
//! Each session binds a unique prompt string and frames every command with a
//! trailing `echo` of the exit status between fixed tags. Completion of a
//! command is then a pure byte-stream question: find the exit tag, then the
//! next prompt after it. The scanner re-examines the whole accumulated
//! buffer on every chunk, so matches that straddle read boundaries are
//! found regardless of how the PTY splits its output.

use std::ops::Range;
use std::sync::OnceLock;

use rand::Rng;
use regex::bytes::Regex as BytesRegex;

use crate::protocol::EXIT_CODE_UNKNOWN;

/// Fixed framing around the per-session random prompt nonce.
pub const PROMPT_PREFIX: &str = "SHELLPS1PREFIX";
pub const PROMPT_SUFFIX: &str = "SHELLPS1SUFFIX";

/// Tags around the `$?` echo that closes every framed command.
pub const EXIT_TAG_PRE: &str = "__EXIT__";
pub const EXIT_TAG_POST: &str = "__END__";

fn exit_regex() -> &'static BytesRegex {
    static RE: OnceLock<BytesRegex> = OnceLock::new();
    RE.get_or_init(|| BytesRegex::new(r"__EXIT__(-?\d+)__END__").unwrap())
}

fn ansi_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    // CSI/OSC-style escape sequences emitted by terminals and line editors.
    RE.get_or_init(|| regex::Regex::new(r"\x1B[@-_][0-?]*[ -/]*[@-~]").unwrap())
}

fn resolved_tag_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"__EXIT__-?\d+__END__").unwrap())
}

/// Generate a fresh per-session prompt: prefix, 16 hex chars, suffix.
pub fn fresh_prompt() -> String {
    let nonce: u64 = rand::thread_rng().gen();
    format!("{PROMPT_PREFIX}{nonce:016x}{PROMPT_SUFFIX}")
}

/// Frame a user command so its exit status lands in-band on the stream.
pub fn frame_command(command: &str) -> String {
    let command = command.trim_end_matches('\n');
    format!("{command} ; echo \"{EXIT_TAG_PRE}$?{EXIT_TAG_POST}\"\n")
}

/// Shell statements that pin the prompt variables for a session.
///
/// Re-run after sourcing startup files, which frequently overwrite `PS1`.
/// Terminal echo is switched off so submitted commands do not come back on
/// the output stream.
pub fn prompt_setup(prompt: &str) -> Vec<String> {
    vec![
        "stty -echo".to_string(),
        format!("export PS1='{prompt}'"),
        "export PS2=''".to_string(),
        "export PS0=''".to_string(),
        "unset PROMPT_COMMAND".to_string(),
    ]
}

/// Compile caller-supplied expect patterns.
pub fn compile_expects(patterns: &[String]) -> Result<Vec<BytesRegex>, regex::Error> {
    patterns.iter().map(|p| BytesRegex::new(p)).collect()
}

/// A finished framed command: exit code plus buffer offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub exit_code: i64,
    /// End of the command's own output (start of the exit tag).
    pub output_end: usize,
    /// End of the prompt match; everything before this is consumed.
    pub consumed: usize,
}

/// Which pattern terminated an expect-mode read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    /// Index into the caller's expect list.
    Expect(usize),
    /// The session's own prompt.
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectHit {
    pub source: MatchSource,
    pub start: usize,
    pub end: usize,
}

/// Accumulating scanner over the raw PTY byte stream.
#[derive(Debug)]
pub struct SentinelScanner {
    buf: Vec<u8>,
    prompt: Vec<u8>,
    prompt_re: BytesRegex,
}

impl SentinelScanner {
    pub fn new(prompt: &str) -> Self {
        let prompt_re = BytesRegex::new(&regex::escape(prompt)).expect("literal prompt regex");
        Self {
            buf: Vec::new(),
            prompt: prompt.as_bytes().to_vec(),
            prompt_re,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Drop everything up to `upto`, keeping later bytes for the next read.
    pub fn consume(&mut self, upto: usize) {
        self.buf.drain(..upto.min(self.buf.len()));
    }

    fn prompt_match(&self, from: usize) -> Option<Range<usize>> {
        self.prompt_re
            .find(&self.buf[from..])
            .map(|m| from + m.start()..from + m.end())
    }

    /// Locate the next prompt occurrence, if any.
    pub fn find_prompt(&self) -> Option<Range<usize>> {
        self.prompt_match(0)
    }

    /// Locate the `n`-th prompt occurrence (1-indexed).
    ///
    /// A framed payload of N input lines produces N prompts; seeing the last
    /// one without an exit tag means the shell aborted the command list.
    pub fn find_nth_prompt(&self, n: usize) -> Option<Range<usize>> {
        if n == 0 {
            return None;
        }
        self.prompt_re
            .find_iter(&self.buf)
            .nth(n - 1)
            .map(|m| m.start()..m.end())
    }

    /// Completion of a framed command: exit tag followed by the prompt.
    pub fn find_completion(&self) -> Option<Completion> {
        let caps = exit_regex().captures(&self.buf)?;
        let whole = caps.get(0)?;
        let code = caps.get(1)?;
        let prompt = self.prompt_match(whole.end())?;
        let exit_code = std::str::from_utf8(code.as_bytes())
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(EXIT_CODE_UNKNOWN);
        Some(Completion {
            exit_code,
            output_end: whole.start(),
            consumed: prompt.end,
        })
    }

    /// Earliest match among the caller's expect patterns and the prompt.
    ///
    /// On a tie the expect pattern wins, matching the order in which callers
    /// list their patterns ahead of the prompt.
    pub fn find_first(&self, expects: &[BytesRegex]) -> Option<ExpectHit> {
        let mut best: Option<ExpectHit> = None;
        for (i, re) in expects.iter().enumerate() {
            if let Some(m) = re.find(&self.buf) {
                let hit = ExpectHit {
                    source: MatchSource::Expect(i),
                    start: m.start(),
                    end: m.end(),
                };
                if best.map_or(true, |b| hit.start < b.start) {
                    best = Some(hit);
                }
            }
        }
        if let Some(range) = self.find_prompt() {
            let hit = ExpectHit {
                source: MatchSource::Prompt,
                start: range.start,
                end: range.end,
            };
            if best.map_or(true, |b| hit.start < b.start) {
                best = Some(hit);
            }
        }
        best
    }

    pub fn prompt_str(&self) -> String {
        String::from_utf8_lossy(&self.prompt).into_owned()
    }
}

/// Clean up a raw output slice for the caller.
///
/// Strips terminal escape sequences, normalizes line endings, removes every
/// occurrence of the prompt and exit tags, drops the echoed command line
/// when present, and trims surrounding whitespace.
pub fn normalize_output(raw: &[u8], prompt: &str, command: Option<&str>) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = ansi_regex().replace_all(&text, "");
    let mut text = text.replace("\r\n", "\n").replace('\r', "");

    text = text.replace(prompt, "");
    // Remnants of the framing itself: the echoed trailer (when terminal echo
    // was still on) and any resolved exit tags from earlier deferred frames.
    text = text.replace(&format!(" ; echo \"{EXIT_TAG_PRE}$?{EXIT_TAG_POST}\""), "");
    text = resolved_tag_regex().replace_all(&text, "").into_owned();

    if let Some(command) = command {
        let echoed = command.lines().next().unwrap_or("").trim();
        if !echoed.is_empty() {
            let stripped = text.trim_start();
            if let Some(rest) = stripped.strip_prefix(echoed) {
                if rest.is_empty() || rest.starts_with('\n') {
                    text = rest.to_string();
                }
            }
        }
    }

    text.trim().to_string()
}
