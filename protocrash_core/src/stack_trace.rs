use serde::{Deserialize, Serialize};

/// One parsed stack frame. Every field is optional because the four
/// supported formats expose different subsets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub frame_number: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
}

/// An ordered stack trace extracted from stderr.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_address: Option<String>,
}

impl StackTrace {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Innermost `n` frames, the ones dedup hashing cares about.
    pub fn top_frames(&self, n: usize) -> &[StackFrame] {
        &self.frames[..self.frames.len().min(n)]
    }

    /// Frames in order; finite and restartable.
    pub fn iter(&self) -> impl Iterator<Item = &StackFrame> {
        self.frames.iter()
    }
}

/// Parse a stack trace out of stderr.
///
/// Per line, formats are tried in order of preference: sanitizer
/// (`#N 0xADDR in fn file:line`), GDB (`#N 0xADDR in fn () at file:line`),
/// LLDB (``frame #N: 0xADDR mod`fn + off at file:line``), then Valgrind
/// (`==pid== at 0xADDR: fn (file:line)`). Unrecognized lines are skipped.
pub fn parse(stderr: &str) -> StackTrace {
    let mut trace = StackTrace::default();
    for line in stderr.lines() {
        if trace.crash_address.is_none() {
            trace.crash_address = parse_crash_address(line);
        }
        let frame = parse_gdb_frame(line)
            .or_else(|| parse_sanitizer_frame(line))
            .or_else(|| parse_lldb_frame(line))
            .or_else(|| parse_valgrind_frame(line));
        if let Some(mut frame) = frame {
            // Streams sometimes interleave several traces; keep the first.
            if frame.frame_number == 0 && !trace.frames.is_empty() {
                break;
            }
            frame.frame_number = trace.frames.len();
            trace.frames.push(frame);
        }
    }
    trace
}

fn parse_crash_address(line: &str) -> Option<String> {
    let idx = line.find("on address 0x")?;
    let addr = &line[idx + "on address ".len()..];
    let end = addr
        .find(|c: char| !c.is_ascii_hexdigit() && c != 'x')
        .unwrap_or(addr.len());
    Some(addr[..end].to_string())
}

fn frame_number(token: &str) -> Option<usize> {
    token.strip_prefix('#')?.parse().ok()
}

fn split_location(token: &str) -> (Option<String>, Option<u32>) {
    // `file.c:308` or `file.c:10:5`; the third component is a column.
    let mut parts = token.split(':');
    let file = parts.next().map(str::to_string);
    let line = parts.next().and_then(|p| p.parse().ok());
    (file, line)
}

/// `#0 0x49fd3b in handle_packet /src/server.c:23:9`
/// or `#1 0x7f3a12 in raise (/lib/libc.so.6+0x3ef68)`
fn parse_sanitizer_frame(line: &str) -> Option<StackFrame> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 || tokens[2] != "in" || !tokens[1].starts_with("0x") {
        return None;
    }
    let number = frame_number(tokens[0])?;
    let function = tokens[3].to_string();

    let mut source_file = None;
    let mut line_number = None;
    let mut offset = None;
    if let Some(last) = tokens.last().filter(|_| tokens.len() > 4) {
        if last.starts_with('(') && last.contains('+') {
            offset = Some(last.trim_matches(|c| c == '(' || c == ')').to_string());
        } else if last.contains(':') {
            let (file, line) = split_location(last);
            source_file = file;
            line_number = line;
        }
    }

    Some(StackFrame {
        frame_number: number,
        address: Some(tokens[1].to_string()),
        function: Some(function),
        source_file,
        line_number,
        offset,
    })
}

/// `#0  0x00007ffff7a9e000 in main () at test.c:10`
/// or `#2  0x0000000000400590 in _start ()`
fn parse_gdb_frame(line: &str) -> Option<StackFrame> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }
    let number = frame_number(tokens[0])?;
    if tokens[1].starts_with("0x") && tokens[2] == "in" {
        // GDB is distinguished from the sanitizer shape by the `()` argument
        // list after the function name.
        if tokens.get(4) != Some(&"()") {
            return None;
        }
        let (source_file, line_number) = match tokens.iter().position(|&t| t == "at") {
            Some(at) => tokens
                .get(at + 1)
                .map(|loc| split_location(loc))
                .unwrap_or((None, None)),
            None => (None, None),
        };
        return Some(StackFrame {
            frame_number: number,
            address: Some(tokens[1].to_string()),
            function: Some(tokens[3].to_string()),
            source_file,
            line_number,
            offset: None,
        });
    }
    None
}

/// ``frame #0: 0x0000000100000f50 demo`handle + 15 at demo.c:12``
fn parse_lldb_frame(line: &str) -> Option<StackFrame> {
    let rest = line.trim_start().strip_prefix("frame ")?;
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() < 3 {
        return None;
    }
    let number = frame_number(tokens[0].trim_end_matches(':'))?;
    if !tokens[1].starts_with("0x") {
        return None;
    }
    let function = tokens[2]
        .split('`')
        .nth(1)
        .map(str::to_string)
        .or_else(|| Some(tokens[2].to_string()));
    let (source_file, line_number) = match tokens.iter().position(|&t| t == "at") {
        Some(at) => tokens
            .get(at + 1)
            .map(|loc| split_location(loc))
            .unwrap_or((None, None)),
        None => (None, None),
    };
    Some(StackFrame {
        frame_number: number,
        address: Some(tokens[1].to_string()),
        function,
        source_file,
        line_number,
        offset: None,
    })
}

/// `==12345==    at 0x4C2AB80: malloc (vg_replace_malloc.c:299)`
fn parse_valgrind_frame(line: &str) -> Option<StackFrame> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with("==") {
        return None;
    }
    let body = trimmed.trim_start_matches(|c: char| c == '=' || c.is_ascii_digit());
    let body = body.trim_start();
    let body = body.strip_prefix("at ").or_else(|| body.strip_prefix("by "))?;

    let mut tokens = body.split_whitespace();
    let address = tokens.next()?.trim_end_matches(':');
    if !address.starts_with("0x") {
        return None;
    }
    let function = tokens.next().map(str::to_string);
    let (source_file, line_number) = match tokens.next() {
        Some(loc) => split_location(loc.trim_matches(|c| c == '(' || c == ')')),
        None => (None, None),
    };

    Some(StackFrame {
        // Valgrind lines carry no frame number; the sentinel keeps them from
        // being mistaken for the start of a second trace.
        frame_number: usize::MAX,
        address: Some(address.to_string()),
        function,
        source_file,
        line_number,
        offset: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sanitizer_trace() {
        let stderr = "\
==1234==ERROR: AddressSanitizer: heap-buffer-overflow on address 0x602000000014\n\
    #0 0x49fd3b in handle_packet /src/server.c:23:9\n\
    #1 0x4a01c2 in main /src/main.c:88\n\
    #2 0x7f3a12 in __libc_start_main (/lib/x86_64-linux-gnu/libc.so.6+0x27190)\n";

        let trace = parse(stderr);
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.crash_address.as_deref(), Some("0x602000000014"));

        let first = &trace.frames[0];
        assert_eq!(first.function.as_deref(), Some("handle_packet"));
        assert_eq!(first.source_file.as_deref(), Some("/src/server.c"));
        assert_eq!(first.line_number, Some(23));

        let last = &trace.frames[2];
        assert_eq!(last.function.as_deref(), Some("__libc_start_main"));
        assert!(last.offset.as_deref().unwrap().contains("libc"));
    }

    #[test]
    fn parses_gdb_trace() {
        let stderr = "\
#0  0x00007ffff7a9e000 in parse_header () at parser.c:10\n\
#1  0x00007ffff7a9d080 in __libc_start_main () at libc.c:308\n\
#2  0x0000000000400590 in _start ()\n";

        let trace = parse(stderr);
        assert_eq!(trace.len(), 3);
        assert_eq!(trace.frames[0].function.as_deref(), Some("parse_header"));
        assert_eq!(trace.frames[0].source_file.as_deref(), Some("parser.c"));
        assert_eq!(trace.frames[0].line_number, Some(10));
        assert_eq!(trace.frames[2].function.as_deref(), Some("_start"));
        assert_eq!(trace.frames[2].source_file, None);
    }

    #[test]
    fn parses_lldb_trace() {
        let stderr = "\
frame #0: 0x0000000100000f50 demo`handle + 15 at demo.c:12\n\
frame #1: 0x0000000100000f10 demo`main + 32 at demo.c:40\n";

        let trace = parse(stderr);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.frames[0].function.as_deref(), Some("handle"));
        assert_eq!(trace.frames[0].line_number, Some(12));
        assert_eq!(trace.frames[1].function.as_deref(), Some("main"));
    }

    #[test]
    fn parses_valgrind_trace() {
        let stderr = "\
==12345== Invalid read of size 4\n\
==12345==    at 0x4C2AB80: malloc (vg_replace_malloc.c:299)\n\
==12345==    by 0x400544: main (leak.c:8)\n";

        let trace = parse(stderr);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.frames[0].function.as_deref(), Some("malloc"));
        assert_eq!(
            trace.frames[0].source_file.as_deref(),
            Some("vg_replace_malloc.c")
        );
        assert_eq!(trace.frames[1].function.as_deref(), Some("main"));
        assert_eq!(trace.frames[1].line_number, Some(8));
    }

    #[test]
    fn top_frames_bounds_the_view() {
        let mut trace = StackTrace::default();
        for i in 0..10 {
            trace.frames.push(StackFrame {
                frame_number: i,
                address: None,
                function: Some(format!("fn{i}")),
                source_file: None,
                line_number: None,
                offset: None,
            });
        }
        assert_eq!(trace.top_frames(5).len(), 5);
        assert_eq!(trace.top_frames(5)[0].function.as_deref(), Some("fn0"));
        assert_eq!(trace.top_frames(100).len(), 10);
    }

    #[test]
    fn garbage_yields_an_empty_trace() {
        let trace = parse("Segmentation fault (core dumped)\nrandom noise\n");
        assert!(trace.is_empty());
        assert_eq!(trace.top_frames(5).len(), 0);
    }

    #[test]
    fn second_interleaved_trace_is_ignored() {
        let stderr = "\
    #0 0x1 in first /a.c:1\n\
    #1 0x2 in second /a.c:2\n\
    #0 0x3 in unrelated /b.c:1\n";
        let trace = parse(stderr);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.frames[1].function.as_deref(), Some("second"));
    }
}
