//! Trace log parser.
//!
//! Layout of one segment:
//!
//! ```text
//! testsplit
//! <test title>
//! <test file>                                   (optional)
//! call,<file>,<function>,<line>
//! return,<file>,<function>,<line>,<return line>
//! ```
//!
//! Lines before the first boundary are setup noise and ignored.

use super::{EventKind, TestTrace, TraceError, TraceEvent, BOUNDARY, END_SENTINEL};

enum State {
    Preamble,
    Title,
    FileOrRecord,
    Records,
}

/// Parse a complete trace log into per-test segments, in log order.
pub fn parse_log(text: &str) -> Result<Vec<TestTrace>, TraceError> {
    let mut traces = Vec::new();
    let mut current: Option<TestTrace> = None;
    let mut state = State::Preamble;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches('\r');
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == END_SENTINEL {
            break;
        }
        if trimmed == BOUNDARY {
            traces.extend(current.take());
            state = State::Title;
            continue;
        }

        let line_number = idx + 1;
        match state {
            State::Preamble => {}
            State::Title => {
                current = Some(TestTrace {
                    title: line.to_string(),
                    test_file: None,
                    events: Vec::new(),
                });
                state = State::FileOrRecord;
            }
            State::FileOrRecord => {
                if let Some(trace) = current.as_mut() {
                    if is_record(trimmed) {
                        trace.events.push(parse_record(trimmed, line_number)?);
                    } else {
                        trace.test_file = Some(trimmed.to_string());
                    }
                }
                state = State::Records;
            }
            State::Records => {
                let event = parse_record(trimmed, line_number)?;
                if let Some(trace) = current.as_mut() {
                    trace.events.push(event);
                }
            }
        }
    }

    traces.extend(current);
    Ok(traces)
}

fn is_record(line: &str) -> bool {
    line.starts_with("call,") || line.starts_with("return,")
}

fn parse_record(line: &str, line_number: usize) -> Result<TraceEvent, TraceError> {
    let malformed = || TraceError::MalformedTraceRecord {
        line_number,
        record: line.to_string(),
    };

    let (kind, rest) = line.split_once(',').ok_or_else(malformed)?;
    let (kind, rest, return_line) = match kind {
        "call" => (EventKind::Call, rest, None),
        "return" => {
            let (rest, ret) = rest.rsplit_once(',').ok_or_else(malformed)?;
            let ret = parse_line_number(ret).ok_or_else(malformed)?;
            (EventKind::Return, rest, Some(ret))
        }
        _ => return Err(malformed()),
    };

    let (rest, entry) = rest.rsplit_once(',').ok_or_else(malformed)?;
    let entry = parse_line_number(entry).ok_or_else(malformed)?;
    let (file, function) = rest.rsplit_once(',').ok_or_else(malformed)?;
    if file.trim().is_empty() {
        return Err(malformed());
    }

    Ok(TraceEvent {
        kind,
        file: file.trim().to_string(),
        function: function.trim().to_string(),
        line: entry,
        return_line,
    })
}

fn parse_line_number(raw: &str) -> Option<u32> {
    raw.trim().parse::<u32>().ok().filter(|&n| n >= 1)
}
